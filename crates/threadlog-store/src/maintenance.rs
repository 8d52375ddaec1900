//! Freeze/unfreeze protocol around bulk operations.
//!
//! A frozen store carries a marker that tells cooperating writers to hold
//! off while an export, import or replication run is in progress. The
//! marker is advisory: nothing in the engine refuses writes while it exists.
//!
//! In [`MaintenanceMode::Auto`] the bulk operations call
//! [`MaintenanceController::begin`] and [`MaintenanceController::end`]
//! themselves, ignoring a marker that is already in the requested state. In
//! [`MaintenanceMode::Manual`] those calls do nothing and the operator
//! freezes and unfreezes explicitly.

use threadlog_types::MaintenanceMode;

use crate::error::StoreError;
use crate::storage::Storage;

/// Outcome of a freeze or unfreeze request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The marker changed state.
    Changed,
    /// The marker was already in the requested state.
    Unchanged,
}

/// Drives the freeze marker of one store.
pub struct MaintenanceController<'a, S: ?Sized> {
    storage: &'a S,
    mode: MaintenanceMode,
}

impl<'a, S: Storage + ?Sized> MaintenanceController<'a, S> {
    /// A controller acting on `storage` in `mode`.
    pub const fn new(storage: &'a S, mode: MaintenanceMode) -> Self {
        Self { storage, mode }
    }

    /// The configured mode.
    pub const fn mode(&self) -> MaintenanceMode {
        self.mode
    }

    /// Freeze the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyFrozen`] if the store is frozen.
    pub async fn freeze(&self) -> Result<(), StoreError> {
        self.storage.freeze().await?;
        tracing::info!("Event store frozen");
        Ok(())
    }

    /// Unfreeze the store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyUnfrozen`] if the store is not frozen.
    pub async fn unfreeze(&self) -> Result<(), StoreError> {
        self.storage.unfreeze().await?;
        tracing::info!("Event store unfrozen");
        Ok(())
    }

    /// Whether the store is frozen.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the marker cannot be inspected.
    pub async fn is_frozen(&self) -> Result<bool, StoreError> {
        self.storage.is_frozen().await
    }

    /// Freeze before a bulk operation (auto mode only).
    ///
    /// # Errors
    ///
    /// Returns any storage error other than [`StoreError::AlreadyFrozen`].
    pub async fn begin(&self) -> Result<Transition, StoreError> {
        if self.mode == MaintenanceMode::Manual {
            return Ok(Transition::Unchanged);
        }
        match self.freeze().await {
            Ok(()) => Ok(Transition::Changed),
            Err(StoreError::AlreadyFrozen) => {
                tracing::debug!("Event store was already frozen");
                Ok(Transition::Unchanged)
            }
            Err(err) => Err(err),
        }
    }

    /// Unfreeze after a bulk operation (auto mode only).
    ///
    /// # Errors
    ///
    /// Returns any storage error other than [`StoreError::AlreadyUnfrozen`].
    pub async fn end(&self) -> Result<Transition, StoreError> {
        if self.mode == MaintenanceMode::Manual {
            return Ok(Transition::Unchanged);
        }
        match self.unfreeze().await {
            Ok(()) => Ok(Transition::Changed),
            Err(StoreError::AlreadyUnfrozen) => {
                tracing::debug!("Event store was already unfrozen");
                Ok(Transition::Unchanged)
            }
            Err(err) => Err(err),
        }
    }

    /// [`MaintenanceController::end`] for abort paths: failures are logged,
    /// never returned, so the original error reaches the caller.
    pub async fn end_quietly(&self) {
        if let Err(err) = self.end().await {
            tracing::error!(error = %err, "Failed to unfreeze event store after aborted operation");
        }
    }
}
