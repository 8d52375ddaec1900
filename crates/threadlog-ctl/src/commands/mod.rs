//! Subcommand implementations.
//!
//! Every command receives an already opened [`CtlStore`] and prints its
//! result to stdout as JSON; progress goes through `tracing`.

pub mod export;
pub mod import;
pub mod replicate;

use serde::Serialize;
use threadlog_store::Storage as _;
use threadlog_types::{MaintenanceMode, ReplicationState};

use crate::backend::CtlStore;
use crate::error::CtlError;

/// Maintenance mode selected by a `--manual` flag.
pub const fn mode(manual: bool) -> MaintenanceMode {
    if manual {
        MaintenanceMode::Manual
    } else {
        MaintenanceMode::Auto
    }
}

/// Print `value` as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> Result<(), CtlError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Create the tables.
pub async fn init(store: &CtlStore) -> Result<(), CtlError> {
    store.init().await?;
    Ok(())
}

/// Drop every table of the store.
pub async fn drop_tables(store: &CtlStore, confirm: bool) -> Result<(), CtlError> {
    if !confirm {
        return Err(CtlError::Usage(
            "drop removes every event; pass --yes to confirm".to_owned(),
        ));
    }
    store.drop_tables().await?;
    tracing::warn!("Event store tables dropped");
    Ok(())
}

/// Freeze the store.
pub async fn freeze(store: &CtlStore) -> Result<(), CtlError> {
    store.freeze().await?;
    tracing::info!("Store frozen");
    Ok(())
}

/// Unfreeze the store.
pub async fn unfreeze(store: &CtlStore) -> Result<(), CtlError> {
    store.unfreeze().await?;
    tracing::info!("Store unfrozen");
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    frozen: bool,
    thread_count: u32,
    lanes_in_use: usize,
    replication: ReplicationState,
}

/// Print freeze, lane and replication status.
pub async fn status(store: &CtlStore) -> Result<(), CtlError> {
    let frozen = store.is_frozen().await?;
    let lanes_in_use = store.storage().load_thread_counters().await?.len();
    let replication = store.replication().replication_state().await?;
    print_json(&Status {
        frozen,
        thread_count: store.settings().thread_count,
        lanes_in_use,
        replication,
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use threadlog_store::{EventStore, MemoryStorage, StoreSettings};

    use super::*;

    fn memory_store() -> CtlStore {
        let storage: Arc<dyn threadlog_store::Storage> = Arc::new(MemoryStorage::new());
        EventStore::new(storage, StoreSettings::default().with_thread_count(4)).expect("store")
    }

    #[test]
    fn manual_flag_selects_manual_mode() {
        assert_eq!(mode(true), MaintenanceMode::Manual);
        assert_eq!(mode(false), MaintenanceMode::Auto);
    }

    #[tokio::test]
    async fn drop_requires_confirmation() {
        let store = memory_store();
        assert!(matches!(
            drop_tables(&store, false).await,
            Err(CtlError::Usage(_))
        ));
        drop_tables(&store, true).await.expect("drop");
    }

    #[tokio::test]
    async fn freeze_then_unfreeze() {
        let store = memory_store();
        freeze(&store).await.expect("freeze");
        assert!(store.is_frozen().await.expect("frozen"));
        assert!(freeze(&store).await.is_err());
        unfreeze(&store).await.expect("unfreeze");
        assert!(!store.is_frozen().await.expect("frozen"));
    }
}
