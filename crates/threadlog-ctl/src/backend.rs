//! Opening the configured backend.
//!
//! Both backends end up as a [`SqlStorage`]; the CLI only sees them as an
//! `Arc<dyn Storage>` so every command is written once.

use std::sync::Arc;

use threadlog_store::{
    DataApiFactory, EventStore, PgExecutor, ResourcePool, SqlStorage, Storage,
};

use crate::config::{BackendKind, CtlConfig};
use crate::error::CtlError;

/// The store a command runs against.
pub type CtlStore = EventStore<Arc<dyn Storage>>;

/// An open backend connection.
pub enum Backend {
    /// `sqlx` connection pool.
    Postgres(Arc<SqlStorage<PgExecutor>>),
    /// Data API clients behind a resource pool.
    DataApi(Arc<SqlStorage<ResourcePool<DataApiFactory>>>),
}

impl Backend {
    /// Connect to the backend named in `config`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the connection cannot be established.
    pub async fn connect(config: &CtlConfig) -> Result<Self, CtlError> {
        let tables = config.tables.names();
        match config.backend.kind {
            BackendKind::Postgres => {
                let executor = PgExecutor::connect(&config.backend.postgres()).await?;
                Ok(Self::Postgres(Arc::new(SqlStorage::new(executor, tables))))
            }
            BackendKind::DataApi => {
                let factory = DataApiFactory::new(config.backend.data_api.client());
                let pool = ResourcePool::new(factory, config.backend.retry.policy());
                tracing::info!(
                    endpoint = config.backend.data_api.endpoint,
                    max_attempts = config.backend.retry.max_attempts,
                    "Data API backend configured"
                );
                Ok(Self::DataApi(Arc::new(SqlStorage::new(pool, tables))))
            }
        }
    }

    /// The backend as engine storage.
    pub fn storage(&self) -> Arc<dyn Storage> {
        match self {
            Self::Postgres(storage) => Arc::clone(storage) as Arc<dyn Storage>,
            Self::DataApi(storage) => Arc::clone(storage) as Arc<dyn Storage>,
        }
    }

    /// A store over this backend with the configured settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Config`](threadlog_store::StoreError::Config)
    /// for unusable settings.
    pub fn store(&self, config: &CtlConfig) -> Result<CtlStore, CtlError> {
        Ok(EventStore::new(self.storage(), config.store.settings())?)
    }

    /// Release connections and pooled clients.
    pub async fn close(&self) {
        match self {
            Self::Postgres(storage) => storage.executor().close().await,
            Self::DataApi(storage) => {
                if let Err(e) = storage.executor().destroy().await {
                    tracing::warn!(error = %e, "Failed to dispose Data API clients");
                }
            }
        }
    }
}
