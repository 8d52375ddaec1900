//! Leasable executor handles for remote statement backends.
//!
//! A [`ResourcePool`] owns the handles an [`ExecutorFactory`] creates.
//! Callers lease a handle with [`ResourcePool::acquire`]; dropping the
//! [`Lease`] puts the handle back on the idle list. Every statement sent
//! through the pool (and every handle creation) runs under the pool's
//! [`RetryPolicy`].
//!
//! Lifecycle:
//!
//! - [`ResourcePool::dispose`] closes idle handles; the pool stays usable.
//! - [`ResourcePool::destroy`] closes idle handles and refuses any further
//!   lease. Handles still leased at that point are dropped when returned.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::retry::RetryPolicy;
use crate::storage::StatementExecutor;

/// Creates and closes executor handles.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// The pooled handle type.
    type Handle: StatementExecutor + 'static;

    /// Open a new handle.
    async fn create(&self) -> Result<Self::Handle, StoreError>;

    /// Close a handle that leaves the pool.
    async fn dispose(&self, handle: Self::Handle) -> Result<(), StoreError>;
}

/// Pool of executor handles with explicit lifecycle.
pub struct ResourcePool<F: ExecutorFactory> {
    factory: F,
    idle: Mutex<Vec<F::Handle>>,
    destroyed: AtomicBool,
    retry: RetryPolicy,
}

impl<F: ExecutorFactory> ResourcePool<F> {
    /// A pool creating handles through `factory`.
    pub fn new(factory: F, retry: RetryPolicy) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            retry,
        }
    }

    /// The factory handles are created with.
    pub const fn factory(&self) -> &F {
        &self.factory
    }

    /// Whether [`ResourcePool::destroy`] has been called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Number of handles waiting on the idle list.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or_default()
    }

    /// Lease an idle handle, or create one.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::PoolDestroyed`] after [`ResourcePool::destroy`],
    /// or the factory's error once the retry policy gives up.
    pub async fn acquire(&self) -> Result<Lease<'_, F>, StoreError> {
        if self.is_destroyed() {
            return Err(StoreError::PoolDestroyed);
        }
        if let Some(handle) = self.pop_idle() {
            return Ok(Lease::new(self, handle));
        }
        let handle = self.retry.run(|| self.factory.create()).await?;
        tracing::debug!("Created pooled executor handle");
        Ok(Lease::new(self, handle))
    }

    /// Lease without retrying creation; used inside an already retried call.
    async fn lease_once(&self) -> Result<Lease<'_, F>, StoreError> {
        if self.is_destroyed() {
            return Err(StoreError::PoolDestroyed);
        }
        let handle = match self.pop_idle() {
            Some(handle) => handle,
            None => self.factory.create().await?,
        };
        Ok(Lease::new(self, handle))
    }

    /// Return a leased handle to the idle list.
    pub fn release(&self, lease: Lease<'_, F>) {
        drop(lease);
    }

    /// Close every idle handle. The pool stays usable.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the factory; remaining idle
    /// handles are still closed.
    pub async fn dispose(&self) -> Result<(), StoreError> {
        let idle = self.drain_idle();
        let count = idle.len();
        let mut first_error = None;
        for handle in idle {
            if let Err(err) = self.factory.dispose(handle).await {
                tracing::warn!(error = %err, "Failed to dispose pooled executor handle");
                first_error.get_or_insert(err);
            }
        }
        if count > 0 {
            tracing::info!(count, "Disposed idle executor handles");
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Close every idle handle and refuse further leases. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by the factory while closing.
    pub async fn destroy(&self) -> Result<(), StoreError> {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::info!("Resource pool destroyed");
        }
        self.dispose().await
    }

    fn pop_idle(&self) -> Option<F::Handle> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn drain_idle(&self) -> Vec<F::Handle> {
        self.idle
            .lock()
            .map(|mut idle| std::mem::take(&mut *idle))
            .unwrap_or_default()
    }

    fn give_back(&self, handle: F::Handle) {
        if self.is_destroyed() {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            idle.push(handle);
        }
    }
}

#[async_trait]
impl<F: ExecutorFactory> StatementExecutor for ResourcePool<F> {
    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        self.retry
            .run(|| async move {
                let mut lease = self.lease_once().await?;
                let result = lease.execute(sql).await;
                if result.is_err() {
                    lease.discard().await;
                }
                result
            })
            .await
    }

    async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        self.retry
            .run(|| async move {
                let mut lease = self.lease_once().await?;
                let result = lease.fetch_json(sql).await;
                if result.is_err() {
                    lease.discard().await;
                }
                result
            })
            .await
    }
}

/// A handle leased from a [`ResourcePool`]; returned on drop.
pub struct Lease<'a, F: ExecutorFactory> {
    pool: &'a ResourcePool<F>,
    handle: Option<F::Handle>,
}

impl<'a, F: ExecutorFactory> Lease<'a, F> {
    const fn new(pool: &'a ResourcePool<F>, handle: F::Handle) -> Self {
        Self {
            pool,
            handle: Some(handle),
        }
    }

    /// Close the handle instead of returning it to the pool.
    pub async fn discard(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.pool.factory.dispose(handle).await {
                tracing::warn!(error = %err, "Failed to dispose discarded executor handle");
            }
        }
    }
}

impl<F: ExecutorFactory> Drop for Lease<'_, F> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.give_back(handle);
        }
    }
}

#[async_trait]
impl<F: ExecutorFactory> StatementExecutor for Lease<'_, F> {
    async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        match &self.handle {
            Some(handle) => handle.execute(sql).await,
            None => Err(StoreError::PoolDestroyed),
        }
    }

    async fn fetch_json(&self, sql: &str) -> Result<Vec<serde_json::Value>, StoreError> {
        match &self.handle {
            Some(handle) => handle.fetch_json(sql).await,
            None => Err(StoreError::PoolDestroyed),
        }
    }
}
