//! Lazily constructed, process-wide client handle
//!
//! Building an API client (credentials, TLS setup, connection pool) is the
//! expensive part, so request/response calls share one handle built on first
//! use. Long-lived streaming sessions get their own handle instead, so they
//! never hold up or get torn down by other callers.
//!
//! Once the shared handle exists, `shared_handle` only takes a read lock on
//! the slot. Readers never wait on each other or on the construction mutex;
//! they can only wait for the brief write that publishes or resets the handle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::{GateError, Result};

/// Builds client handles for the pool.
pub trait HandleFactory<H>: Send + Sync {
    fn create(&self) -> Result<H>;
}

impl<H, F> HandleFactory<H> for F
where
    F: Fn() -> Result<H> + Send + Sync,
{
    fn create(&self) -> Result<H> {
        self()
    }
}

pub struct ConnectionPool<H> {
    factory: Box<dyn HandleFactory<H>>,
    shared: RwLock<Option<Arc<H>>>,
    build_lock: Mutex<()>,
    constructions: AtomicUsize,
}

impl<H> std::fmt::Debug for ConnectionPool<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("initialized", &self.is_initialized())
            .field("constructions", &self.constructions())
            .finish()
    }
}

impl<H> ConnectionPool<H> {
    pub fn new(factory: impl HandleFactory<H> + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            shared: RwLock::new(None),
            build_lock: Mutex::new(()),
            constructions: AtomicUsize::new(0),
        }
    }

    /// The shared handle, built by the first caller.
    ///
    /// Concurrent first callers block on construction and then all receive
    /// the same `Arc`. A failed build leaves the pool empty so the next call
    /// tries again.
    pub fn shared_handle(&self) -> Result<Arc<H>> {
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let _building = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let handle = Arc::new(self.build()?);
        *self.shared.write().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        info!(
            constructions = self.constructions(),
            "Shared client handle initialized"
        );
        Ok(handle)
    }

    /// A fresh handle owned by the caller alone.
    pub fn ephemeral_handle(&self) -> Result<H> {
        let handle = self.build()?;
        debug!("Ephemeral client handle created");
        Ok(handle)
    }

    /// Forgets the shared handle; outstanding `Arc`s stay valid.
    pub fn reset(&self) {
        let _building = self.build_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self
            .shared
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("Shared client handle reset");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Handles built so far, shared and ephemeral.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    fn current(&self) -> Option<Arc<H>> {
        self.shared
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn build(&self) -> Result<H> {
        let handle = self.factory.create().map_err(|e| match e {
            wrapped @ GateError::HandleConstruction { .. } => wrapped,
            GateError::Operation(cause) => GateError::HandleConstruction { source: cause },
            other => GateError::handle_construction(other),
        })?;
        self.constructions.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }
}
