//! Request path composing cache, pool, retry and metrics
//!
//! A [`Gateway`] owns one instance of each service and is built once at
//! startup, then shared (usually in an `Arc`) with every request handler.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheInfo};
use crate::clock::{Clock, SystemClock};
use crate::config::{self, GateConfig};
use crate::error::{GateError, Result};
use crate::observability::MetricsCollector;
use crate::pool::{ConnectionPool, HandleFactory};
use crate::retry::{retry_async, DefaultClassifier, RetryPolicy};

/// One cacheable request/response call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Name the call is recorded under in metrics
    pub operation: String,
    /// Semantic cache key
    pub key: String,
    /// `None` uses the cache's default TTL
    pub ttl: Option<Duration>,
    pub force_refresh: bool,
}

impl FetchRequest {
    pub fn new(operation: impl Into<String>, key: impl ToString) -> Self {
        Self {
            operation: operation.into(),
            key: key.to_string(),
            ttl: None,
            force_refresh: false,
        }
    }

    pub fn ttl(mut self, ttl: impl Into<Duration>) -> Self {
        self.ttl = Some(ttl.into());
        self
    }

    pub fn force_refresh(mut self, force: bool) -> Self {
        self.force_refresh = force;
        self
    }
}

/// A fetched value and, when it came from the cache, its age.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub cache_info: Option<CacheInfo>,
}

impl<T> Fetched<T> {
    pub fn is_cached(&self) -> bool {
        self.cache_info.is_some()
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

#[derive(Debug)]
pub struct Gateway<H> {
    cache: Arc<Cache>,
    pool: Arc<ConnectionPool<H>>,
    metrics: Arc<MetricsCollector>,
    retry: RetryPolicy,
}

impl<H> Gateway<H> {
    pub fn builder(factory: impl HandleFactory<H> + 'static) -> GatewayBuilder<H> {
        GatewayBuilder::new(factory)
    }

    /// Gateway configured from `MDGATE_*` environment variables.
    pub fn from_env(factory: impl HandleFactory<H> + 'static) -> Result<Self> {
        Self::builder(factory).config(config::from_env()).build()
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<H>> {
        &self.pool
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Serves `request` from the cache, or runs `op` against the shared
    /// handle under the retry policy and caches a successful result.
    ///
    /// The call is recorded once in metrics whatever the number of attempts.
    /// A failure to write the cache is logged and otherwise ignored.
    pub async fn fetch<T, E, F, Fut>(&self, request: FetchRequest, mut op: F) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Arc<H>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        if let Some((value, info)) = self
            .cache
            .get_with_info::<T>(&request.key, request.force_refresh)
        {
            self.metrics.record_cache_hit();
            debug!(operation = %request.operation, key = %request.key, "served from cache");
            return Ok(Fetched {
                value,
                cache_info: Some(info),
            });
        }
        self.metrics.record_cache_miss();
        self.metrics.record_api_call();

        let scope = self.metrics.start(request.operation.as_str());
        let handle = self.pool.shared_handle()?;
        let result = retry_async(&self.retry, &DefaultClassifier, || op(handle.clone())).await;
        scope.finish(result.is_ok());
        let value = result?;

        if let Err(e) = self.cache.set(&request.key, &value, request.ttl) {
            warn!(key = %request.key, error = %e, "failed to cache response");
        }
        Ok(Fetched {
            value,
            cache_info: None,
        })
    }

    /// Runs a streaming session on a dedicated handle: no cache, no retry.
    pub async fn stream<T, E, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnOnce(H) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Error + Send + Sync + 'static,
    {
        self.metrics.record_api_call();
        let scope = self.metrics.start(operation);
        let handle = self.pool.ephemeral_handle()?;
        let result = op(handle).await;
        scope.finish(result.is_ok());
        result.map_err(|e| GateError::Operation(Box::new(e)))
    }
}

pub struct GatewayBuilder<H> {
    pool: ConnectionPool<H>,
    config: GateConfig,
    cache: Option<Arc<Cache>>,
    metrics: Option<Arc<MetricsCollector>>,
    retry: Option<RetryPolicy>,
    clock: Arc<dyn Clock>,
}

impl<H> GatewayBuilder<H> {
    pub fn new(factory: impl HandleFactory<H> + 'static) -> Self {
        Self {
            pool: ConnectionPool::new(factory),
            config: GateConfig::default(),
            cache: None,
            metrics: None,
            retry: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Settings for every service not supplied explicitly.
    pub fn config(mut self, config: GateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Clock for a cache built from config.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Gateway<H>> {
        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(Cache::with_clock(self.config.cache.clone(), self.clock)?),
        };
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::with_config(&self.config.metrics)));
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::new(self.config.retry.clone()));
        Ok(Gateway {
            cache,
            pool: Arc::new(self.pool),
            metrics,
            retry,
        })
    }
}
