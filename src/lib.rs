//! # tower-mdgate
//!
//! Operational resilience for calls to a rate-limited, metered market-data API.
//! Four services sit between a request handler and the remote client:
//!
//! - **Cache**: file-backed JSON entries with per-entry expiry, keyed by the
//!   full query so a repeated question never costs a second API call
//! - **Retry**: a two-case (transient/permanent) classifier and exponential
//!   backoff with jitter, as free functions and as a tower layer
//! - **ConnectionPool**: one lazily built shared client handle, plus
//!   unshared handles for streaming sessions
//! - **MetricsCollector**: per-operation counts, success rate and latency
//!   percentiles, cache hit rate and API-call totals
//!
//! [`Gateway`] composes them into the usual read path. Every service is an
//! explicit value: build one of each at startup and share it by `Arc`.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use tower_mdgate::{ApiError, CacheKey, CacheTtl, FetchRequest, Gateway, GateError};
//!
//! struct Client;
//!
//! impl Client {
//!     async fn cost(&self, _dataset: &str) -> Result<f64, ApiError> {
//!         Ok(0.42)
//!     }
//! }
//!
//! # async fn example() -> Result<(), GateError> {
//! tower_mdgate::telemetry::init_from_env()?;
//! let gateway = Gateway::from_env(|| Ok::<_, GateError>(Client))?;
//!
//! let key = CacheKey::new("cost").part("GLBX.MDP3").sorted_list(["ESM4", "NQM4"]);
//! let request = FetchRequest::new("get_cost", key).ttl(CacheTtl::Intraday);
//! let fetched = gateway
//!     .fetch(request, |client| async move { client.cost("GLBX.MDP3").await })
//!     .await?;
//!
//! if let Some(info) = &fetched.cache_info {
//!     println!("{}", info.feedback());
//! }
//! println!("{}", serde_json::to_string_pretty(&gateway.metrics().snapshot())?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod observability;
pub mod pool;
pub mod resilience;
pub mod retry;
pub mod telemetry;

pub use cache::{Cache, CacheEntry, CacheInfo, CacheKey, CacheStatus, CacheTtl};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, ConfigBuilder, GateConfig, MetricsConfig, RetryConfig};
pub use error::{ApiError, GateError, Result, RetryError};
pub use gateway::{FetchRequest, Fetched, Gateway, GatewayBuilder};
pub use observability::{
    LatencySummary, MetricsCollector, MetricsLayer, MetricsSnapshot, TimedScope, ToolSnapshot,
};
pub use pool::{ConnectionPool, HandleFactory};
pub use resilience::RetryLayer;
pub use retry::{
    backoff_delay, classify, classify_error, is_rate_limited, retry_async, retry_sync,
    DefaultClassifier, ErrorClass, ErrorClassifier, RetryAttempt, RetryBuilder, RetryPolicy,
};
