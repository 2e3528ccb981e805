//! Tower middleware recording every call into a [`MetricsCollector`]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::Instant;
use tower::{BoxError, Layer, Service};
use tracing::{debug, info_span, Instrument};

use super::MetricsCollector;

/// Records latency and outcome of the wrapped service under one operation name.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    collector: Arc<MetricsCollector>,
    operation: Arc<str>,
}

impl MetricsLayer {
    pub fn new(collector: Arc<MetricsCollector>, operation: impl Into<Arc<str>>) -> Self {
        Self {
            collector,
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics<S> {
    inner: S,
    collector: Arc<MetricsCollector>,
    operation: Arc<str>,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = Metrics<S>;
    fn layer(&self, inner: S) -> Self::Service {
        Metrics {
            inner,
            collector: self.collector.clone(),
            operation: self.operation.clone(),
        }
    }
}

impl<S, Req> Service<Req> for Metrics<S>
where
    S: Service<Req, Error = BoxError> + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let collector = self.collector.clone();
        let operation = self.operation.clone();
        let span = info_span!("call", operation = %operation);
        let fut = self.inner.call(req).instrument(span);
        Box::pin(async move {
            let started = Instant::now();
            let result = fut.await;
            let latency = started.elapsed();
            collector.record_call(&operation, latency, result.is_ok());
            debug!(
                operation = %operation,
                latency_ms = latency.as_millis() as u64,
                success = result.is_ok(),
                "call recorded"
            );
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::error::ApiError;
    use crate::resilience::RetryLayer;
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn metrics_layer_updates_collector() {
        let collector = Arc::new(MetricsCollector::default());
        let inner = service_fn(|n: u32| async move {
            if n % 2 == 0 {
                Ok::<_, BoxError>(n * 10)
            } else {
                Err::<u32, BoxError>(Box::new(ApiError::status(400, "odd")))
            }
        });
        let mut svc = MetricsLayer::new(collector.clone(), "get_cost").layer(inner);

        for n in 0..4 {
            let _ = ServiceExt::ready(&mut svc).await.unwrap().call(n).await;
        }

        let tool = collector.snapshot().tools["get_cost"].clone();
        assert_eq!(tool.calls, 4);
        assert_eq!(tool.successes, 2);
        assert_eq!(tool.errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retried_request_counts_once() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        let collector = Arc::new(MetricsCollector::default());
        let inner = service_fn(|()| async move {
            if COUNT.fetch_add(1, Ordering::SeqCst) == 0 {
                Err::<&'static str, BoxError>(Box::new(ApiError::ConnectionReset))
            } else {
                Ok("bars")
            }
        });
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        });
        let mut svc = ServiceBuilder::new()
            .layer(MetricsLayer::new(collector.clone(), "get_historical"))
            .layer(RetryLayer::new(policy))
            .service(inner);

        let out = ServiceExt::ready(&mut svc).await.unwrap().call(()).await.unwrap();
        assert_eq!(out, "bars");

        let tool = collector.snapshot().tools["get_historical"].clone();
        assert_eq!(tool.calls, 1);
        assert_eq!(tool.successes, 1);
        assert!(tool.latency.min_ms >= 100.0);
    }
}
