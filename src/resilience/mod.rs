//! Retry as tower middleware
//!
//! What this module provides
//! - `RetryLayer<C>` / `Retry<S, C>`: the loop from [`crate::retry`] around any
//!   `Service<Req, Error = BoxError>` whose requests can be cloned
//!
//! Implementation strategy
//! - Each call takes the readied inner service and leaves a clone behind, so
//!   the returned future owns its service across backoff sleeps and
//!   concurrent calls never wait on each other
//! - Failures go through an `ErrorClassifier<BoxError>` (by default the same
//!   typed-then-textual classification as the free functions)
//! - Permanent errors are returned unchanged; exhaustion is reported as a
//!   boxed `GateError::RetryExhausted` carrying the last cause
//!
//! Composition
//! - `MetricsLayer` outside `RetryLayer` in a `ServiceBuilder` records one
//!   metrics call per logical request, however many attempts it took
//!
//! Testing strategy
//! - Scripted `service_fn`s that fail in a fixed pattern (E E S) with paused time

use std::future::Future;
use std::pin::Pin;

use tokio::time::sleep;
use tower::{BoxError, Layer, Service, ServiceExt};
use tracing::{debug, info, warn};

use crate::error::GateError;
use crate::retry::{BoxErrorClassifier, ErrorClass, ErrorClassifier, RetryPolicy};

#[derive(Debug, Clone)]
pub struct RetryLayer<C = BoxErrorClassifier> {
    policy: RetryPolicy,
    classifier: C,
}

impl RetryLayer {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            classifier: BoxErrorClassifier,
        }
    }
}

impl<C> RetryLayer<C> {
    pub fn with_classifier(policy: RetryPolicy, classifier: C) -> Self {
        Self { policy, classifier }
    }
}

#[derive(Debug, Clone)]
pub struct Retry<S, C> {
    inner: S,
    policy: RetryPolicy,
    classifier: C,
}

impl<S, C> Layer<S> for RetryLayer<C>
where
    C: Clone,
{
    type Service = Retry<S, C>;
    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner,
            policy: self.policy.clone(),
            classifier: self.classifier.clone(),
        }
    }
}

impl<S, C, Req> Service<Req> for Retry<S, C>
where
    Req: Clone + Send + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    C: ErrorClassifier<BoxError> + Clone + 'static,
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
        let policy = self.policy.clone();
        let classifier = self.classifier.clone();
        // the readied service goes with this call; the clone stays behind
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        Box::pin(async move {
            let mut attempt: usize = 0;
            loop {
                let result = ServiceExt::ready(&mut inner)
                    .await?
                    .call(req.clone())
                    .await;
                let error = match result {
                    Ok(resp) => {
                        if attempt > 0 {
                            debug!("Request succeeded after {} attempts", attempt + 1);
                        }
                        return Ok(resp);
                    }
                    Err(e) => e,
                };

                if classifier.classify(&error) == ErrorClass::Permanent {
                    return Err(error);
                }
                if !policy.should_retry(attempt) {
                    warn!(
                        "Max retries ({}) exceeded. Last error: {}",
                        policy.max_retries(),
                        error
                    );
                    return Err(Box::new(GateError::RetryExhausted {
                        attempts: attempt + 1,
                        source: error,
                    }) as BoxError);
                }

                let delay = policy.delay_for(attempt);
                info!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Request failed: {}. Retrying in {:?}...",
                    error,
                    delay
                );
                sleep(delay).await;
                attempt += 1;
            }
        })
    }
}
