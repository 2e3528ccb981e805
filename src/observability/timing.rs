//! Scoped latency measurement

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::MetricsCollector;

/// Measures one call from creation until `finish`.
///
/// A scope dropped without being finished (early return, `?`, panic unwind)
/// is recorded as a failure.
#[must_use = "a dropped scope records a failed call"]
#[derive(Debug)]
pub struct TimedScope<'a> {
    collector: &'a MetricsCollector,
    operation: String,
    started: Instant,
    finished: bool,
}

impl<'a> TimedScope<'a> {
    pub(crate) fn new(collector: &'a MetricsCollector, operation: impl Into<String>) -> Self {
        Self {
            collector,
            operation: operation.into(),
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self, success: bool) -> Duration {
        self.complete(success)
    }

    pub fn succeed(self) -> Duration {
        self.finish(true)
    }

    pub fn fail(self) -> Duration {
        self.finish(false)
    }

    fn complete(&mut self, success: bool) -> Duration {
        let latency = self.started.elapsed();
        if !self.finished {
            self.finished = true;
            self.collector.record_call(&self.operation, latency, success);
        }
        latency
    }
}

impl Drop for TimedScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.complete(false);
        }
    }
}

impl MetricsCollector {
    /// Starts timing `operation`.
    pub fn start(&self, operation: impl Into<String>) -> TimedScope<'_> {
        TimedScope::new(self, operation)
    }

    /// Times a synchronous call, recording `Ok` as success. The result is
    /// returned untouched.
    pub fn timed<T, E>(
        &self,
        operation: impl Into<String>,
        call: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E> {
        let scope = self.start(operation);
        let result = call();
        scope.finish(result.is_ok());
        result
    }

    /// Async counterpart of [`timed`](Self::timed).
    pub async fn timed_async<T, E>(
        &self,
        operation: impl Into<String>,
        call: impl Future<Output = Result<T, E>>,
    ) -> Result<T, E> {
        let scope = self.start(operation);
        let result = call.await;
        scope.finish(result.is_ok());
        result
    }
}
