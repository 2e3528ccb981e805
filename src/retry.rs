//! Retry mechanism with exponential backoff
//!
//! Failures are sorted into two cases by an [`ErrorClassifier`]: transient
//! ones (timeouts, refused/reset connections, 429 and 502/503/504) are
//! retried after a growing delay, everything else is returned after the
//! first attempt.

use std::error::Error;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tower::BoxError;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{ApiError, GateError, RetryError};

/// HTTP statuses that signal an overloaded or rate-limiting upstream.
pub const TRANSIENT_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        self == ErrorClass::Transient
    }
}

/// Classify an error by walking its `source()` chain.
///
/// Typed causes are checked first and an [`ApiError`] anywhere in the chain
/// settles the question. Only when no typed cause is recognised does the
/// message text get inspected.
pub fn classify_error(error: &(dyn Error + 'static)) -> ErrorClass {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(class) = typed_class(err) {
            return class;
        }
        current = err.source();
    }

    if chain_messages(error).any(|msg| message_is_transient(&msg)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

pub fn classify<E: Error + 'static>(error: &E) -> ErrorClass {
    classify_error(error)
}

/// True for 429 responses and rate-limit wording anywhere in the chain.
pub fn is_rate_limited(error: &(dyn Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(api) = err.downcast_ref::<ApiError>() {
            return api.status_code() == Some(429);
        }
        if let Some(GateError::Operation(inner)) = err.downcast_ref::<GateError>() {
            return is_rate_limited(&**inner);
        }
        current = err.source();
    }
    chain_messages(error).any(|msg| message_is_rate_limit(&msg))
}

fn typed_class(err: &(dyn Error + 'static)) -> Option<ErrorClass> {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return Some(match api {
            ApiError::Connect { .. } | ApiError::Timeout { .. } | ApiError::ConnectionReset => {
                ErrorClass::Transient
            }
            ApiError::Status { code, .. } if TRANSIENT_STATUS_CODES.contains(code) => {
                ErrorClass::Transient
            }
            _ => ErrorClass::Permanent,
        });
    }

    // transparent variant hides the boxed cause from source()
    if let Some(GateError::Operation(inner)) = err.downcast_ref::<GateError>() {
        return Some(classify_error(&**inner));
    }

    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if matches!(
            io_err.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        ) {
            return Some(ErrorClass::Transient);
        }
    }

    if err.is::<tokio::time::error::Elapsed>() {
        return Some(ErrorClass::Transient);
    }

    None
}

fn chain_messages<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = String> + 'a {
    std::iter::successors(Some(error), |err| (*err).source())
        .map(|err| err.to_string().to_lowercase())
}

fn message_is_rate_limit(msg: &str) -> bool {
    msg.contains("429") || msg.contains("rate limit")
}

fn message_is_transient(msg: &str) -> bool {
    message_is_rate_limit(msg)
        || ["502", "503", "504", "timeout", "timed out"]
            .iter()
            .any(|needle| msg.contains(needle))
        || (msg.contains("connection") && (msg.contains("reset") || msg.contains("refused")))
}

/// Decides which failures the retry loop should try again.
pub trait ErrorClassifier<E: ?Sized>: Send + Sync {
    fn classify(&self, error: &E) -> ErrorClass;

    /// Only used to label retry logs.
    fn is_rate_limited(&self, _error: &E) -> bool {
        false
    }
}

/// [`classify_error`] for any concrete error type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl<E: Error + 'static> ErrorClassifier<E> for DefaultClassifier {
    fn classify(&self, error: &E) -> ErrorClass {
        classify_error(error)
    }

    fn is_rate_limited(&self, error: &E) -> bool {
        is_rate_limited(error)
    }
}

/// [`classify_error`] for `tower::BoxError`, which is not itself an `Error`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxErrorClassifier;

impl ErrorClassifier<BoxError> for BoxErrorClassifier {
    fn classify(&self, error: &BoxError) -> ErrorClass {
        classify_error(&**error)
    }

    fn is_rate_limited(&self, error: &BoxError) -> bool {
        is_rate_limited(&**error)
    }
}

impl<E, F> ErrorClassifier<E> for F
where
    E: ?Sized,
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// `min(base * 2^attempt, max)`, scaled by a random factor in `[0.5, 1.5]`
/// when `jitter` is set.
pub fn backoff_delay(attempt: usize, base: Duration, max: Duration, jitter: bool) -> Duration {
    // 2^63 already exceeds any useful max; keeps base == 0 away from 0 * inf
    let exponent = attempt.min(63) as i32;
    let capped = (base.as_secs_f64() * 2f64.powi(exponent)).min(max.as_secs_f64());
    let secs = if jitter {
        capped * rand::thread_rng().gen_range(0.5..=1.5)
    } else {
        capped
    };
    Duration::try_from_secs_f64(secs).unwrap_or(max)
}

/// A scheduled retry: `attempt` is the 1-based number of the attempt that
/// just failed, `delay` the pause before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt: usize,
    pub delay: Duration,
}

type RetryHook = dyn Fn(&RetryAttempt) + Send + Sync;

/// Bounds and backoff shape of a retry loop
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_retries(&self) -> usize {
        self.config.max_retries
    }

    /// Upper bound on total invocations.
    pub fn max_attempts(&self) -> usize {
        self.config.max_retries.saturating_add(1)
    }

    /// Whether another attempt may follow the failed zero-based `attempt`.
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.config.max_retries
    }

    /// Pause after the failed zero-based `attempt`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        backoff_delay(
            attempt,
            self.config.base_delay,
            self.config.max_delay,
            self.config.jitter,
        )
    }
}

enum Step<E> {
    Retry(RetryAttempt),
    Stop(RetryError<E>),
}

fn next_step<E, C>(
    policy: &RetryPolicy,
    classifier: &C,
    attempt: usize,
    error: E,
) -> Step<E>
where
    E: Display,
    C: ErrorClassifier<E> + ?Sized,
{
    if classifier.classify(&error) == ErrorClass::Permanent {
        debug!(error = %error, "Non-retryable error");
        return Step::Stop(RetryError::Permanent(error));
    }

    if !policy.should_retry(attempt) {
        warn!(
            attempts = attempt + 1,
            "Max retries ({}) exceeded. Last error: {}",
            policy.max_retries(),
            error
        );
        return Step::Stop(RetryError::Exhausted {
            attempts: attempt + 1,
            last: error,
        });
    }

    let retry = RetryAttempt {
        attempt: attempt + 1,
        delay: policy.delay_for(attempt),
    };
    let reason = if classifier.is_rate_limited(&error) {
        "rate limited"
    } else {
        "transient error"
    };
    info!(
        attempt = retry.attempt,
        delay_ms = retry.delay.as_millis() as u64,
        "Attempt {} failed ({}): {}. Retrying in {:?}...",
        retry.attempt,
        reason,
        error,
        retry.delay
    );
    Step::Retry(retry)
}

async fn run_async<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    classifier: &C,
    on_retry: Option<&RetryHook>,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: ErrorClassifier<E> + ?Sized,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return Ok(result);
            }
            Err(error) => match next_step(policy, classifier, attempt, error) {
                Step::Stop(err) => return Err(err),
                Step::Retry(retry) => {
                    if let Some(hook) = on_retry {
                        hook(&retry);
                    }
                    sleep(retry.delay).await;
                    attempt += 1;
                }
            },
        }
    }
}

fn run_sync<F, T, E, C>(
    policy: &RetryPolicy,
    classifier: &C,
    on_retry: Option<&RetryHook>,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
    C: ErrorClassifier<E> + ?Sized,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => {
                if attempt > 0 {
                    debug!("Operation succeeded after {} attempts", attempt + 1);
                }
                return Ok(result);
            }
            Err(error) => match next_step(policy, classifier, attempt, error) {
                Step::Stop(err) => return Err(err),
                Step::Retry(retry) => {
                    if let Some(hook) = on_retry {
                        hook(&retry);
                    }
                    std::thread::sleep(retry.delay);
                    attempt += 1;
                }
            },
        }
    }
}

/// Retry an async operation with exponential backoff
pub async fn retry_async<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    classifier: &C,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: ErrorClassifier<E> + ?Sized,
{
    run_async(policy, classifier, None, operation).await
}

/// Retry a synchronous operation, blocking the calling thread between attempts
pub fn retry_sync<F, T, E, C>(
    policy: &RetryPolicy,
    classifier: &C,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
    C: ErrorClassifier<E> + ?Sized,
{
    run_sync(policy, classifier, None, operation)
}

/// Builder for retry operations
pub struct RetryBuilder<C = DefaultClassifier> {
    config: RetryConfig,
    classifier: C,
    on_retry: Option<Box<RetryHook>>,
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryConfig::default(),
            classifier: DefaultClassifier,
            on_retry: None,
        }
    }
}

impl<C> RetryBuilder<C> {
    pub fn max_retries(mut self, max: usize) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.config.jitter = enabled;
        self
    }

    pub fn classifier<C2>(self, classifier: C2) -> RetryBuilder<C2> {
        RetryBuilder {
            config: self.config,
            classifier,
            on_retry: self.on_retry,
        }
    }

    /// Called before every backoff sleep.
    pub fn on_retry(mut self, hook: impl Fn(&RetryAttempt) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Box::new(hook));
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.clone())
    }

    pub async fn run_async<F, Fut, T, E>(self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        C: ErrorClassifier<E>,
    {
        let policy = self.policy();
        run_async(&policy, &self.classifier, self.on_retry.as_deref(), operation).await
    }

    pub fn run_sync<F, T, E>(self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Result<T, E>,
        E: Display,
        C: ErrorClassifier<E>,
    {
        let policy = self.policy();
        run_sync(&policy, &self.classifier, self.on_retry.as_deref(), operation)
    }
}
