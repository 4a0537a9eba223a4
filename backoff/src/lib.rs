//! Retry with backoff for one-shot asynchronous operations.
//!
//! Two policies are provided on top of a jittered exponential backoff:
//!
//! - [`Backoff::retry_on_error`] retries while the error is classified as
//!   transient and fails fast on terminal errors. An optional fallback value
//!   replaces transient exhaustion (used for best-effort teardown calls).
//! - [`Backoff::retry_while_none`] treats an empty result as the retry
//!   signal.
//!
//! Both are bounded by an attempt cap and a wall-clock budget; exhausting
//! either yields [`RetryError::OperationTimeout`].
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]
use observability_deps::tracing::{info, warn};
use rand::prelude::*;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with jitter
///
/// See <https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/>
#[derive(Debug, Clone)]
#[allow(missing_copy_implementations)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,

    /// Maximum number of attempts (the initial call plus retries).
    pub max_attempts: usize,

    /// Wall-clock budget for the whole retry loop.
    pub budget: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
            base: 2.,
            max_attempts: 4,
            budget: Duration::from_secs(300),
        }
    }
}

/// Error after giving up retrying.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The attempt cap or the wall-clock budget was exhausted.
    OperationTimeout {
        /// Label of the operation that was retried.
        task_name: String,

        /// Number of attempts performed before giving up.
        attempts: usize,

        /// The last transient error observed, if the final attempt failed
        /// (as opposed to yielding an empty result).
        source: Option<E>,
    },

    /// The operation failed with an error that must not be retried.
    Terminal {
        /// The terminal error, unchanged.
        source: E,
    },
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OperationTimeout {
                task_name,
                attempts,
                source,
            } => {
                write!(
                    f,
                    "operation '{task_name}' timed out after {attempts} attempts"
                )?;
                if let Some(source) = source {
                    write!(f, ": {source}")?;
                }
                Ok(())
            }
            Self::Terminal { source } => write!(f, "{source}"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::OperationTimeout { source, .. } => source
                .as_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            Self::Terminal { source } => Some(source),
        }
    }
}

/// Retry result.
pub type RetryResult<T, E> = Result<T, RetryError<E>>;

/// [`Backoff`] can be created from a [`BackoffConfig`]
///
/// Consecutive calls to [`Backoff::next`] will return the next backoff interval
///
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
    max_attempts: usize,
    budget: Duration,
    rng: Option<Box<dyn RngCore + Sync + Send>>,
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("init_backoff", &self.init_backoff)
            .field("next_backoff_secs", &self.next_backoff_secs)
            .field("max_backoff_secs", &self.max_backoff_secs)
            .field("base", &self.base)
            .field("max_attempts", &self.max_attempts)
            .field("budget", &self.budget)
            .finish()
    }
}

impl Backoff {
    /// Create a new [`Backoff`] from the provided [`BackoffConfig`]
    pub fn new(config: &BackoffConfig) -> Self {
        Self::new_with_rng(config, None)
    }

    /// Creates a new `Backoff` with the optional `rng`
    ///
    /// Used [`rand::thread_rng()`] if no rng provided
    pub fn new_with_rng(
        config: &BackoffConfig,
        rng: Option<Box<dyn RngCore + Sync + Send>>,
    ) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
            max_attempts: config.max_attempts,
            budget: config.budget,
            rng,
        }
    }

    /// Returns the next backoff duration to wait for
    fn next(&mut self) -> Duration {
        let range = self.init_backoff..(self.next_backoff_secs * self.base);

        let rand_backoff = match self.rng.as_mut() {
            Some(rng) => rng.gen_range(range),
            None => thread_rng().gen_range(range),
        };

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        Duration::from_secs_f64(std::mem::replace(&mut self.next_backoff_secs, next_backoff))
    }

    /// Perform an async operation that retries with a backoff.
    ///
    /// The operation signals the outcome of each attempt through
    /// [`ControlFlow`]: `Break(Ok(_))` is success, `Break(Err(_))` is a
    /// terminal failure that is returned unchanged, and `Continue(_)` asks
    /// for another attempt (carrying the transient error, if there was one).
    ///
    /// The loop stops after `max_attempts` attempts or once the next sleep
    /// would cross the wall-clock budget, whichever comes first.
    pub async fn retry_with_backoff<F, F1, B, E>(
        &mut self,
        task_name: &str,
        mut do_stuff: F,
    ) -> RetryResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = ControlFlow<Result<B, E>, Option<E>>> + Send,
        E: std::error::Error + Send,
    {
        let deadline = Instant::now() + self.budget;
        let mut attempts = 0;

        loop {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = do_stuff();
            attempts += 1;

            let e = match do_stuff.await {
                ControlFlow::Break(Ok(b)) => break Ok(b),
                ControlFlow::Break(Err(e)) => break Err(RetryError::Terminal { source: e }),
                ControlFlow::Continue(e) => e,
            };

            if attempts >= self.max_attempts {
                break Err(RetryError::OperationTimeout {
                    task_name: task_name.to_string(),
                    attempts,
                    source: e,
                });
            }

            let backoff = self.next();
            if Instant::now() + backoff > deadline {
                break Err(RetryError::OperationTimeout {
                    task_name: task_name.to_string(),
                    attempts,
                    source: e,
                });
            }

            match &e {
                Some(e) => info!(
                    e=%e,
                    task_name,
                    backoff_secs = backoff.as_secs(),
                    "request encountered non-fatal error - backing off",
                ),
                None => info!(
                    task_name,
                    backoff_secs = backoff.as_secs(),
                    "request returned no result - backing off",
                ),
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Retry the operation while its error is classified as transient by
    /// `is_transient`; fail fast on terminal errors.
    ///
    /// If `fallback` is provided it replaces transient exhaustion, so the
    /// call degrades to a default value instead of failing. Terminal errors
    /// are never replaced.
    pub async fn retry_on_error<F, F1, B, E, C>(
        &mut self,
        task_name: &str,
        is_transient: C,
        fallback: Option<B>,
        mut op: F,
    ) -> RetryResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<B, E>> + Send,
        B: Send,
        E: std::error::Error + Send,
        C: Fn(&E) -> bool + Send + Sync,
    {
        let is_transient = &is_transient;
        let res = self
            .retry_with_backoff(task_name, move || {
                // first execute `F` and then use it, so we can avoid `F: Sync`.
                let do_stuff = op();

                async move {
                    match do_stuff.await {
                        Ok(b) => ControlFlow::Break(Ok(b)),
                        Err(e) if is_transient(&e) => ControlFlow::Continue(Some(e)),
                        Err(e) => ControlFlow::Break(Err(e)),
                    }
                }
            })
            .await;

        match (res, fallback) {
            (
                Err(RetryError::OperationTimeout {
                    task_name, attempts, ..
                }),
                Some(b),
            ) => {
                warn!(
                    task_name = task_name.as_str(),
                    attempts, "transient errors exhausted - using fallback value",
                );
                Ok(b)
            }
            (res, _) => res,
        }
    }

    /// Retry the operation while it yields no result.
    ///
    /// Transient errors (per `is_transient`) are retried as well; terminal
    /// errors fail fast. Succeeds with the first non-empty result.
    pub async fn retry_while_none<F, F1, B, E, C>(
        &mut self,
        task_name: &str,
        is_transient: C,
        mut op: F,
    ) -> RetryResult<B, E>
    where
        F: (FnMut() -> F1) + Send,
        F1: std::future::Future<Output = Result<Option<B>, E>> + Send,
        B: Send,
        E: std::error::Error + Send,
        C: Fn(&E) -> bool + Send + Sync,
    {
        let is_transient = &is_transient;
        self.retry_with_backoff(task_name, move || {
            // first execute `F` and then use it, so we can avoid `F: Sync`.
            let do_stuff = op();

            async move {
                match do_stuff.await {
                    Ok(Some(b)) => ControlFlow::Break(Ok(b)),
                    Ok(None) => ControlFlow::Continue(None),
                    Err(e) if is_transient(&e) => ControlFlow::Continue(Some(e)),
                    Err(e) => ControlFlow::Break(Err(e)),
                }
            }
        })
        .await
    }
}
