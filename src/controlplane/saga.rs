//! Compensating Actions
//!
//! A [`Saga`] collects the undo steps of a multi-step operation. Every
//! external side effect that happens before a required commit registers its
//! compensation here; the owner then either commits (discarding them) or
//! rolls back (running them newest first).
//!
//! A saga that is dropped without being settled, for example because the
//! task panicked, schedules its pending compensations on the current runtime.

use crate::error::{Error, Result};
use backoff::ExponentialBackoffBuilder;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default time spent retrying one compensation
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(5);

type Compensation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Step {
    name: String,
    action: Compensation,
}

/// Outcome of a rollback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub succeeded: usize,
    /// Names of compensations that still failed after retrying
    pub failed: Vec<String>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Ordered set of compensations for one operation
pub struct Saga {
    name: String,
    steps: Vec<Step>,
    retry_window: Duration,
    settled: bool,
}

impl std::fmt::Debug for Saga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Saga")
            .field("name", &self.name)
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            )
            .field("settled", &self.settled)
            .finish()
    }
}

impl Saga {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            retry_window: DEFAULT_RETRY_WINDOW,
            settled: false,
        }
    }

    /// Set how long a failing compensation is retried
    pub fn with_retry_window(mut self, window: Duration) -> Self {
        self.retry_window = window;
        self
    }

    /// Register an undo step
    ///
    /// The closure may be invoked more than once when it fails with a
    /// retryable error.
    pub fn on_rollback<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(saga = %self.name, step = %name, "Registered compensation");
        self.steps.push(Step {
            name,
            action: Arc::new(move || -> BoxFuture<'static, Result<()>> { Box::pin(action()) }),
        });
    }

    /// Number of registered compensations
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Discard every compensation; the operation succeeded
    pub fn commit(mut self) {
        self.settled = true;
        debug!(saga = %self.name, "Saga committed");
    }

    /// Run every compensation in reverse registration order
    ///
    /// Failures are logged and reported, never raised.
    pub async fn rollback(mut self) -> RollbackReport {
        self.settled = true;
        let steps = std::mem::take(&mut self.steps);
        run_compensations(&self.name, steps, self.retry_window).await
    }
}

impl Drop for Saga {
    fn drop(&mut self) {
        if self.settled || self.steps.is_empty() {
            return;
        }

        let steps = std::mem::take(&mut self.steps);
        let name = std::mem::take(&mut self.name);
        let window = self.retry_window;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    saga = %name,
                    pending = steps.len(),
                    "Saga dropped without settling, scheduling compensations"
                );
                handle.spawn(async move {
                    run_compensations(&name, steps, window).await;
                });
            }
            Err(_) => {
                error!(
                    critical = true,
                    saga = %name,
                    pending = steps.len(),
                    "Saga dropped outside a runtime, compensations lost"
                );
            }
        }
    }
}

async fn run_compensations(saga: &str, steps: Vec<Step>, window: Duration) -> RollbackReport {
    let mut report = RollbackReport::default();

    for step in steps.into_iter().rev() {
        match retry_step(&step, window).await {
            Ok(()) => {
                report.succeeded += 1;
                info!(saga, step = %step.name, "Compensation applied");
            }
            Err(e) => {
                error!(saga, step = %step.name, error = %e, "Compensation failed");
                report.failed.push(step.name);
            }
        }
    }

    report
}

async fn retry_step(step: &Step, window: Duration) -> Result<()> {
    let policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(window.min(Duration::from_millis(100)))
        .with_max_interval(window.max(Duration::from_millis(1)))
        .with_max_elapsed_time(Some(window))
        .build();

    backoff::future::retry(policy, || {
        let action = Arc::clone(&step.action);
        async move {
            action().await.map_err(|e: Error| {
                if e.is_retryable() {
                    warn!(step = %step.name, error = %e, "Compensation failed, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    })
    .await
}
