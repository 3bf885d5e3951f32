use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{ErrorKind, ProofOfWorkError};
use crate::metrics::MetricsCollector;
use crate::pow::{self, PowOutcome, PowPuzzle};

#[derive(Debug, Clone)]
pub struct PowWorker {
    deadline: Option<Duration>,
    metrics: Arc<MetricsCollector>,
}

impl Default for PowWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl PowWorker {
    pub fn new() -> Self {
        Self {
            deadline: None,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn submit(&self, puzzle: PowPuzzle) -> PowJob {
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        tracing::debug!(difficulty = puzzle.difficulty, "submitting proof-of-work puzzle");
        let handle = tokio::task::spawn_blocking(move || pow::solve_with_cancel(&puzzle, &flag));
        PowJob {
            handle: Some(handle),
            cancel,
            deadline: self.deadline,
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub async fn solve(&self, puzzle: PowPuzzle) -> Result<PowOutcome, ProofOfWorkError> {
        self.submit(puzzle).wait().await
    }
}

pub struct PowJob {
    handle: Option<JoinHandle<Result<PowOutcome, ProofOfWorkError>>>,
    cancel: Arc<AtomicBool>,
    deadline: Option<Duration>,
    metrics: Arc<MetricsCollector>,
}

impl PowJob {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn wait(mut self) -> Result<PowOutcome, ProofOfWorkError> {
        let result = self.join().await;
        match &result {
            Ok(out) => {
                tracing::info!(
                    nonce = out.solution.nonce,
                    iterations = out.iterations,
                    elapsed_ms = out.elapsed_ms,
                    "proof of work solved"
                );
                self.metrics.record_pow(out.iterations, out.elapsed_ms);
            }
            Err(e) => {
                tracing::warn!(error = %e, "proof of work did not complete");
                self.metrics.record_error(ErrorKind::ProofOfWork);
            }
        }
        result
    }

    async fn join(&mut self) -> Result<PowOutcome, ProofOfWorkError> {
        let Some(handle) = self.handle.take() else {
            return Err(ProofOfWorkError::Cancelled);
        };
        let joined = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    self.cancel();
                    return Err(ProofOfWorkError::DeadlineExceeded { deadline });
                }
            },
            None => handle.await,
        };
        joined.map_err(|e| ProofOfWorkError::WorkerFailed(e.to_string()))?
    }
}

impl Drop for PowJob {
    fn drop(&mut self) {
        self.cancel();
    }
}
