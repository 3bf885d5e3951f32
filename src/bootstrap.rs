// Start -> NonceReceived -> SolutionFound -> Certified, or Failed from any step.
// Nothing is retried here.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::backend::DeviceBackend;
use crate::canonical;
use crate::error::{CoreError, ErrorKind, ProofOfWorkError};
use crate::keystore::KeyStore;
use crate::metrics::MetricsCollector;
use crate::pow::PowPuzzle;
use crate::pow_worker::PowWorker;
use crate::types::{DeviceCertificate, PowSubmission, ProofOfWorkSolution};

pub const DEFAULT_POW_DIFFICULTY: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Start,
    NonceReceived {
        initiation_nonce: String,
    },
    SolutionFound {
        initiation_nonce: String,
        solution: ProofOfWorkSolution,
    },
    Certified {
        certificate: DeviceCertificate,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

impl BootstrapState {
    pub fn name(&self) -> &'static str {
        match self {
            BootstrapState::Start => "start",
            BootstrapState::NonceReceived { .. } => "nonce_received",
            BootstrapState::SolutionFound { .. } => "solution_found",
            BootstrapState::Certified { .. } => "certified",
            BootstrapState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BootstrapState::Certified { .. } | BootstrapState::Failed { .. })
    }
}

/// What a successful run hands back to the caller's session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapResult {
    pub certificate: DeviceCertificate,
    pub solution: ProofOfWorkSolution,
    pub pow_iterations: u64,
    pub elapsed_ms: u64,
}

pub struct DeviceBootstrap {
    backend: Arc<dyn DeviceBackend>,
    keystore: Arc<KeyStore>,
    worker: PowWorker,
    difficulty: u32,
    state: BootstrapState,
    history: Vec<BootstrapState>,
    metrics: Arc<MetricsCollector>,
}

impl DeviceBootstrap {
    pub fn new(backend: Arc<dyn DeviceBackend>, keystore: Arc<KeyStore>) -> Self {
        Self {
            backend,
            keystore,
            worker: PowWorker::new(),
            difficulty: DEFAULT_POW_DIFFICULTY,
            state: BootstrapState::Start,
            history: vec![BootstrapState::Start],
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_difficulty(mut self, difficulty: u32) -> Self {
        self.difficulty = difficulty;
        self
    }

    pub fn with_worker(mut self, worker: PowWorker) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    /// Every state the latest run passed through, starting with `Start`.
    pub fn history(&self) -> &[BootstrapState] {
        &self.history
    }

    pub async fn run(&mut self) -> Result<BootstrapResult, CoreError> {
        self.state = BootstrapState::Start;
        self.history = vec![BootstrapState::Start];
        let t0 = Instant::now();

        let result = self.drive(t0).await;
        let elapsed_ms = t0.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.metrics.record_bootstrap(elapsed_ms, true),
            Err(e) => {
                tracing::error!(kind = %e.kind(), error = %e, "device bootstrap failed");
                self.metrics.record_bootstrap(elapsed_ms, false);
                self.transition(BootstrapState::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn drive(&mut self, t0: Instant) -> Result<BootstrapResult, CoreError> {
        let keys = self.keystore.get_or_create().await?;
        let device_public_key = canonical::to_canonical_string(&keys.public_key)
            .map_err(|e| self.fail(ProofOfWorkError::Encoding(e.to_string()).into()))?;

        let initiation_nonce = self
            .backend
            .request_initiation_nonce(Utc::now().timestamp_millis())
            .await
            .map_err(|e| self.fail(e.into()))?;
        self.transition(BootstrapState::NonceReceived {
            initiation_nonce: initiation_nonce.clone(),
        });

        let outcome = self
            .worker
            .solve(PowPuzzle {
                initiation_nonce: initiation_nonce.clone(),
                device_public_key,
                difficulty: self.difficulty,
            })
            .await?;
        self.transition(BootstrapState::SolutionFound {
            initiation_nonce: initiation_nonce.clone(),
            solution: outcome.solution.clone(),
        });

        let submission = PowSubmission {
            initiation_nonce,
            pow_hash: outcome.solution.hash.clone(),
            pow_nonce: outcome.solution.nonce,
        };
        let certificate = self
            .backend
            .request_certificate(&submission)
            .await
            .map_err(|e| self.fail(e.into()))?;
        self.transition(BootstrapState::Certified {
            certificate: certificate.clone(),
        });

        Ok(BootstrapResult {
            certificate,
            solution: outcome.solution,
            pow_iterations: outcome.iterations,
            elapsed_ms: t0.elapsed().as_millis() as u64,
        })
    }

    // keystore and worker count their own failures
    fn fail(&self, err: CoreError) -> CoreError {
        self.metrics.record_error(err.kind());
        err
    }

    fn transition(&mut self, next: BootstrapState) {
        tracing::info!(from = self.state.name(), to = next.name(), "bootstrap transition");
        self.state = next.clone();
        self.history.push(next);
    }
}
