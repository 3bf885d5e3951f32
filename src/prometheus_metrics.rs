use prometheus_client::{
    encoding::text::encode,
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use crate::error::ErrorKind;

pub struct PrometheusMetrics {
    registry: Registry,

    // Counters
    bootstrap_attempts: Counter,
    bootstrap_certified: Counter,
    bootstrap_failed: Counter,
    bootstrap_retries: Counter,
    pow_iterations: Counter,
    keys_generated: Counter,
    tokens_signed: Counter,
    errors: Family<Vec<(String, String)>, Counter>,

    // Histograms
    bootstrap_duration_ms: Histogram,
    pow_duration_ms: Histogram,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let bootstrap_attempts = Counter::default();
        let bootstrap_certified = Counter::default();
        let bootstrap_failed = Counter::default();
        let bootstrap_retries = Counter::default();
        let pow_iterations = Counter::default();
        let keys_generated = Counter::default();
        let tokens_signed = Counter::default();
        let errors = Family::<Vec<(String, String)>, Counter>::default();

        // Bootstrap includes two round trips plus the solve.
        let bootstrap_duration_ms = Histogram::new(
            [100.0, 250.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0].into_iter()
        );
        let pow_duration_ms = Histogram::new(
            [1.0, 10.0, 100.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0].into_iter()
        );

        registry.register(
            "device_auth_bootstrap_attempts",
            "Device bootstrap runs started",
            bootstrap_attempts.clone(),
        );
        registry.register(
            "device_auth_bootstrap_certified",
            "Device bootstrap runs that obtained a certificate",
            bootstrap_certified.clone(),
        );
        registry.register(
            "device_auth_bootstrap_failed",
            "Device bootstrap runs that ended in the failed state",
            bootstrap_failed.clone(),
        );
        registry.register(
            "device_auth_bootstrap_retries",
            "Bootstrap runs re-issued by the caller after a retryable failure",
            bootstrap_retries.clone(),
        );
        registry.register(
            "device_auth_pow_iterations",
            "Candidate nonces hashed by the proof-of-work solver",
            pow_iterations.clone(),
        );
        registry.register(
            "device_auth_keys_generated",
            "Device key pairs generated and persisted",
            keys_generated.clone(),
        );
        registry.register(
            "device_auth_tokens_signed",
            "Authorization tokens minted",
            tokens_signed.clone(),
        );
        registry.register(
            "device_auth_errors",
            "Errors by kind",
            errors.clone(),
        );
        registry.register(
            "device_auth_bootstrap_duration_ms",
            "Wall-clock duration of bootstrap runs in milliseconds",
            bootstrap_duration_ms.clone(),
        );
        registry.register(
            "device_auth_pow_duration_ms",
            "Proof-of-work solve time in milliseconds",
            pow_duration_ms.clone(),
        );

        Self {
            registry,
            bootstrap_attempts,
            bootstrap_certified,
            bootstrap_failed,
            bootstrap_retries,
            pow_iterations,
            keys_generated,
            tokens_signed,
            errors,
            bootstrap_duration_ms,
            pow_duration_ms,
        }
    }

    pub fn record_bootstrap(&self, duration_ms: u64, certified: bool) {
        self.bootstrap_attempts.inc();
        if certified {
            self.bootstrap_certified.inc();
        } else {
            self.bootstrap_failed.inc();
        }
        self.bootstrap_duration_ms.observe(duration_ms as f64);
    }

    pub fn record_retry(&self) {
        self.bootstrap_retries.inc();
    }

    pub fn record_pow(&self, iterations: u64, duration_ms: u64) {
        self.pow_iterations.inc_by(iterations);
        self.pow_duration_ms.observe(duration_ms as f64);
    }

    pub fn record_key_generated(&self) {
        self.keys_generated.inc();
    }

    pub fn record_token_signed(&self) {
        self.tokens_signed.inc();
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors
            .get_or_create(&vec![("kind".to_string(), kind.as_str().to_string())])
            .inc();
    }

    pub fn export_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}
