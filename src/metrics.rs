use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::prometheus_metrics::PrometheusMetrics;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    // Bootstrap
    pub bootstrap_attempts: u64,
    pub bootstrap_certified: u64,
    pub bootstrap_failed: u64,
    pub bootstrap_retries: u64,
    pub consecutive_failures: u32,
    pub last_certified_secs: Option<u64>,

    // Proof of work
    pub pow_solves: u64,
    pub pow_iterations: u64,
    pub average_pow_time_ms: f64,
    pub min_pow_time_ms: u64,
    pub max_pow_time_ms: u64,

    // Keys and tokens
    pub keys_generated: u64,
    pub tokens_signed: u64,

    // Errors by kind
    pub storage_errors: u64,
    pub key_format_errors: u64,
    pub signing_errors: u64,
    pub token_verification_errors: u64,
    pub network_errors: u64,
    pub pow_errors: u64,
    pub config_errors: u64,

    pub uptime_seconds: u64,
}

/// Process-local counters shared by every component through an `Arc`.
#[derive(Debug)]
pub struct MetricsCollector {
    bootstrap_attempts: AtomicU64,
    bootstrap_certified: AtomicU64,
    bootstrap_failed: AtomicU64,
    bootstrap_retries: AtomicU64,
    consecutive_failures: AtomicU32,

    pow_solves: AtomicU64,
    pow_iterations: AtomicU64,
    pow_total_time_ms: AtomicU64,
    min_pow_time_ms: AtomicU64,
    max_pow_time_ms: AtomicU64,

    keys_generated: AtomicU64,
    tokens_signed: AtomicU64,

    storage_errors: AtomicU64,
    key_format_errors: AtomicU64,
    signing_errors: AtomicU64,
    token_verification_errors: AtomicU64,
    network_errors: AtomicU64,
    pow_errors: AtomicU64,
    config_errors: AtomicU64,

    start_time: Instant,
    last_certified: Mutex<Option<Instant>>,
    prometheus: Option<Arc<PrometheusMetrics>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            bootstrap_attempts: AtomicU64::new(0),
            bootstrap_certified: AtomicU64::new(0),
            bootstrap_failed: AtomicU64::new(0),
            bootstrap_retries: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            pow_solves: AtomicU64::new(0),
            pow_iterations: AtomicU64::new(0),
            pow_total_time_ms: AtomicU64::new(0),
            min_pow_time_ms: AtomicU64::new(u64::MAX),
            max_pow_time_ms: AtomicU64::new(0),
            keys_generated: AtomicU64::new(0),
            tokens_signed: AtomicU64::new(0),
            storage_errors: AtomicU64::new(0),
            key_format_errors: AtomicU64::new(0),
            signing_errors: AtomicU64::new(0),
            token_verification_errors: AtomicU64::new(0),
            network_errors: AtomicU64::new(0),
            pow_errors: AtomicU64::new(0),
            config_errors: AtomicU64::new(0),
            start_time: Instant::now(),
            last_certified: Mutex::new(None),
            prometheus: None,
        }
    }

    /// Mirror every recorded event into a Prometheus registry.
    pub fn with_prometheus(mut self, prometheus: Arc<PrometheusMetrics>) -> Self {
        self.prometheus = Some(prometheus);
        self
    }

    pub fn record_bootstrap(&self, duration_ms: u64, certified: bool) {
        self.bootstrap_attempts.fetch_add(1, Ordering::Relaxed);

        if certified {
            self.bootstrap_certified.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.store(0, Ordering::Relaxed);
            if let Ok(mut last) = self.last_certified.lock() {
                *last = Some(Instant::now());
            }
        } else {
            self.bootstrap_failed.fetch_add(1, Ordering::Relaxed);
            self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(prom) = &self.prometheus {
            prom.record_bootstrap(duration_ms, certified);
        }
    }

    pub fn record_retry(&self) {
        self.bootstrap_retries.fetch_add(1, Ordering::Relaxed);
        if let Some(prom) = &self.prometheus {
            prom.record_retry();
        }
    }

    pub fn record_pow(&self, iterations: u64, time_ms: u64) {
        self.pow_solves.fetch_add(1, Ordering::Relaxed);
        self.pow_iterations.fetch_add(iterations, Ordering::Relaxed);
        self.pow_total_time_ms.fetch_add(time_ms, Ordering::Relaxed);

        let mut current_min = self.min_pow_time_ms.load(Ordering::Relaxed);
        while time_ms < current_min {
            match self.min_pow_time_ms.compare_exchange_weak(
                current_min, time_ms, Ordering::Relaxed, Ordering::Relaxed
            ) {
                Ok(_) => break,
                Err(new_min) => current_min = new_min,
            }
        }

        let mut current_max = self.max_pow_time_ms.load(Ordering::Relaxed);
        while time_ms > current_max {
            match self.max_pow_time_ms.compare_exchange_weak(
                current_max, time_ms, Ordering::Relaxed, Ordering::Relaxed
            ) {
                Ok(_) => break,
                Err(new_max) => current_max = new_max,
            }
        }

        if let Some(prom) = &self.prometheus {
            prom.record_pow(iterations, time_ms);
        }
    }

    pub fn record_key_generated(&self) {
        self.keys_generated.fetch_add(1, Ordering::Relaxed);
        if let Some(prom) = &self.prometheus {
            prom.record_key_generated();
        }
    }

    pub fn record_token_signed(&self) {
        self.tokens_signed.fetch_add(1, Ordering::Relaxed);
        if let Some(prom) = &self.prometheus {
            prom.record_token_signed();
        }
    }

    pub fn record_error(&self, kind: ErrorKind) {
        let counter = match kind {
            ErrorKind::Storage => &self.storage_errors,
            ErrorKind::KeyFormat => &self.key_format_errors,
            ErrorKind::Signing => &self.signing_errors,
            ErrorKind::TokenVerification => &self.token_verification_errors,
            ErrorKind::BootstrapNetwork => &self.network_errors,
            ErrorKind::ProofOfWork => &self.pow_errors,
            ErrorKind::Config => &self.config_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(prom) = &self.prometheus {
            prom.record_error(kind);
        }
    }

    pub fn get_metrics(&self) -> Metrics {
        let pow_solves = self.pow_solves.load(Ordering::Relaxed);
        let pow_total_time_ms = self.pow_total_time_ms.load(Ordering::Relaxed);
        let min_pow_time_ms = self.min_pow_time_ms.load(Ordering::Relaxed);

        let average_pow_time_ms = if pow_solves > 0 {
            pow_total_time_ms as f64 / pow_solves as f64
        } else {
            0.0
        };

        let last_certified_secs = if let Ok(last) = self.last_certified.lock() {
            last.map(|time| time.duration_since(self.start_time).as_secs())
        } else {
            None
        };

        Metrics {
            bootstrap_attempts: self.bootstrap_attempts.load(Ordering::Relaxed),
            bootstrap_certified: self.bootstrap_certified.load(Ordering::Relaxed),
            bootstrap_failed: self.bootstrap_failed.load(Ordering::Relaxed),
            bootstrap_retries: self.bootstrap_retries.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            last_certified_secs,
            pow_solves,
            pow_iterations: self.pow_iterations.load(Ordering::Relaxed),
            average_pow_time_ms,
            min_pow_time_ms: if min_pow_time_ms == u64::MAX { 0 } else { min_pow_time_ms },
            max_pow_time_ms: self.max_pow_time_ms.load(Ordering::Relaxed),
            keys_generated: self.keys_generated.load(Ordering::Relaxed),
            tokens_signed: self.tokens_signed.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
            key_format_errors: self.key_format_errors.load(Ordering::Relaxed),
            signing_errors: self.signing_errors.load(Ordering::Relaxed),
            token_verification_errors: self.token_verification_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            pow_errors: self.pow_errors.load(Ordering::Relaxed),
            config_errors: self.config_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_bootstrap_outcomes() {
        let metrics = MetricsCollector::new();
        metrics.record_bootstrap(10, false);
        metrics.record_bootstrap(12, false);
        assert_eq!(metrics.get_metrics().consecutive_failures, 2);

        metrics.record_bootstrap(30, true);
        let snap = metrics.get_metrics();
        assert_eq!(snap.bootstrap_attempts, 3);
        assert_eq!(snap.bootstrap_certified, 1);
        assert_eq!(snap.bootstrap_failed, 2);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_certified_secs.is_some());
    }

    #[test]
    fn tracks_pow_timings() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.get_metrics().min_pow_time_ms, 0);

        metrics.record_pow(300, 40);
        metrics.record_pow(100, 20);
        let snap = metrics.get_metrics();
        assert_eq!(snap.pow_solves, 2);
        assert_eq!(snap.pow_iterations, 400);
        assert_eq!(snap.min_pow_time_ms, 20);
        assert_eq!(snap.max_pow_time_ms, 40);
        assert_eq!(snap.average_pow_time_ms, 30.0);
    }

    #[test]
    fn counts_errors_by_kind() {
        let metrics = MetricsCollector::new();
        metrics.record_error(ErrorKind::Storage);
        metrics.record_error(ErrorKind::BootstrapNetwork);
        metrics.record_error(ErrorKind::BootstrapNetwork);
        let snap = metrics.get_metrics();
        assert_eq!(snap.storage_errors, 1);
        assert_eq!(snap.network_errors, 2);
        assert_eq!(snap.signing_errors, 0);
    }
}
