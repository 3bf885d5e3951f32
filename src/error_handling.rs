use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::CoreError;
use crate::metrics::MetricsCollector;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_retry_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_delay: config.get_retry_delay(),
            ..Self::default()
        }
    }
}

pub struct ErrorHandler {
    retry_config: RetryConfig,
    metrics: Arc<MetricsCollector>,
}

impl ErrorHandler {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            retry_config: RetryConfig::default(),
            metrics,
        }
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut delay = self.retry_config.retry_delay;
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) if error.is_retryable() && attempt < self.retry_config.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries = self.retry_config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after transient failure"
                    );
                    self.metrics.record_retry();

                    tokio::time::sleep(delay).await;

                    // Exponential backoff
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.retry_config.backoff_multiplier)
                            .min(self.retry_config.max_retry_delay.as_secs_f64())
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}
