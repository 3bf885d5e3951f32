use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::BootstrapNetworkError;
use crate::types::{DeviceCertificate, PowSubmission};

pub const INIT_PATH: &str = "/dev/init";
pub const VALIDATE_PATH: &str = "/dev/validate";

#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// `POST /dev/init`; returns the initiation nonce.
    async fn request_initiation_nonce(&self, timestamp_ms: i64) -> Result<String, BootstrapNetworkError>;

    /// `POST /dev/validate`; returns the device certificate.
    async fn request_certificate(&self, submission: &PowSubmission) -> Result<DeviceCertificate, BootstrapNetworkError>;
}

#[derive(Serialize)]
struct InitRequest {
    #[serde(rename = "timeStamp")]
    time_stamp: i64,
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, BootstrapNetworkError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            bearer_token: None,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, BootstrapNetworkError> {
        let backend = Self::new(config.backend_url.clone(), config.get_http_timeout())?;
        Ok(match &config.bearer_token {
            Some(token) => backend.with_bearer_token(token.clone()),
            None => backend,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &'static str, body: &B) -> Result<String, BootstrapNetworkError> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let t0 = std::time::Instant::now();
        let resp = request.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        tracing::debug!(endpoint = path, status = status.as_u16(), elapsed_ms = t0.elapsed().as_millis() as u64, "backend responded");

        if !status.is_success() {
            return Err(BootstrapNetworkError::Rejected {
                endpoint: path,
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl DeviceBackend for HttpBackend {
    async fn request_initiation_nonce(&self, timestamp_ms: i64) -> Result<String, BootstrapNetworkError> {
        let body = self.post(INIT_PATH, &InitRequest { time_stamp: timestamp_ms }).await?;
        extract_value(INIT_PATH, &body, &["initiationNonce", "nonce"])
    }

    async fn request_certificate(&self, submission: &PowSubmission) -> Result<DeviceCertificate, BootstrapNetworkError> {
        let body = self.post(VALIDATE_PATH, submission).await?;
        extract_value(VALIDATE_PATH, &body, &["certificate", "deviceCertificate"]).map(DeviceCertificate::new)
    }
}

/// Accepts a JSON string, a JSON object holding the value under one of
/// `fields`, or a bare text body.
pub(crate) fn extract_value(endpoint: &'static str, body: &str, fields: &[&str]) -> Result<String, BootstrapNetworkError> {
    let malformed = |reason: &str| BootstrapNetworkError::MalformedResponse {
        endpoint,
        reason: reason.to_string(),
    };

    let value = match serde_json::from_str::<Value>(body) {
        Ok(Value::String(s)) => s,
        Ok(Value::Object(map)) => fields
            .iter()
            .find_map(|f| map.get(*f).and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| malformed(&format!("expected one of {fields:?}")))?,
        Ok(_) => return Err(malformed("unexpected JSON type")),
        Err(_) => body.trim().to_string(),
    };

    if value.is_empty() {
        return Err(malformed("empty value"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_supported_shapes() {
        let fields = &["initiationNonce", "nonce"];
        assert_eq!(extract_value(INIT_PATH, r#""abc123""#, fields).unwrap(), "abc123");
        assert_eq!(
            extract_value(INIT_PATH, r#"{"initiationNonce":"abc123"}"#, fields).unwrap(),
            "abc123"
        );
        assert_eq!(extract_value(INIT_PATH, r#"{"nonce":"n-1"}"#, fields).unwrap(), "n-1");
        assert_eq!(extract_value(INIT_PATH, "abc123\n", fields).unwrap(), "abc123");
    }

    #[test]
    fn rejects_unusable_bodies() {
        let fields = &["certificate"];
        for body in ["", "  ", r#""""#, r#"{"other":"x"}"#, "42", r#"{"certificate":7}"#] {
            let err = extract_value(VALIDATE_PATH, body, fields).unwrap_err();
            assert!(
                matches!(err, BootstrapNetworkError::MalformedResponse { endpoint: VALIDATE_PATH, .. }),
                "{body:?}"
            );
        }
    }

    #[test]
    fn joins_base_url_and_path() {
        let backend = HttpBackend::new("https://api.example.test/", Duration::from_secs(1)).unwrap();
        assert_eq!(backend.endpoint(INIT_PATH), "https://api.example.test/dev/init");
    }
}
