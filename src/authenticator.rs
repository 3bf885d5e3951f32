use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::keystore::KeyStore;
use crate::metrics::MetricsCollector;
use crate::signing::TokenSigner;
use crate::types::Jwk;

/// Token plus the public key the backend verifies it with.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub token: String,
    pub public_key: Jwk,
}

impl std::fmt::Debug for Authorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorization")
            .field("token", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Entry point for OTP send/validate and transaction signing. Call sites
/// go through here rather than touching the key store or signer.
pub struct RequestAuthenticator {
    keystore: Arc<KeyStore>,
    metrics: Arc<MetricsCollector>,
}

impl RequestAuthenticator {
    pub fn new(keystore: Arc<KeyStore>) -> Self {
        Self {
            keystore,
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn authorize<T: Serialize + ?Sized + Sync>(&self, payload: &T) -> Result<Authorization, CoreError> {
        let keys = self.keystore.get_or_create().await?;
        let token = TokenSigner::sign(payload, &keys.private_key, &keys.public_key).inspect_err(|e| {
            tracing::warn!(kind = %e.kind(), error = %e, "failed to sign request");
            self.metrics.record_error(e.kind());
        })?;

        self.metrics.record_token_signed();
        tracing::debug!(key_id = self.keystore.key_id(), "authorization token minted");
        Ok(Authorization {
            token,
            public_key: keys.public_key.to_public(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify_token;
    use crate::storage::MemoryKeyStorage;
    use serde_json::json;

    fn authenticator() -> (RequestAuthenticator, Arc<KeyStore>, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let keystore = Arc::new(
            KeyStore::new(Arc::new(MemoryKeyStorage::new())).with_metrics(Arc::clone(&metrics)),
        );
        let auth = RequestAuthenticator::new(Arc::clone(&keystore)).with_metrics(Arc::clone(&metrics));
        (auth, keystore, metrics)
    }

    #[tokio::test]
    async fn creates_the_key_on_first_use() {
        let (auth, keystore, metrics) = authenticator();
        assert!(!keystore.exists().await.unwrap());

        let payload = json!({"phoneNumber": "+15550100"});
        let authz = auth.authorize(&payload).await.unwrap();
        assert!(keystore.exists().await.unwrap());

        let stored = keystore.get_or_create().await.unwrap();
        assert_eq!(authz.public_key, stored.public_key);
        assert!(authz.public_key.d.is_none());

        let claims = verify_token(&authz.token, &payload).unwrap();
        assert_eq!(claims.public_key, authz.public_key);

        let snap = metrics.get_metrics();
        assert_eq!(snap.keys_generated, 1);
        assert_eq!(snap.tokens_signed, 1);
    }

    #[tokio::test]
    async fn later_requests_reuse_the_identity() {
        let (auth, _, metrics) = authenticator();
        let otp = auth.authorize(&json!({"otp": "123456"})).await.unwrap();
        let txn = auth
            .authorize(&json!({"amount": "25.00", "to": "acct-9"}))
            .await
            .unwrap();
        assert_eq!(otp.public_key, txn.public_key);
        assert_ne!(otp.token, txn.token);
        assert_eq!(metrics.get_metrics().keys_generated, 1);
        assert!(!format!("{otp:?}").contains(&otp.token));
    }
}
