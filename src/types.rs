use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// EC JSON Web Key. `d` is only present on the private half.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
}

impl Jwk {
    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }

    /// Copy of this key with the private scalar removed.
    pub fn to_public(&self) -> Jwk {
        Jwk { d: None, ..self.clone() }
    }
}

impl std::fmt::Debug for Jwk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &self.d.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub public_key: Jwk,
    pub private_key: Jwk,
}

/// The single persisted record holding both halves of the device identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub public_key: Jwk,
    pub private_key: Jwk,
    pub created_at: DateTime<Utc>,
}

impl KeyRecord {
    pub fn key_pair(&self) -> KeyPair {
        KeyPair {
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
        }
    }
}

/// Result of a lookup by record id; both halves are `None` when nothing is stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedKeys {
    pub public_key: Option<Jwk>,
    pub private_key: Option<Jwk>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWorkSolution {
    pub nonce: u64,
    pub hash: String,
}

/// Body of `POST /dev/validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowSubmission {
    pub initiation_nonce: String,
    pub pow_hash: String,
    pub pow_nonce: u64,
}

/// Opaque backend credential issued after a successful bootstrap.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCertificate(String);

impl DeviceCertificate {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Debug for DeviceCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DeviceCertificate(<{} bytes>)", self.0.len())
    }
}
