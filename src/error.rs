use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored key record '{id}' is corrupted: {reason}")]
    Corrupted { id: String, reason: String },
    #[error("invalid key record id '{0}'")]
    InvalidId(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFormatError {
    #[error("unsupported key type '{0}', expected EC")]
    UnsupportedKeyType(String),
    #[error("unsupported curve '{0}', expected P-256")]
    UnsupportedCurve(String),
    #[error("JWK field '{field}' is not valid base64url: {reason}")]
    InvalidEncoding { field: &'static str, reason: String },
    #[error("JWK field '{field}' must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("JWK coordinates are not a point on P-256")]
    InvalidPoint,
    #[error("private key is missing the 'd' scalar")]
    MissingPrivateScalar,
    #[error("private scalar is out of range for P-256")]
    InvalidScalar,
    #[error("public key does not belong to the private key")]
    Mismatch,
}

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("failed to serialize signing input: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("ES256 signature primitive failed: {0}")]
    Primitive(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenVerifyError {
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token hash does not match the supplied data")]
    HashMismatch,
}

#[derive(Error, Debug)]
pub enum BootstrapNetworkError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{endpoint} rejected with status {status}: {body}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("{endpoint} returned an unusable response: {reason}")]
    MalformedResponse {
        endpoint: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofOfWorkError {
    #[error("difficulty {difficulty} exceeds the {max} hex digits of a SHA-256 digest")]
    UnsatisfiableDifficulty { difficulty: u32, max: u32 },
    #[error("proof of work did not finish within {deadline:?}")]
    DeadlineExceeded { deadline: Duration },
    #[error("proof of work was cancelled")]
    Cancelled,
    #[error("proof of work worker failed: {0}")]
    WorkerFailed(String),
    #[error("failed to encode puzzle: {0}")]
    Encoding(String),
}

/// Stable, matchable category of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Storage,
    KeyFormat,
    Signing,
    TokenVerification,
    BootstrapNetwork,
    ProofOfWork,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Storage => "storage",
            ErrorKind::KeyFormat => "key_format",
            ErrorKind::Signing => "signing",
            ErrorKind::TokenVerification => "token_verification",
            ErrorKind::BootstrapNetwork => "bootstrap_network",
            ErrorKind::ProofOfWork => "proof_of_work",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("key format error: {0}")]
    KeyFormat(#[from] KeyFormatError),
    #[error("signing error: {0}")]
    Signing(#[from] SigningError),
    #[error("token verification error: {0}")]
    TokenVerify(#[from] TokenVerifyError),
    #[error("bootstrap network error: {0}")]
    BootstrapNetwork(#[from] BootstrapNetworkError),
    #[error("proof of work error: {0}")]
    ProofOfWork(#[from] ProofOfWorkError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Storage(_) => ErrorKind::Storage,
            CoreError::KeyFormat(_) => ErrorKind::KeyFormat,
            CoreError::Signing(_) => ErrorKind::Signing,
            CoreError::TokenVerify(_) => ErrorKind::TokenVerification,
            CoreError::BootstrapNetwork(_) => ErrorKind::BootstrapNetwork,
            CoreError::ProofOfWork(_) => ErrorKind::ProofOfWork,
            CoreError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a caller-side retry of the whole operation could succeed.
    /// The core itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::BootstrapNetwork(BootstrapNetworkError::Transport(_)) => true,
            CoreError::BootstrapNetwork(BootstrapNetworkError::Rejected { status, .. }) => {
                *status >= 500 || *status == 429
            }
            CoreError::ProofOfWork(ProofOfWorkError::DeadlineExceeded { .. }) => true,
            _ => false,
        }
    }
}
