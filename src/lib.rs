pub mod types;
pub mod canonical;
pub mod jwk;
pub mod error;
pub mod config;
pub mod storage;
pub mod keystore;
pub mod pow;
pub mod pow_worker;
pub mod signing;
pub mod backend;
pub mod bootstrap;
pub mod authenticator;
pub mod metrics;
pub mod prometheus_metrics;
pub mod error_handling;

pub use authenticator::{Authorization, RequestAuthenticator};
pub use backend::{DeviceBackend, HttpBackend};
pub use bootstrap::{BootstrapResult, BootstrapState, DeviceBootstrap};
pub use error::{CoreError, ErrorKind};
pub use keystore::KeyStore;
pub use signing::{TokenSigner, verify_token};
pub use types::{DeviceCertificate, Jwk, KeyPair, ProofOfWorkSolution};
