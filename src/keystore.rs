use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{CoreError, ErrorKind, KeyFormatError, StorageError};
use crate::metrics::MetricsCollector;
use crate::signing::DeviceKey;
use crate::storage::{InsertOutcome, KeyStorage};
use crate::types::{KeyPair, KeyRecord, RetrievedKeys};

pub const DEFAULT_KEY_ID: &str = "device-identity";

pub struct KeyStore {
    storage: Arc<dyn KeyStorage>,
    key_id: String,
    // serialises check-then-create within this process
    create_lock: Mutex<()>,
    metrics: Arc<MetricsCollector>,
}

impl KeyStore {
    pub fn new(storage: Arc<dyn KeyStorage>) -> Self {
        Self {
            storage,
            key_id: DEFAULT_KEY_ID.to_string(),
            create_lock: Mutex::new(()),
            metrics: Arc::new(MetricsCollector::new()),
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub async fn exists(&self) -> Result<bool, StorageError> {
        let found = self
            .storage
            .get(&self.key_id)
            .await
            .inspect_err(|_| self.metrics.record_error(ErrorKind::Storage))?;
        Ok(found.is_some())
    }

    /// Generates a fresh key pair and stores it unless a record already
    /// exists, in which case the stored identity is returned untouched.
    pub async fn generate_and_store(&self) -> Result<KeyPair, CoreError> {
        let key = DeviceKey::generate();
        let pair = key.key_pair();
        let record = KeyRecord {
            public_key: pair.public_key,
            private_key: pair.private_key,
            created_at: Utc::now(),
        };

        let outcome = self
            .storage
            .insert_if_absent(&self.key_id, record)
            .await
            .map_err(|e| self.fail(e.into()))?;
        match outcome {
            InsertOutcome::Inserted(record) => {
                tracing::info!(key_id = %self.key_id, "generated device key pair");
                self.metrics.record_key_generated();
                Ok(record.key_pair())
            }
            InsertOutcome::Existing(record) => {
                tracing::warn!(key_id = %self.key_id, "device key already present, keeping stored identity");
                self.validated(record)
            }
        }
    }

    /// Reads the record stored under `id`. Absence is not an error.
    pub async fn retrieve(&self, id: &str) -> Result<RetrievedKeys, StorageError> {
        let record = self
            .storage
            .get(id)
            .await
            .inspect_err(|_| self.metrics.record_error(ErrorKind::Storage))?;
        Ok(match record {
            Some(record) => RetrievedKeys {
                public_key: Some(record.public_key),
                private_key: Some(record.private_key),
            },
            None => RetrievedKeys::default(),
        })
    }

    pub async fn get_or_create(&self) -> Result<KeyPair, CoreError> {
        let _guard = self.create_lock.lock().await;
        let existing = self
            .storage
            .get(&self.key_id)
            .await
            .map_err(|e| self.fail(e.into()))?;
        match existing {
            Some(record) => self.validated(record),
            None => self.generate_and_store().await,
        }
    }

    /// Deletes the stored identity. Returns whether one existed.
    pub async fn wipe(&self) -> Result<bool, StorageError> {
        let _guard = self.create_lock.lock().await;
        let removed = self.storage.remove(&self.key_id).await?;
        if removed {
            tracing::warn!(key_id = %self.key_id, "device key pair wiped");
        }
        Ok(removed)
    }

    fn validated(&self, record: KeyRecord) -> Result<KeyPair, CoreError> {
        let key = DeviceKey::from_jwk(&record.private_key).map_err(|e| self.fail(e.into()))?;
        if key.public_jwk() != record.public_key.to_public() {
            return Err(self.fail(KeyFormatError::Mismatch.into()));
        }
        Ok(record.key_pair())
    }

    fn fail(&self, err: CoreError) -> CoreError {
        self.metrics.record_error(err.kind());
        err
    }
}
