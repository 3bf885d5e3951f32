use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::types::KeyRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(KeyRecord),
    /// Another writer got there first; this is the record that won.
    Existing(KeyRecord),
}

impl InsertOutcome {
    pub fn into_record(self) -> KeyRecord {
        match self {
            InsertOutcome::Inserted(r) | InsertOutcome::Existing(r) => r,
        }
    }
}

/// Single-record-per-id storage. `insert_if_absent` must be atomic: a record
/// is either fully visible or absent, and an existing one is never replaced.
#[async_trait]
pub trait KeyStorage: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StorageError>;
    async fn insert_if_absent(&self, id: &str, record: KeyRecord) -> Result<InsertOutcome, StorageError>;
    async fn remove(&self, id: &str) -> Result<bool, StorageError>;
}

// A publish takes milliseconds; anything older was left by a crashed writer.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60);

/// One JSON file per record under `dir`.
#[derive(Debug, Clone)]
pub struct FileKeyStorage {
    dir: PathBuf,
}

impl FileKeyStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read_record(&self, id: &str, path: &Path) -> Result<Option<KeyRecord>, StorageError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_error(path, source)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Removes `.{id}.{pid}.{rand}.tmp` files older than [`STALE_TEMP_AGE`].
    /// They hold private key material.
    async fn sweep_stale_temps(&self, id: &str) -> Result<usize, StorageError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(io_error(&self.dir, source)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&self.dir, e))? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(|name| is_temp_for(name, id)) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.elapsed().ok());
            if !age.is_some_and(|age| age >= STALE_TEMP_AGE) {
                continue;
            }
            let path = entry.path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    tracing::warn!(path = %path.display(), "removed stale key temp file");
                    removed += 1;
                }
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(source) => return Err(io_error(&path, source)),
            }
        }
        Ok(removed)
    }

    async fn write_temp(&self, temp: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(temp).await.map_err(|e| io_error(temp, e))?;
        file.write_all(bytes).await.map_err(|e| io_error(temp, e))?;
        file.sync_all().await.map_err(|e| io_error(temp, e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyStorage for FileKeyStorage {
    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StorageError> {
        let path = self.record_path(id)?;
        self.read_record(id, &path).await
    }

    async fn insert_if_absent(&self, id: &str, record: KeyRecord) -> Result<InsertOutcome, StorageError> {
        let path = self.record_path(id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;
        self.sweep_stale_temps(id).await?;

        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| StorageError::Corrupted {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        let temp = self
            .dir
            .join(format!(".{id}.{}.{:016x}.tmp", std::process::id(), rand::random::<u64>()));

        // Publish by hard link: fails with AlreadyExists instead of replacing.
        let published = match self.write_temp(&temp, &bytes).await {
            Ok(()) => tokio::fs::hard_link(&temp, &path).await,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        let _ = tokio::fs::remove_file(&temp).await;

        match published {
            Ok(()) => Ok(InsertOutcome::Inserted(record)),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                match self.read_record(id, &path).await? {
                    Some(existing) => Ok(InsertOutcome::Existing(existing)),
                    None => Err(StorageError::Corrupted {
                        id: id.to_string(),
                        reason: "record vanished during insert".into(),
                    }),
                }
            }
            Err(source) => Err(io_error(&path, source)),
        }
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let path = self.record_path(id)?;
        self.sweep_stale_temps(id).await?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(source) => Err(io_error(&path, source)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyStorage {
    records: Mutex<HashMap<String, KeyRecord>>,
}

impl MemoryKeyStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStorage for MemoryKeyStorage {
    async fn get(&self, id: &str) -> Result<Option<KeyRecord>, StorageError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn insert_if_absent(&self, id: &str, record: KeyRecord) -> Result<InsertOutcome, StorageError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.get(id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        records.insert(id.to_string(), record.clone());
        Ok(InsertOutcome::Inserted(record))
    }

    async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.records.lock().await.remove(id).is_some())
    }
}

fn validate_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}

// `.{id}.{pid}.{16 hex}.tmp`, parsed strictly since ids may contain dots
fn is_temp_for(name: &str, id: &str) -> bool {
    let Some(rest) = name
        .strip_prefix('.')
        .and_then(|n| n.strip_prefix(id))
        .and_then(|n| n.strip_prefix('.'))
        .and_then(|n| n.strip_suffix(".tmp"))
    else {
        return false;
    };
    match rest.split_once('.') {
        Some((pid, tag)) => {
            !pid.is_empty()
                && pid.bytes().all(|b| b.is_ascii_digit())
                && tag.len() == 16
                && tag.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::DeviceKey;
    use chrono::Utc;

    fn record() -> KeyRecord {
        let pair = DeviceKey::generate().key_pair();
        KeyRecord {
            public_key: pair.public_key,
            private_key: pair.private_key,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_storage_keeps_the_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path().join("keys"));
        assert_eq!(storage.get("device-identity").await.unwrap(), None);

        let first = record();
        let outcome = storage.insert_if_absent("device-identity", first.clone()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Inserted(first.clone()));

        let outcome = storage.insert_if_absent("device-identity", record()).await.unwrap();
        assert_eq!(outcome, InsertOutcome::Existing(first.clone()));
        assert_eq!(storage.get("device-identity").await.unwrap(), Some(first));

        // no temp files left behind
        let entries: Vec<_> = std::fs::read_dir(storage.dir()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        assert!(storage.remove("device-identity").await.unwrap());
        assert!(!storage.remove("device-identity").await.unwrap());
    }

    #[tokio::test]
    async fn corrupted_record_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("device-identity.json"), b"{ not json").unwrap();
        let storage = FileKeyStorage::new(dir.path());
        let err = storage.get("device-identity").await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupted { .. }));
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        for id in ["", "../escape", ".hidden", "a/b"] {
            assert!(matches!(storage.get(id).await, Err(StorageError::InvalidId(_))), "{id}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn record_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        storage.insert_if_absent("device-identity", record()).await.unwrap();
        let mode = std::fs::metadata(dir.path().join("device-identity.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn stale_temp_files_are_swept() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileKeyStorage::new(dir.path());
        let stale = dir.path().join(".device-identity.4242.00000000deadbeef.tmp");
        let fresh = dir.path().join(".device-identity.4243.00000000cafef00d.tmp");
        let other_id = dir.path().join(".device-identity.backup.1.00000000deadbeef.tmp");
        for path in [&stale, &fresh, &other_id] {
            std::fs::write(path, b"{}").unwrap();
        }
        let old = std::time::SystemTime::now() - Duration::from_secs(3600);
        for path in [&stale, &other_id] {
            std::fs::File::options().write(true).open(path).unwrap().set_modified(old).unwrap();
        }

        storage.insert_if_absent("device-identity", record()).await.unwrap();

        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(other_id.exists());
        assert!(dir.path().join("device-identity.json").exists());
    }

    #[test]
    fn temp_names_match_only_their_id() {
        assert!(is_temp_for(".a.12.0123456789abcdef.tmp", "a"));
        assert!(is_temp_for(".a.b.12.0123456789abcdef.tmp", "a.b"));
        assert!(!is_temp_for(".a.b.12.0123456789abcdef.tmp", "a"));
        assert!(!is_temp_for(".a.12.short.tmp", "a"));
        assert!(!is_temp_for("a.json", "a"));
    }

    #[tokio::test]
    async fn unusable_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("keys");
        std::fs::write(&not_a_dir, b"occupied").unwrap();
        let storage = FileKeyStorage::new(&not_a_dir);

        assert!(matches!(storage.get("device-identity").await, Err(StorageError::Io { .. })));
        let err = storage.insert_if_absent("device-identity", record()).await.unwrap_err();
        match err {
            StorageError::Io { path, .. } => assert_eq!(path, not_a_dir),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn memory_storage_has_the_same_semantics() {
        let storage = MemoryKeyStorage::new();
        let first = record();
        assert!(matches!(
            storage.insert_if_absent("id", first.clone()).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            storage.insert_if_absent("id", record()).await.unwrap().into_record(),
            first
        );
        assert!(storage.remove("id").await.unwrap());
        assert_eq!(storage.get("id").await.unwrap(), None);
    }
}
