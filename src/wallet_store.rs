use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

use crate::error::StoreError;
use crate::identity::Identity;

/// Exported wallet state for one identity. The payload is opaque to the agent;
/// only the provisioning collaborator understands it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub identity: Identity,
    pub payload: String,
    pub updated_at: DateTime<Utc>,
}

impl WalletRecord {
    pub fn new(identity: Identity, payload: String) -> Self {
        Self {
            identity,
            payload,
            updated_at: Utc::now(),
        }
    }
}

/// Durable identity → wallet record mapping. Writes replace the whole record.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// `Ok(None)` when no record exists.
    async fn load(&self, identity: &Identity) -> Result<Option<WalletRecord>, StoreError>;

    /// Replace whatever is stored for `record.identity`.
    async fn save(&self, record: &WalletRecord) -> Result<(), StoreError>;
}

/// One pretty-printed JSON file per identity under a directory.
pub struct FileWalletStore {
    dir: PathBuf,
}

impl FileWalletStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, identity: &Identity) -> PathBuf {
        self.dir.join(format!("{}.json", identity.storage_key()))
    }
}

#[async_trait]
impl WalletStore for FileWalletStore {
    async fn load(&self, identity: &Identity) -> Result<Option<WalletRecord>, StoreError> {
        let path = self.path_for(identity);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: WalletRecord = serde_json::from_str(&data)?;
        if record.identity != *identity {
            return Err(StoreError::IdentityMismatch {
                expected: identity.clone(),
                found: record.identity,
            });
        }
        Ok(Some(record))
    }

    async fn save(&self, record: &WalletRecord) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&record.identity);
        let tmp = self
            .dir
            .join(format!(".{}.json.tmp", record.identity.storage_key()));
        let data = serde_json::to_string_pretty(record)?;

        // rename is atomic on the same filesystem: readers see the old or the new record, never a mix
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(identity = %record.identity, path = %path.display(), "wallet record saved");
        Ok(())
    }
}
