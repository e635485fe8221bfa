//! Persisted subscription state, one small JSON record per device.

use std::path::{Path, PathBuf};

use cardgate_core::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of subscription ids that mark a failed operation.
pub const FAILED: &str = "failed";

const RECORD_FILE: &str = "subscription.json";

/// What is written to disk for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Subscription id or a `failed-*` marker
    pub subscription_id: Option<String>,
    /// Last successful subscribe
    pub subscription_time: DateTime<Utc>,
    /// Error text of the operation that produced a failure marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubscriptionRecord {
    pub fn is_failed(&self) -> bool {
        self.subscription_id
            .as_deref()
            .is_some_and(|id| id.starts_with(FAILED))
    }
}

/// File backed store for one device's [`SubscriptionRecord`].
#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    dir: PathBuf,
}

impl SubscriptionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    /// Read the record, `None` if nothing was persisted yet.
    pub fn load(&self) -> Result<Option<SubscriptionRecord>> {
        let path = self.record_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        let record = serde_json::from_str(&raw)
            .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))?;
        Ok(Some(record))
    }

    /// Write the record through a temporary file and rename.
    pub fn save(&self, record: &SubscriptionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = self.dir.join(format!("{}.tmp", RECORD_FILE));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, self.record_path())?;
        Ok(())
    }

    /// Remove the record.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(self.record_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
