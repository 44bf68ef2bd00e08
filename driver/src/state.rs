//! Opaque per-task state handed back to the orchestrator at start and used
//! to rebuild handles after a driver restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VirtError};
use crate::vm_config::TaskConfig;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStateBlob {
    pub version: u32,
    pub task_config: TaskConfig,
    pub started_at: DateTime<Utc>,
}

impl TaskStateBlob {
    pub fn new(task_config: TaskConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            version: STATE_VERSION,
            task_config,
            started_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a persisted blob; an incompatible schema version fails
    /// recovery rather than silently misreading the state.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let blob: TaskStateBlob = serde_json::from_slice(bytes)?;
        if blob.version != STATE_VERSION {
            return Err(VirtError::StateVersion(blob.version));
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_config() -> TaskConfig {
        TaskConfig {
            id: "alloc-00000000001234567890abcdef".to_string(),
            memory_mb: 4096,
            cpus: 2,
            image: "/images/base.qcow2".into(),
            alloc_dir: "/alloc".into(),
            local_dir: "/local".into(),
            secrets_dir: "/secrets".into(),
            ..Default::default()
        }
    }

    #[test]
    fn round_trips() {
        let blob = TaskStateBlob::new(task_config(), Utc::now());
        let bytes = blob.encode().unwrap();
        let decoded = TaskStateBlob::decode(&bytes).unwrap();
        assert_eq!(decoded.version, STATE_VERSION);
        assert_eq!(decoded.task_config.id, blob.task_config.id);
        assert_eq!(decoded.started_at, blob.started_at);
    }

    #[test]
    fn rejects_unknown_versions() {
        let mut blob = TaskStateBlob::new(task_config(), Utc::now());
        blob.version = 2;
        let bytes = serde_json::to_vec(&blob).unwrap();
        let err = TaskStateBlob::decode(&bytes).unwrap_err();
        assert!(matches!(err, VirtError::StateVersion(2)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(TaskStateBlob::decode(b"not json").is_err());
    }
}
