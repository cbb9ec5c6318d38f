//! Blob Persistence (BP) — maps a host-provided blob store onto the local
//! filesystem and snapshots the live database into it (§4.2).
//!
//! BP is deliberately synchronous: it owns no timer, no lock, no tokio
//! primitive. The autosync schedule, save coalescing, and the single
//! outstanding-save guarantee all live in the dispatcher (§4.6), which is
//! the only caller that needs async orchestration. BP's job stops at
//! "write these bytes to this path and tell me what happened."

use std::path::{Path, PathBuf};

use crate::engine::error::EngineError;
use crate::engine::storage::StorageEngine;

const SNAPSHOT_FILE_NAME: &str = "snapshot.sqlite3";

/// `quota()`'s response (§4.2). `total`/`available` are `-1` when the host
/// environment exposes no filesystem-quota API to ask — the corpus has no
/// crate for this, so rather than fabricate one, BP reports honestly that
/// capacity is unknown and leaves `used` (the snapshot's own size) as the
/// only figure it can measure directly.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Quota {
    pub total: i64,
    pub available: i64,
    pub used: i64,
}

/// Translates an `opfs:/<path>` logical path (§1a/§4.2) into a location
/// under BP's base directory.
fn opfs_path(base_dir: &Path, relative: &str) -> PathBuf {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        base_dir.join(SNAPSHOT_FILE_NAME)
    } else {
        base_dir.join(relative)
    }
}

pub struct BlobPersistence {
    base_dir: PathBuf,
    snapshot_path: Option<PathBuf>,
    pending_restore: Option<Vec<u8>>,
}

impl BlobPersistence {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            snapshot_path: None,
            pending_restore: None,
        }
    }

    /// `initialize(logical_path)` — resolve the logical path to a real one
    /// and return the storage-engine-facing path to open (§4.2 step 1; §6
    /// "paths not starting with `opfs:/` are passed through to SE as-is").
    ///
    /// Only an `opfs:/`-prefixed path goes through BP's snapshot/restore
    /// indirection: SE opens `:memory:`, BP loads any existing blob into
    /// `pending_restore` for the open sequence to apply, and `save_snapshot`
    /// later persists SE's serialized image back to the resolved path. A
    /// `:memory:` path is inert: nothing is read or written. Any other path
    /// (including a plain filesystem path with no scheme) is handed back to
    /// SE unchanged — SE opens and persists it directly as its own file, and
    /// BP holds no snapshot path for it (`save_snapshot`/`force_sync` become
    /// no-ops, matching §4.2's "a no-op when no path is configured").
    pub fn initialize(&mut self, logical_path: &str) -> Result<String, EngineError> {
        if logical_path == ":memory:" {
            self.snapshot_path = None;
            self.pending_restore = None;
            return Ok(":memory:".to_string());
        }

        let Some(relative) = logical_path.strip_prefix("opfs:/") else {
            self.snapshot_path = None;
            self.pending_restore = None;
            return Ok(logical_path.to_string());
        };

        let path = opfs_path(&self.base_dir, relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let bytes = std::fs::read(&path)?;
            self.pending_restore = Some(bytes);
        }
        self.snapshot_path = Some(path);
        // SE itself opens `:memory:` and is restored from `pending_restore`;
        // the resolved snapshot path is only where BP persists to, not where
        // SE reads its live connection from (§4.2: the durable copy and the
        // live connection are separate artifacts).
        Ok(":memory:".to_string())
    }

    /// Returns, and clears, a snapshot loaded during `initialize`. Consumed
    /// exactly once per `open` (§2).
    pub fn take_pending_restore(&mut self) -> Option<Vec<u8>> {
        self.pending_restore.take()
    }

    /// Discards any unconsumed pending restore without touching the
    /// persisted snapshot file itself (§9 teardown).
    pub fn forget_pending_restore(&mut self) {
        self.pending_restore = None;
    }

    /// `save_snapshot()` — serialize the live database and write it to the
    /// resolved path. A no-op when BP was initialized against `:memory:`
    /// with no logical path (there is nowhere durable to write).
    pub fn save_snapshot(&self, se: &StorageEngine) -> Result<(), EngineError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let bytes = se.serialize()?;
        self.write_bytes(path, &bytes)
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
        let tmp_path = path.with_extension("tmp");
        match std::fs::write(&tmp_path, bytes) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(28) => {
                return Err(EngineError::InsufficientSpace(format!(
                    "no space left writing snapshot to {}",
                    path.display()
                )));
            }
            Err(e) => return Err(EngineError::from(e)),
        }
        std::fs::rename(&tmp_path, path).map_err(EngineError::from)
    }

    /// `clear()` — delete the persisted snapshot file, if any, so a future
    /// `open` does not resurrect wiped data.
    pub fn clear(&self) {
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, path = %path.display(), "failed to remove persisted snapshot during clear");
                }
            }
        }
    }

    /// `quota()` — report the snapshot's on-disk size; total/available
    /// capacity is unknowable without a quota API this process has (§4.2).
    pub fn quota(&self) -> Quota {
        let used = self
            .snapshot_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        Quota {
            total: -1,
            available: -1,
            used,
        }
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::schema::SchemaManager;
    use crate::engine::storage::SessionPragmas;
    use tempfile::TempDir;

    #[test]
    fn memory_path_is_inert() {
        let mut bp = BlobPersistence::new("./unused");
        let resolved = bp.initialize(":memory:").unwrap();
        assert_eq!(resolved, ":memory:");
        assert!(bp.take_pending_restore().is_none());
        assert_eq!(bp.quota().used, 0);
    }

    #[test]
    fn non_opfs_path_passes_through_unchanged() {
        let dir = TempDir::new().unwrap();
        let plain_path = dir.path().join("plain.db");
        let mut bp = BlobPersistence::new(dir.path());
        let resolved = bp.initialize(plain_path.to_str().unwrap()).unwrap();
        assert_eq!(resolved, plain_path.to_str().unwrap());
        assert!(bp.take_pending_restore().is_none());
        assert!(bp.snapshot_path().is_none());

        // With no snapshot path configured, force-sync is a no-op: SE owns
        // persistence for this path directly.
        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        bp.save_snapshot(&se).unwrap();
        assert!(!plain_path.exists());
    }

    #[test]
    fn save_then_reopen_restores_data() {
        let dir = TempDir::new().unwrap();
        let mut bp = BlobPersistence::new(dir.path());
        bp.initialize("opfs:/store.db").unwrap();

        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.configure(SessionPragmas::default()).unwrap();
        SchemaManager::ensure_schema(&se).unwrap();
        bp.save_snapshot(&se).unwrap();
        assert!(bp.quota().used > 0);

        let mut bp2 = BlobPersistence::new(dir.path());
        bp2.initialize("opfs:/store.db").unwrap();
        let restored = bp2.take_pending_restore().unwrap();

        let mut se2 = StorageEngine::new();
        se2.open(":memory:").unwrap();
        se2.deserialize(restored).unwrap();
        let info = SchemaManager::collection_info(&se2, "default").unwrap();
        assert_eq!(info.document_count, 0);
    }

    #[test]
    fn clear_removes_persisted_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut bp = BlobPersistence::new(dir.path());
        bp.initialize("opfs:/store.db").unwrap();

        let mut se = StorageEngine::new();
        se.open(":memory:").unwrap();
        se.configure(SessionPragmas::default()).unwrap();
        SchemaManager::ensure_schema(&se).unwrap();
        bp.save_snapshot(&se).unwrap();

        bp.clear();
        assert_eq!(bp.quota().used, 0);
    }
}
