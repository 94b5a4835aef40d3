use keyward_core::{Error, Paths, Result};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::record::ScopeRecord;

/// Scope records on disk, one JSON file per scope under `scopes/`.
#[derive(Debug, Clone)]
pub struct ScopeStore {
    paths: Paths,
}

impl ScopeStore {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    fn file(&self, id: &str) -> PathBuf {
        self.paths.scope_file(id)
    }

    pub async fn load(&self, id: &str) -> Result<ScopeRecord> {
        let path = self.file(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("scope {}", id)));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| Error::Store(format!("{}: {}", path.display(), e)))
    }

    /// Writes the record through a temp file and a rename so a crash never
    /// leaves a half-written record behind.
    pub async fn save(&self, record: &ScopeRecord) -> Result<()> {
        let path = self.file(&record.id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::Store(format!("Failed to persist scope {}: {}", record.id, e)));
        }
        debug!(scope = %record.id, state = ?record.state, "Saved scope record");
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.file(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// All readable records, oldest first. Unreadable files are skipped.
    pub async fn list(&self) -> Result<Vec<ScopeRecord>> {
        let dir = self.paths.scopes_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<ScopeRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable scope record"),
            }
        }
        records.sort_by_key(|r| r.created_at_ms);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ScopeState;

    #[tokio::test]
    async fn test_save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScopeStore::new(Paths::with_base(dir.path().to_path_buf()));

        let mut record = ScopeRecord::new("build:42", "local", vec!["deploy".to_string()], true);
        record.ledger.record("/tmp/keyward-1");
        record.set_state(ScopeState::Running);
        store.save(&record).await.unwrap();
        std::fs::write(dir.path().join("scopes").join("junk.json"), "{").unwrap();

        let loaded = store.load("build:42").await.unwrap();
        assert_eq!(loaded.credential_ids, vec!["deploy"]);
        assert!(loaded.ignore_missing);
        assert_eq!(loaded.state, ScopeState::Running);
        assert_eq!(loaded.ledger, record.ledger);

        assert_eq!(store.list().await.unwrap().len(), 1);
        assert!(store.remove("build:42").await.unwrap());
        assert!(!store.remove("build:42").await.unwrap());
        assert!(matches!(store.load("build:42").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_without_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScopeStore::new(Paths::with_base(dir.path().join("missing")));
        assert!(store.list().await.unwrap().is_empty());
    }
}
