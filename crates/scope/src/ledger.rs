use keyward_core::{BuildLog, Node};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Node paths created for a scope that must not outlive it.
///
/// A path is recorded (and the record persisted) before it is created, and
/// only forgotten once it is gone from the node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactLedger {
    entries: Vec<PathBuf>,
}

impl ArtifactLedger {
    pub fn record(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.entries.contains(&path) {
            self.entries.push(path);
        }
    }

    pub fn forget(&mut self, path: &Path) {
        self.entries.retain(|p| p != path);
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deletes every entry from the node. Entries that could not be removed
    /// stay in the ledger. Returns how many paths were actually deleted.
    pub async fn purge(&mut self, node: &dyn Node, log: &BuildLog) -> usize {
        let mut deleted = 0;
        for path in self.entries.clone() {
            match node.remove(&path).await {
                Ok(true) => {
                    debug!(path = %path.display(), "Deleted scope artifact");
                    deleted += 1;
                    self.forget(&path);
                }
                Ok(false) => self.forget(&path),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to delete scope artifact");
                    log.warn(format!("Could not delete {}: {}", path.display(), e));
                }
            }
        }
        deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::fake::FakeNode;

    #[tokio::test]
    async fn test_purge_removes_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path());
        let work = dir.path().join("keyward-1");
        std::fs::create_dir(&work).unwrap();
        std::fs::write(work.join("private_key_x.key"), "k").unwrap();
        let sock = dir.path().join("agent.sock");
        std::fs::write(&sock, "").unwrap();

        let mut ledger = ArtifactLedger::default();
        ledger.record(&work);
        ledger.record(&sock);
        ledger.record(&sock);
        ledger.record(dir.path().join("never-created"));
        assert_eq!(ledger.entries().len(), 3);

        let (log, _) = BuildLog::memory();
        assert_eq!(ledger.purge(&node, &log).await, 2);
        assert!(ledger.is_empty());
        assert!(!work.exists());
        assert!(!sock.exists());
    }

    #[test]
    fn test_serializes_as_plain_list() {
        let mut ledger = ArtifactLedger::default();
        ledger.record("/tmp/a");
        assert_eq!(serde_json::to_string(&ledger).unwrap(), r#"["/tmp/a"]"#);
    }
}
