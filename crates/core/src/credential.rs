use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Resolved SSH private-key credential.
///
/// Key material and passphrase are wiped from memory on drop.
#[derive(Clone)]
pub struct SshCredential {
    pub id: String,
    pub username: String,
    pub description: Option<String>,
    pub private_keys: Vec<Zeroizing<String>>,
    pub passphrase: Option<Zeroizing<String>>,
}

impl SshCredential {
    pub fn new(id: impl Into<String>, username: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            description: None,
            private_keys: vec![Zeroizing::new(private_key.into())],
            passphrase: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    pub fn with_extra_key(mut self, private_key: impl Into<String>) -> Self {
        self.private_keys.push(Zeroizing::new(private_key.into()));
        self
    }

    /// Safe, loggable description: `username (description)`.
    pub fn description(&self) -> String {
        match self.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(d) => format!("{} ({})", self.username, d),
            None => self.username.clone(),
        }
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref().map(String::as_str).filter(|p| !p.is_empty())
    }
}

impl std::fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshCredential")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("description", &self.description)
            .field("private_keys", &format_args!("[{} redacted]", self.private_keys.len()))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Source of credentials, looked up by opaque identifier.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the identifier is unknown.
    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>>;

    /// Records that a build used the credential.
    async fn track(&self, _id: &str) {}
}

/// Collapses duplicate identifiers, keeping first-seen order.
pub fn dedup_ids<I, S>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .map(|s| s.as_ref().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// In-memory store, mostly for embedding and tests.
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: HashMap<String, SshCredential>,
    tracked: Mutex<Vec<String>>,
    lookups: Mutex<Vec<String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, credential: SshCredential) {
        self.credentials.insert(credential.id.clone(), credential);
    }

    pub fn with(mut self, credential: SshCredential) -> Self {
        self.insert(credential);
        self
    }

    pub fn tracked(&self) -> Vec<String> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>> {
        self.lookups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.to_string());
        Ok(self.credentials.get(id).cloned())
    }

    async fn track(&self, id: &str) {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.to_string());
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    #[serde(default)]
    credentials: HashMap<String, CredentialEntry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialEntry {
    username: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    private_keys: Vec<String>,
    #[serde(default)]
    key_files: Vec<String>,
    #[serde(default)]
    passphrase: Option<String>,
    /// Name of an environment variable holding the passphrase.
    #[serde(default)]
    passphrase_env: Option<String>,
}

impl std::fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("username", &self.username)
            .field("key_files", &self.key_files)
            .finish_non_exhaustive()
    }
}

/// Credentials described by a JSON file:
///
/// ```json
/// { "credentials": { "deploy": { "username": "git", "keyFiles": ["~/.ssh/deploy"] } } }
/// ```
///
/// Relative key file paths resolve against the file's directory. Key files
/// are read at lookup time so rotated keys are picked up without a reload.
pub struct FileCredentialStore {
    base_dir: PathBuf,
    entries: HashMap<String, CredentialEntry>,
}

impl FileCredentialStore {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: CredentialsFile = serde_json::from_str(&content)?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        debug!(path = %path.display(), count = file.credentials.len(), "Loaded credentials file");
        Ok(Self {
            base_dir,
            entries: file.credentials,
        })
    }

    /// An empty store when the file does not exist.
    pub fn load_or_empty(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                base_dir: PathBuf::from("."),
                entries: HashMap::new(),
            })
        }
    }

    fn resolve_key_path(&self, raw: &str) -> PathBuf {
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.base_dir.join(path)
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn lookup(&self, id: &str) -> Result<Option<SshCredential>> {
        let entry = match self.entries.get(id) {
            Some(e) => e,
            None => return Ok(None),
        };

        let mut private_keys: Vec<Zeroizing<String>> = entry
            .private_keys
            .iter()
            .map(|k| Zeroizing::new(k.clone()))
            .collect();
        for raw in &entry.key_files {
            let path = self.resolve_key_path(raw);
            let key = std::fs::read_to_string(&path).map_err(|e| {
                Error::Config(format!(
                    "Credential '{}': cannot read key file {}: {}",
                    id,
                    path.display(),
                    e
                ))
            })?;
            private_keys.push(Zeroizing::new(key));
        }
        if private_keys.is_empty() {
            return Err(Error::Config(format!("Credential '{}' has no private keys", id)));
        }

        let passphrase = match (&entry.passphrase, &entry.passphrase_env) {
            (Some(p), _) => Some(Zeroizing::new(p.clone())),
            (None, Some(var)) => std::env::var(var).ok().map(Zeroizing::new),
            (None, None) => None,
        };

        Ok(Some(SshCredential {
            id: id.to_string(),
            username: entry.username.clone(),
            description: entry.description.clone(),
            private_keys,
            passphrase,
        }))
    }
}
