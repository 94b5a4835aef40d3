//! In-process agent speaking the ssh-agent protocol on a Unix socket, for
//! nodes where no `ssh-agent` binary can be run.
//!
//! Keys are decrypted here and held in memory only; nothing is written to
//! the node but the socket itself.

use async_trait::async_trait;
use keyward_core::{BuildLog, Error, Node, Result};
use signature::Signer as _;
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{Identity, SignRequest};
use ssh_key::{PrivateKey, Signature};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::AUTH_SOCK_VAR;
use crate::handle::{export, AgentHandle, RemoteAgent};
use crate::provider::AgentProvider;

#[derive(Clone, Debug)]
struct LoadedKey {
    key: PrivateKey,
    comment: String,
}

/// One protocol session; cloned per connection by `ssh_agent_lib`.
#[derive(Clone, Debug)]
struct KeySession {
    keys: Arc<RwLock<Vec<LoadedKey>>>,
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(std::io::Error::other(msg.into()))
}

#[ssh_agent_lib::async_trait]
impl Session for KeySession {
    async fn request_identities(&mut self) -> std::result::Result<Vec<Identity>, AgentError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| other_err("key store lock poisoned"))?;
        let identities: Vec<Identity> = keys
            .iter()
            .map(|loaded| Identity {
                pubkey: loaded.key.public_key().clone().into(),
                comment: loaded.comment.clone(),
            })
            .collect();
        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> std::result::Result<Signature, AgentError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| other_err("key store lock poisoned"))?;
        let loaded = keys
            .iter()
            .find(|loaded| *loaded.key.public_key().key_data() == request.pubkey)
            .ok_or_else(|| other_err("key not found"))?;
        debug!(comment = %loaded.comment, data_len = request.data.len(), "sign");
        loaded
            .key
            .try_sign(&request.data)
            .map_err(|e| other_err(format!("signing failed: {e}")))
    }
}

/// An agent served by a task of this process.
pub struct EmbeddedAgent {
    node: Arc<dyn Node>,
    socket: PathBuf,
    /// Directory made for the socket when the caller gave none.
    own_dir: Option<PathBuf>,
    keys: Arc<RwLock<Vec<LoadedKey>>>,
    cancel: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    log: BuildLog,
}

impl EmbeddedAgent {
    /// Binds a fresh socket in `dir` (or a new directory under the node's
    /// temp dir) and starts serving it. The node must share this process's
    /// filesystem.
    pub async fn start(node: Arc<dyn Node>, dir: Option<&Path>, log: BuildLog) -> Result<Self> {
        if !node.is_local() {
            return Err(Error::Bootstrap(format!(
                "node {} is not reachable from this process",
                node.name()
            )));
        }
        let id = Uuid::new_v4().simple().to_string();
        let short = &id[..8];
        let (dir, own_dir) = match dir {
            Some(d) => (d.to_path_buf(), None),
            None => {
                let d = node.temp_dir().join(format!("keyward-agent-{}", short));
                (d.clone(), Some(d))
            }
        };
        node.create_dir(&dir)
            .await
            .map_err(|e| Error::Bootstrap(format!("Failed to create {}: {}", dir.display(), e)))?;

        let socket = dir.join(format!("agent-{}.sock", short));
        let keys = Arc::new(RwLock::new(Vec::new()));
        let cancel = CancellationToken::new();
        let session = KeySession { keys: keys.clone() };
        let task = spawn_listener(&socket, session, cancel.clone())?;

        log.line(format!("Started embedded ssh-agent (socket {})", socket.display()));
        info!(node = node.name(), socket = %socket.display(), "Embedded ssh-agent started");
        Ok(Self {
            node,
            socket,
            own_dir,
            keys,
            cancel,
            listener: Mutex::new(Some(task)),
            log,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

#[cfg(unix)]
fn spawn_listener(
    socket: &Path,
    session: KeySession,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    use std::os::unix::fs::PermissionsExt as _;

    let listener = tokio::net::UnixListener::bind(socket)
        .map_err(|e| Error::Bootstrap(format!("Failed to bind {}: {}", socket.display(), e)))?;
    std::fs::set_permissions(socket, std::fs::Permissions::from_mode(0o600))?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            result = ssh_agent_lib::agent::listen(listener, session) => {
                if let Err(e) = result {
                    warn!(error = %e, "Embedded ssh-agent listener failed");
                }
            }
            _ = cancel.cancelled() => debug!("Embedded ssh-agent listener cancelled"),
        }
    }))
}

#[cfg(not(unix))]
fn spawn_listener(
    _socket: &Path,
    _session: KeySession,
    _cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    Err(Error::Bootstrap(
        "the embedded ssh-agent needs Unix domain sockets".to_string(),
    ))
}

impl Drop for EmbeddedAgent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl RemoteAgent for EmbeddedAgent {
    async fn socket(&self) -> Result<String> {
        Ok(self.socket.display().to_string())
    }

    async fn environment(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::from([(AUTH_SOCK_VAR.to_string(), self.socket.display().to_string())]))
    }

    async fn add_identity(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<()> {
        self.log.line(format!("Adding identity: {}", comment));
        let key = PrivateKey::from_openssh(private_key)
            .map_err(|e| Error::Identity(format!("{}: unreadable private key: {}", comment, e)))?;
        let key = if key.is_encrypted() {
            let passphrase = passphrase.ok_or_else(|| {
                Error::Identity(format!(
                    "{}: the key is encrypted and no passphrase was given. Check the passphrase.",
                    comment
                ))
            })?;
            key.decrypt(passphrase)
                .map_err(|e| Error::Identity(format!("{}: {}. Check the passphrase.", comment, e)))?
        } else {
            key
        };

        self.keys
            .write()
            .map_err(|_| Error::Other("key store lock poisoned".to_string()))?
            .push(LoadedKey {
                key,
                comment: comment.to_string(),
            });
        debug!(comment = %comment, "Identity added");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let task = self.listener.lock().await.take();
        let task = match task {
            Some(t) => t,
            None => {
                return Err(Error::Command(
                    "embedded ssh-agent is not running".to_string(),
                ))
            }
        };
        self.log.line("Stopping embedded ssh-agent");
        self.cancel.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "Embedded ssh-agent listener panicked");
        }
        if let Ok(mut keys) = self.keys.write() {
            keys.clear();
        }

        self.node.remove(&self.socket).await?;
        if let Some(dir) = &self.own_dir {
            self.node.remove(dir).await?;
        }
        info!(node = self.node.name(), socket = %self.socket.display(), "Embedded ssh-agent stopped");
        Ok(())
    }
}

/// The in-process agent, for local nodes.
pub struct EmbeddedAgentProvider;

impl EmbeddedAgentProvider {
    pub const KEY: &'static str = "embedded";
}

#[async_trait]
impl AgentProvider for EmbeddedAgentProvider {
    fn key(&self) -> &str {
        Self::KEY
    }

    fn display_name(&self) -> &str {
        "Embedded ssh-agent (in-process, Unix socket)"
    }

    async fn is_supported(&self, node: &Arc<dyn Node>, _log: &BuildLog) -> bool {
        cfg!(unix) && node.is_local()
    }

    async fn start(
        &self,
        node: Arc<dyn Node>,
        log: &BuildLog,
        temp_hint: Option<&Path>,
    ) -> Result<AgentHandle> {
        let agent = EmbeddedAgent::start(node, temp_hint, log.clone()).await?;
        Ok(export(agent))
    }
}
