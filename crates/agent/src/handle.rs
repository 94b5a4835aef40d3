//! The agent handle and the request/response boundary it is carried over.
//!
//! An agent process lives on the node; callers only ever hold an
//! [`AgentHandle`]. [`export`] moves an agent into a host task that owns it
//! and serves [`AgentRequest`]s, so the handle stays valid no matter where
//! the agent runs, and the process itself never has to be serialized.

use async_trait::async_trait;
use keyward_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use zeroize::Zeroize;

#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Value for `SSH_AUTH_SOCK`.
    async fn socket(&self) -> Result<String>;

    /// Everything the agent announced when it started (socket, pid, ...).
    async fn environment(&self) -> Result<BTreeMap<String, String>>;

    async fn add_identity(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<()>;

    async fn stop(&self) -> Result<()>;
}

pub type AgentHandle = Arc<dyn RemoteAgent>;

#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    Socket,
    Environment,
    AddIdentity {
        private_key: String,
        passphrase: Option<String>,
        comment: String,
    },
    Stop,
}

impl Drop for AgentRequest {
    fn drop(&mut self) {
        if let AgentRequest::AddIdentity {
            private_key,
            passphrase,
            ..
        } = self
        {
            private_key.zeroize();
            passphrase.zeroize();
        }
    }
}

impl std::fmt::Debug for AgentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRequest::Socket => f.write_str("Socket"),
            AgentRequest::Environment => f.write_str("Environment"),
            AgentRequest::AddIdentity { comment, .. } => f
                .debug_struct("AddIdentity")
                .field("comment", comment)
                .finish_non_exhaustive(),
            AgentRequest::Stop => f.write_str("Stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentResponse {
    Socket { socket: String },
    Environment { vars: BTreeMap<String, String> },
    Done,
    Failed { kind: FailureKind, message: String },
}

/// Error category preserved across the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Bootstrap,
    Identity,
    Command,
    Timeout,
    Other,
}

impl AgentResponse {
    fn failed(err: &Error) -> Self {
        let (kind, message) = match err {
            Error::Bootstrap(m) => (FailureKind::Bootstrap, m.clone()),
            Error::Identity(m) => (FailureKind::Identity, m.clone()),
            Error::Command(m) => (FailureKind::Command, m.clone()),
            Error::Timeout(m) => (FailureKind::Timeout, m.clone()),
            other => (FailureKind::Other, other.to_string()),
        };
        AgentResponse::Failed { kind, message }
    }

    fn into_error(kind: FailureKind, message: String) -> Error {
        match kind {
            FailureKind::Bootstrap => Error::Bootstrap(message),
            FailureKind::Identity => Error::Identity(message),
            FailureKind::Command => Error::Command(message),
            FailureKind::Timeout => Error::Timeout(message),
            FailureKind::Other => Error::Other(message),
        }
    }
}

struct Envelope {
    request: AgentRequest,
    reply: oneshot::Sender<AgentResponse>,
}

/// Client side of an exported agent.
#[derive(Clone)]
pub struct AgentClient {
    tx: mpsc::Sender<Envelope>,
}

impl AgentClient {
    async fn call(&self, request: AgentRequest) -> Result<AgentResponse> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| Error::Channel("agent host has shut down".to_string()))?;
        let response = rx
            .await
            .map_err(|_| Error::Channel("agent host dropped the request".to_string()))?;
        match response {
            AgentResponse::Failed { kind, message } => {
                Err(AgentResponse::into_error(kind, message))
            }
            other => Ok(other),
        }
    }
}

fn unexpected(response: AgentResponse) -> Error {
    Error::Channel(format!("unexpected agent response: {:?}", response))
}

#[async_trait]
impl RemoteAgent for AgentClient {
    async fn socket(&self) -> Result<String> {
        match self.call(AgentRequest::Socket).await? {
            AgentResponse::Socket { socket } => Ok(socket),
            other => Err(unexpected(other)),
        }
    }

    async fn environment(&self) -> Result<BTreeMap<String, String>> {
        match self.call(AgentRequest::Environment).await? {
            AgentResponse::Environment { vars } => Ok(vars),
            other => Err(unexpected(other)),
        }
    }

    async fn add_identity(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<()> {
        let request = AgentRequest::AddIdentity {
            private_key: private_key.to_string(),
            passphrase: passphrase.map(str::to_string),
            comment: comment.to_string(),
        };
        match self.call(request).await? {
            AgentResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn stop(&self) -> Result<()> {
        match self.call(AgentRequest::Stop).await? {
            AgentResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

async fn serve<A: RemoteAgent>(agent: &A, request: &AgentRequest) -> AgentResponse {
    let result = match request {
        AgentRequest::Socket => agent
            .socket()
            .await
            .map(|socket| AgentResponse::Socket { socket }),
        AgentRequest::Environment => agent
            .environment()
            .await
            .map(|vars| AgentResponse::Environment { vars }),
        AgentRequest::AddIdentity {
            private_key,
            passphrase,
            comment,
        } => agent
            .add_identity(private_key, passphrase.as_deref(), comment)
            .await
            .map(|_| AgentResponse::Done),
        AgentRequest::Stop => agent.stop().await.map(|_| AgentResponse::Done),
    };
    result.unwrap_or_else(|e| AgentResponse::failed(&e))
}

/// Moves `agent` into a host task and returns a handle to it.
///
/// The host exits after serving `Stop`. If every handle is dropped without a
/// stop, the host stops the agent itself.
pub fn export<A: RemoteAgent + 'static>(agent: A) -> AgentHandle {
    let (tx, mut rx) = mpsc::channel::<Envelope>(8);
    tokio::spawn(async move {
        let mut stopped = false;
        while let Some(Envelope { request, reply }) = rx.recv().await {
            debug!(request = ?request, "Agent host request");
            let is_stop = matches!(request, AgentRequest::Stop);
            let response = serve(&agent, &request).await;
            drop(request);
            let _ = reply.send(response);
            if is_stop {
                stopped = true;
                break;
            }
        }
        if !stopped {
            warn!("Agent handle dropped without stop; stopping agent");
            if let Err(e) = agent.stop().await {
                warn!(error = %e, "Failed to stop abandoned agent");
            }
        }
        debug!("Agent host exited");
    });
    Arc::new(AgentClient { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAgent {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RemoteAgent for RecordingAgent {
        async fn socket(&self) -> Result<String> {
            Ok("/tmp/agent.sock".to_string())
        }

        async fn environment(&self) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::from([(
                "SSH_AUTH_SOCK".to_string(),
                "/tmp/agent.sock".to_string(),
            )]))
        }

        async fn add_identity(
            &self,
            _private_key: &str,
            passphrase: Option<&str>,
            comment: &str,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(format!("add {}", comment));
            if passphrase == Some("wrong") {
                return Err(Error::Identity("Bad passphrase".to_string()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.calls.lock().unwrap().push("stop".to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exported_agent_round_trip() {
        let agent = RecordingAgent::default();
        let calls = agent.calls.clone();
        let handle = export(agent);

        assert_eq!(handle.socket().await.unwrap(), "/tmp/agent.sock");
        assert_eq!(handle.environment().await.unwrap().len(), 1);
        handle.add_identity("KEY", None, "git").await.unwrap();
        let err = handle.add_identity("KEY", Some("wrong"), "git").await.unwrap_err();
        assert!(matches!(err, Error::Identity(m) if m == "Bad passphrase"));
        handle.stop().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["add git", "add git", "stop"]);
        // The host is gone once stopped.
        assert!(matches!(handle.socket().await, Err(Error::Channel(_))));
    }

    #[tokio::test]
    async fn test_dropped_handle_stops_agent() {
        let agent = RecordingAgent::default();
        let calls = agent.calls.clone();
        let handle = export(agent);
        handle.socket().await.unwrap();
        drop(handle);
        for _ in 0..50 {
            if calls.lock().unwrap().contains(&"stop".to_string()) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("abandoned agent was not stopped");
    }

    #[test]
    fn test_wire_format_and_redaction() {
        let request = AgentRequest::AddIdentity {
            private_key: "PRIVATE".to_string(),
            passphrase: Some("secret".to_string()),
            comment: "git (deploy)".to_string(),
        };
        let debug = format!("{:?}", request);
        assert!(!debug.contains("PRIVATE"));
        assert!(!debug.contains("secret"));

        let json = serde_json::to_value(AgentResponse::Failed {
            kind: FailureKind::Identity,
            message: "Bad passphrase".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "identity");
        assert_eq!(serde_json::to_value(&AgentRequest::Stop).unwrap()["op"], "stop");
    }
}
