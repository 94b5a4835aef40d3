pub mod bootstrap;
pub mod embedded;
pub mod handle;
pub mod native;
pub mod provider;
pub mod selector;

pub use bootstrap::{AgentEnv, AGENT_PID_VAR, AUTH_SOCK_VAR};
pub use embedded::{EmbeddedAgent, EmbeddedAgentProvider};
pub use handle::{export, AgentClient, AgentHandle, AgentRequest, AgentResponse, FailureKind, RemoteAgent};
pub use native::{kill_announced, NativeAgent, NativeOptions};
pub use provider::{providers_from_config, AgentProvider, ExecAgentProvider, UnixAgentProvider};
pub use selector::{AgentSelector, FaultMap, Selection};
