pub mod config;
pub mod credential;
pub mod error;
pub mod local;
pub mod log;
pub mod node;
pub mod paths;

#[cfg(any(test, feature = "test-support"))]
pub mod fake;

pub use config::Config;
pub use credential::{dedup_ids, CredentialStore, FileCredentialStore, MemoryCredentialStore, SshCredential};
pub use error::{Error, Result};
pub use local::{process_alive, LocalNode};
pub use log::{BuildLog, LogSink, MemorySink};
pub use node::{LaunchOutcome, LaunchSpec, Node};
pub use paths::Paths;
