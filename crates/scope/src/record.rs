use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use keyward_core::process_alive;

use crate::ledger::ArtifactLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    #[default]
    Idle,
    Resolving,
    Starting,
    Provisioning,
    Running,
    TearingDown,
}

/// What survives a controller restart: enough to purge leftovers and start
/// an equivalent agent again. Holds no key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeRecord {
    pub version: u32,
    pub id: String,
    pub node: String,
    pub credential_ids: Vec<String>,
    #[serde(default)]
    pub ignore_missing: bool,
    #[serde(default)]
    pub ledger: ArtifactLedger,
    /// Key of the provider that started the current agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Last environment the agent announced (socket and pid).
    #[serde(default)]
    pub agent_env: BTreeMap<String, String>,
    /// Parent of the work directory, chosen when the scope began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_hint: Option<PathBuf>,
    /// Controller process currently driving the scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub state: ScopeState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ScopeRecord {
    pub fn new(
        id: impl Into<String>,
        node: impl Into<String>,
        credential_ids: Vec<String>,
        ignore_missing: bool,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            version: 1,
            id: id.into(),
            node: node.into(),
            credential_ids,
            ignore_missing,
            ledger: ArtifactLedger::default(),
            provider: None,
            agent_env: BTreeMap::new(),
            temp_hint: None,
            owner_pid: Some(std::process::id()),
            state: ScopeState::Idle,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    pub fn set_state(&mut self, state: ScopeState) {
        self.state = state;
        self.updated_at_ms = Utc::now().timestamp_millis();
    }

    pub fn socket(&self) -> Option<&str> {
        self.agent_env
            .get(keyward_agent::AUTH_SOCK_VAR)
            .map(String::as_str)
    }

    pub fn claim(&mut self) {
        self.owner_pid = Some(std::process::id());
    }

    /// Whether the controller that owns this scope is still running here.
    /// Records without an owner count as abandoned.
    pub fn owner_alive(&self) -> bool {
        self.owner_pid.map(process_alive).unwrap_or(false)
    }
}
