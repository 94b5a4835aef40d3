use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default = "default_ssh_agent_command")]
    pub ssh_agent_command: String,
    #[serde(default = "default_ssh_add_command")]
    pub ssh_add_command: String,
    /// Absolute agent binary used by the `unix` fallback provider.
    #[serde(default = "default_unix_agent_path")]
    pub unix_agent_path: String,
    /// Bound for `ssh-agent`, `ssh-add` and `ssh-agent -k`.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Bound for provider supportability checks. Kept shorter than the
    /// command timeout so a hung check cannot stall selection.
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
}

fn default_ssh_agent_command() -> String {
    "ssh-agent".to_string()
}

fn default_ssh_add_command() -> String {
    "ssh-add".to_string()
}

fn default_unix_agent_path() -> String {
    "/usr/bin/ssh-agent".to_string()
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_check_timeout_secs() -> u64 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            ssh_agent_command: default_ssh_agent_command(),
            ssh_add_command: default_ssh_add_command(),
            unix_agent_path: default_unix_agent_path(),
            command_timeout_secs: default_command_timeout_secs(),
            check_timeout_secs: default_check_timeout_secs(),
        }
    }
}

impl AgentConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    /// Provider keys in priority order. Unknown keys are rejected when the
    /// selector is built.
    #[serde(default = "default_enabled_providers")]
    pub enabled: Vec<String>,
}

fn default_enabled_providers() -> Vec<String> {
    vec!["exec".to_string(), "unix".to_string(), "embedded".to_string()]
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_providers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScopeConfig {
    /// Directory on the node under which per-scope work directories are
    /// created. Falls back to the node's temp dir.
    #[serde(default)]
    pub temp_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn scope_temp_dir(&self) -> Option<PathBuf> {
        self.scope
            .temp_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(expand_home)
    }

    pub fn credentials_file(&self, paths: &Paths) -> PathBuf {
        self.credentials
            .file
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(expand_home)
            .unwrap_or_else(|| paths.credentials_file())
    }
}

fn expand_home(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(s))
    } else {
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.agent.ssh_agent_command, "ssh-agent");
        assert_eq!(cfg.agent.command_timeout(), Duration::from_secs(60));
        assert_eq!(cfg.agent.check_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.providers.enabled, vec!["exec", "unix", "embedded"]);
        assert!(cfg.scope_temp_dir().is_none());
    }

    #[test]
    fn test_camel_case_overrides() {
        let raw = r#"{
  "agent": { "sshAgentCommand": "/opt/ssh/bin/ssh-agent", "checkTimeoutSecs": 3 },
  "providers": { "enabled": ["unix"] },
  "scope": { "tempDir": "  /var/tmp/kw  " }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.agent.ssh_agent_command, "/opt/ssh/bin/ssh-agent");
        assert_eq!(cfg.agent.ssh_add_command, "ssh-add");
        assert_eq!(cfg.agent.check_timeout_secs, 3);
        assert_eq!(cfg.providers.enabled, vec!["unix"]);
        assert_eq!(cfg.scope_temp_dir(), Some(PathBuf::from("/var/tmp/kw")));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut cfg = Config::default();
        cfg.agent.command_timeout_secs = 5;
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.agent.command_timeout_secs, 5);
    }
}
