use async_trait::async_trait;
use keyward_core::config::{AgentConfig, Config};
use keyward_core::{BuildLog, Error, LaunchSpec, Node, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bootstrap::AGENT_PID_VAR;
use crate::embedded::EmbeddedAgentProvider;
use crate::handle::{export, AgentHandle};
use crate::native::{kill_announced, NativeAgent, NativeOptions};

/// One way of getting an ssh-agent running on a node.
#[async_trait]
pub trait AgentProvider: Send + Sync {
    /// Stable key used in config and persisted scope records.
    fn key(&self) -> &str;

    fn display_name(&self) -> &str;

    /// Quick check; must not leave anything running on the node.
    async fn is_supported(&self, node: &Arc<dyn Node>, log: &BuildLog) -> bool;

    async fn start(
        &self,
        node: Arc<dyn Node>,
        log: &BuildLog,
        temp_hint: Option<&Path>,
    ) -> Result<AgentHandle>;

    /// Stops an agent this provider started in an earlier process, given the
    /// environment it announced back then.
    async fn stop_orphan(
        &self,
        _node: &Arc<dyn Node>,
        _vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        Ok(())
    }
}

/// `ssh-agent` looked up on the node's `PATH`.
pub struct ExecAgentProvider {
    options: NativeOptions,
    check_timeout: Duration,
}

impl ExecAgentProvider {
    pub const KEY: &'static str = "exec";

    pub fn new(config: &AgentConfig) -> Self {
        Self {
            options: NativeOptions::from_config(config),
            check_timeout: config.check_timeout(),
        }
    }
}

#[async_trait]
impl AgentProvider for ExecAgentProvider {
    fn key(&self) -> &str {
        Self::KEY
    }

    fn display_name(&self) -> &str {
        "Exec ssh-agent (binary ssh-agent on a remote machine)"
    }

    async fn is_supported(&self, node: &Arc<dyn Node>, log: &BuildLog) -> bool {
        // `ssh-agent -k` with no agent to kill exits 1 without side effects.
        let spec = LaunchSpec::new([self.options.agent_command.as_str(), "-k"])
            .env(AGENT_PID_VAR, "")
            .timeout(self.check_timeout);
        match node.launch(spec).await {
            Ok(outcome) => {
                debug!(node = node.name(), code = ?outcome.code, "ssh-agent check finished");
                matches!(outcome.code, Some(0) | Some(1))
            }
            Err(e) => {
                log.line(format!("Could not find ssh-agent: {}", e));
                log.line("Check if ssh-agent is installed and in PATH");
                false
            }
        }
    }

    async fn start(
        &self,
        node: Arc<dyn Node>,
        log: &BuildLog,
        temp_hint: Option<&Path>,
    ) -> Result<AgentHandle> {
        let options = self.options.clone().with_temp_dir(temp_hint);
        let agent = NativeAgent::start(node, options, log.clone()).await?;
        Ok(export(agent))
    }

    async fn stop_orphan(
        &self,
        node: &Arc<dyn Node>,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        kill_announced(
            node.as_ref(),
            &self.options.agent_command,
            vars,
            self.options.timeout,
        )
        .await
    }
}

/// The system agent at a fixed absolute path, for Unix nodes whose `PATH`
/// does not reach it.
pub struct UnixAgentProvider {
    options: NativeOptions,
}

impl UnixAgentProvider {
    pub const KEY: &'static str = "unix";

    pub fn new(config: &AgentConfig) -> Self {
        Self {
            options: NativeOptions::from_config(config)
                .with_agent_command(config.unix_agent_path.clone()),
        }
    }
}

#[async_trait]
impl AgentProvider for UnixAgentProvider {
    fn key(&self) -> &str {
        Self::KEY
    }

    fn display_name(&self) -> &str {
        "Unix ssh-agent command"
    }

    async fn is_supported(&self, node: &Arc<dyn Node>, _log: &BuildLog) -> bool {
        node.is_unix()
    }

    async fn start(
        &self,
        node: Arc<dyn Node>,
        log: &BuildLog,
        temp_hint: Option<&Path>,
    ) -> Result<AgentHandle> {
        let options = self.options.clone().with_temp_dir(temp_hint);
        let agent = NativeAgent::start(node, options, log.clone()).await?;
        Ok(export(agent))
    }

    async fn stop_orphan(
        &self,
        node: &Arc<dyn Node>,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        kill_announced(
            node.as_ref(),
            &self.options.agent_command,
            vars,
            self.options.timeout,
        )
        .await
    }
}

/// Builds the enabled providers in configured order.
pub fn providers_from_config(config: &Config) -> Result<Vec<Arc<dyn AgentProvider>>> {
    config
        .providers
        .enabled
        .iter()
        .map(|key| -> Result<Arc<dyn AgentProvider>> {
            match key.as_str() {
                ExecAgentProvider::KEY => Ok(Arc::new(ExecAgentProvider::new(&config.agent))),
                UnixAgentProvider::KEY => Ok(Arc::new(UnixAgentProvider::new(&config.agent))),
                EmbeddedAgentProvider::KEY => Ok(Arc::new(EmbeddedAgentProvider)),
                other => Err(Error::Config(format!("Unknown ssh-agent provider: {}", other))),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::fake::FakeNode;

    fn fake(dir: &Path) -> (Arc<FakeNode>, Arc<dyn Node>) {
        let node = Arc::new(FakeNode::new(dir));
        let dyn_node: Arc<dyn Node> = node.clone();
        (node, dyn_node)
    }

    #[tokio::test]
    async fn test_exec_check_accepts_exit_one() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, node) = fake(dir.path());
        let (log, _) = BuildLog::memory();
        let provider = ExecAgentProvider::new(&AgentConfig::default());
        assert!(provider.is_supported(&node, &log).await);

        let check = fake.launches().pop().unwrap();
        assert_eq!(check.argv, vec!["ssh-agent", "-k"]);
        assert_eq!(check.env.get("SSH_AGENT_PID").map(String::as_str), Some(""));
        assert!(fake.live_sockets().is_empty());
    }

    #[tokio::test]
    async fn test_exec_check_fails_without_binary() {
        let dir = tempfile::tempdir().unwrap();
        let node: Arc<dyn Node> = Arc::new(FakeNode::new(dir.path()).without_agent());
        let (log, sink) = BuildLog::memory();
        let provider = ExecAgentProvider::new(&AgentConfig::default());
        assert!(!provider.is_supported(&node, &log).await);
        assert!(sink.contains("Could not find ssh-agent"));
        assert!(sink.contains("Check if ssh-agent is installed and in PATH"));
    }

    #[tokio::test]
    async fn test_unix_provider_uses_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, node) = fake(dir.path());
        let (log, _) = BuildLog::memory();
        let provider = UnixAgentProvider::new(&AgentConfig::default());
        assert!(provider.is_supported(&node, &log).await);

        let handle = provider.start(node.clone(), &log, None).await.unwrap();
        let start = fake.launches_of("ssh-agent").pop().unwrap();
        assert_eq!(start.argv, vec!["/usr/bin/ssh-agent"]);
        handle.stop().await.unwrap();
        assert!(fake.live_sockets().is_empty());

        let windows: Arc<dyn Node> = Arc::new(FakeNode::new(dir.path()).non_unix());
        assert!(!provider.is_supported(&windows, &log).await);
    }

    #[tokio::test]
    async fn test_stop_orphan_kills_announced_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (fake, node) = fake(dir.path());
        let (log, _) = BuildLog::memory();
        let provider = ExecAgentProvider::new(&AgentConfig::default());
        // A controller that is simply forgotten, as after a crash.
        let agent = NativeAgent::start(node.clone(), NativeOptions::default(), log)
            .await
            .unwrap();
        let vars = agent.agent_env().vars().clone();
        drop(agent);
        assert_eq!(fake.live_sockets().len(), 1);

        provider.stop_orphan(&node, &vars).await.unwrap();
        assert!(fake.live_sockets().is_empty());
        assert!(provider.stop_orphan(&node, &vars).await.is_err());
    }

    #[test]
    fn test_providers_from_config_order_and_unknown_key() {
        let mut config = Config::default();
        let providers = providers_from_config(&config).unwrap();
        let keys: Vec<_> = providers.iter().map(|p| p.key().to_string()).collect();
        assert_eq!(keys, vec!["exec", "unix", "embedded"]);

        config.providers.enabled = vec!["unix".to_string(), "pageant".to_string()];
        let err = providers_from_config(&config).err().unwrap();
        assert!(matches!(err, Error::Config(m) if m.contains("pageant")));
    }
}
