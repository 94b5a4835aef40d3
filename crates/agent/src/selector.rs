use keyward_core::{BuildLog, Config, Error, Node, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handle::AgentHandle;
use crate::provider::{providers_from_config, AgentProvider};

const NOT_SUPPORTED: &str = "not supported on this node";

/// Why each provider could not be used, in the order they were tried.
#[derive(Debug, Clone, Default)]
pub struct FaultMap {
    entries: Vec<(String, String)>,
}

impl FaultMap {
    pub fn record(&mut self, provider: impl Into<String>, cause: impl Into<String>) {
        self.entries.push((provider.into(), cause.into()));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    /// `* name` followed by each cause line indented four spaces.
    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (name, cause) in &self.entries {
            lines.push(format!("* {}", name));
            for line in cause.lines() {
                lines.push(format!("    {}", line));
            }
        }
        lines
    }
}

/// A started agent and the provider that started it.
pub struct Selection {
    pub provider: String,
    pub display_name: String,
    pub handle: AgentHandle,
}

/// Tries providers in priority order until one starts an agent.
pub struct AgentSelector {
    providers: Vec<Arc<dyn AgentProvider>>,
}

impl AgentSelector {
    pub fn new(providers: Vec<Arc<dyn AgentProvider>>) -> Self {
        Self { providers }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(providers_from_config(config)?))
    }

    pub fn providers(&self) -> &[Arc<dyn AgentProvider>] {
        &self.providers
    }

    pub fn provider(&self, key: &str) -> Option<&Arc<dyn AgentProvider>> {
        self.providers.iter().find(|p| p.key() == key)
    }

    pub async fn select(
        &self,
        node: &Arc<dyn Node>,
        log: &BuildLog,
        temp_hint: Option<&Path>,
    ) -> Result<Selection> {
        log.line("Looking for ssh-agent implementation...");
        let mut faults = FaultMap::default();

        for provider in &self.providers {
            let name = provider.display_name();
            if !provider.is_supported(node, log).await {
                debug!(provider = provider.key(), node = node.name(), "Provider not supported");
                faults.record(name, NOT_SUPPORTED);
                continue;
            }
            log.line(format!("  {}", name));
            match provider.start(node.clone(), log, temp_hint).await {
                Ok(handle) => {
                    info!(provider = provider.key(), node = node.name(), "ssh-agent provider selected");
                    return Ok(Selection {
                        provider: provider.key().to_string(),
                        display_name: name.to_string(),
                        handle,
                    });
                }
                Err(e) => {
                    warn!(provider = provider.key(), error = %e, "ssh-agent provider failed to start");
                    faults.record(name, e.chain());
                }
            }
        }

        log.fatal("Could not find a suitable ssh-agent provider");
        log.line("Diagnostic report");
        for line in faults.report_lines() {
            log.line(line);
        }

        if self.providers.is_empty() {
            return Err(Error::NoProvider("no providers are registered".to_string()));
        }
        let tried: Vec<&str> = self.providers.iter().map(|p| p.display_name()).collect();
        Err(Error::NoProvider(format!("tried {}", tried.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{export, RemoteAgent};
    use async_trait::async_trait;
    use keyward_core::fake::FakeNode;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct NullAgent;

    #[async_trait]
    impl RemoteAgent for NullAgent {
        async fn socket(&self) -> Result<String> {
            Ok("/tmp/null.sock".to_string())
        }

        async fn environment(&self) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        async fn add_identity(&self, _: &str, _: Option<&str>, _: &str) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Scripted {
        key: &'static str,
        supported: bool,
        fails_with: Option<&'static str>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(
            key: &'static str,
            supported: bool,
            fails_with: Option<&'static str>,
            calls: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<dyn AgentProvider> {
            Arc::new(Self {
                key,
                supported,
                fails_with,
                calls: calls.clone(),
            })
        }
    }

    #[async_trait]
    impl AgentProvider for Scripted {
        fn key(&self) -> &str {
            self.key
        }

        fn display_name(&self) -> &str {
            self.key
        }

        async fn is_supported(&self, _node: &Arc<dyn Node>, _log: &BuildLog) -> bool {
            self.calls.lock().unwrap().push(format!("check {}", self.key));
            self.supported
        }

        async fn start(
            &self,
            _node: Arc<dyn Node>,
            _log: &BuildLog,
            _temp_hint: Option<&Path>,
        ) -> Result<AgentHandle> {
            self.calls.lock().unwrap().push(format!("start {}", self.key));
            match self.fails_with {
                Some(cause) => Err(Error::Bootstrap(cause.to_string())),
                None => Ok(export(NullAgent)),
            }
        }
    }

    fn node() -> (tempfile::TempDir, Arc<dyn Node>) {
        let dir = tempfile::tempdir().unwrap();
        let node: Arc<dyn Node> = Arc::new(FakeNode::new(dir.path()));
        (dir, node)
    }

    #[tokio::test]
    async fn test_priority_order_and_no_start_when_unsupported() {
        let (_dir, node) = node();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let selector = AgentSelector::new(vec![
            Scripted::new("a", false, None, &calls),
            Scripted::new("b", true, Some("boom"), &calls),
            Scripted::new("c", true, None, &calls),
            Scripted::new("d", true, None, &calls),
        ]);
        let (log, sink) = BuildLog::memory();
        let selection = selector.select(&node, &log, None).await.unwrap();

        assert_eq!(selection.provider, "c");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["check a", "check b", "start b", "check c", "start c"]
        );
        assert!(!sink.contains("FATAL"));
        assert_eq!(sink.lines()[0], "[ssh-agent] Looking for ssh-agent implementation...");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_every_provider() {
        let (_dir, node) = node();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let selector = AgentSelector::new(vec![
            Scripted::new("first", true, Some("socket dir missing\nsecond line"), &calls),
            Scripted::new("second", false, None, &calls),
        ]);
        let (log, sink) = BuildLog::memory();
        let err = selector.select(&node, &log, None).await.err().unwrap();

        match err {
            Error::NoProvider(message) => {
                assert!(message.contains("first"));
                assert!(message.contains("second"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let lines = sink.lines();
        assert!(lines.contains(&"[ssh-agent] FATAL: Could not find a suitable ssh-agent provider".to_string()));
        assert!(lines.contains(&"[ssh-agent] Diagnostic report".to_string()));
        assert!(lines.contains(&"[ssh-agent] * first".to_string()));
        assert!(sink.contains("    Agent bootstrap error: socket dir missing"));
        assert!(lines.contains(&"[ssh-agent]     second line".to_string()));
        assert!(lines.contains(&"[ssh-agent] * second".to_string()));
        assert!(sink.contains(NOT_SUPPORTED));
    }

    #[tokio::test]
    async fn test_empty_registry_fails() {
        let (_dir, node) = node();
        let (log, sink) = BuildLog::memory();
        let err = AgentSelector::new(Vec::new())
            .select(&node, &log, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoProvider(_)));
        assert!(sink.contains("FATAL"));
    }

    #[tokio::test]
    async fn test_from_config_with_fake_node() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeNode::new(dir.path()));
        let node: Arc<dyn Node> = fake.clone();
        let selector = AgentSelector::from_config(&Config::default()).unwrap();
        assert!(selector.provider("unix").is_some());

        let (log, sink) = BuildLog::memory();
        let selection = selector.select(&node, &log, None).await.unwrap();
        assert_eq!(selection.provider, "exec");
        assert!(sink.contains("  Exec ssh-agent (binary ssh-agent on a remote machine)"));
        selection.handle.stop().await.unwrap();
        assert!(fake.live_sockets().is_empty());
    }

    #[test]
    fn test_fault_map_report_format() {
        let mut faults = FaultMap::default();
        faults.record("Exec", "line one\nline two");
        assert_eq!(
            faults.report_lines(),
            vec!["* Exec", "    line one", "    line two"]
        );
    }
}
