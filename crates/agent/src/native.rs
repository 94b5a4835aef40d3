//! Controller for a native OpenSSH `ssh-agent` process on a node.

use async_trait::async_trait;
use keyward_core::config::AgentConfig;
use keyward_core::{BuildLog, Error, LaunchOutcome, LaunchSpec, Node, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bootstrap::{AgentEnv, AGENT_PID_VAR, AUTH_SOCK_VAR};
use crate::handle::RemoteAgent;

const PASSPHRASE_VAR: &str = "SSH_PASSPHRASE";

const UNIX_RELAY_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$SSH_PASSPHRASE\"\nrm -f \"$0\"\n";
const WINDOWS_RELAY_SCRIPT: &str = "@echo off\r\necho %SSH_PASSPHRASE%\r\ndel \"%~f0\"\r\n";

#[derive(Debug, Clone)]
pub struct NativeOptions {
    pub agent_command: String,
    pub add_command: String,
    pub timeout: Duration,
    /// Where key files, relay scripts and the agent's socket go. Without
    /// one, key files use the node's temp directory and the agent picks its
    /// own socket path.
    pub temp_dir: Option<PathBuf>,
}

impl NativeOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            agent_command: config.ssh_agent_command.clone(),
            add_command: config.ssh_add_command.clone(),
            timeout: config.command_timeout(),
            temp_dir: None,
        }
    }

    pub fn with_agent_command(mut self, command: impl Into<String>) -> Self {
        self.agent_command = command.into();
        self
    }

    pub fn with_temp_dir(mut self, dir: Option<&Path>) -> Self {
        self.temp_dir = dir.map(Path::to_path_buf);
        self
    }
}

impl Default for NativeOptions {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// A running `ssh-agent` started by this controller.
pub struct NativeAgent {
    node: Arc<dyn Node>,
    options: NativeOptions,
    env: AgentEnv,
    log: BuildLog,
}

impl NativeAgent {
    /// Runs `ssh-agent` and parses what it announces. Any failure, a timeout
    /// included, is a bootstrap error carrying the captured output.
    pub async fn start(node: Arc<dyn Node>, options: NativeOptions, log: BuildLog) -> Result<Self> {
        let mut argv = vec![options.agent_command.clone()];
        if let Some(dir) = &options.temp_dir {
            node.create_dir(dir)
                .await
                .map_err(|e| Error::Bootstrap(format!("Failed to create {}: {}", dir.display(), e)))?;
            argv.push("-a".to_string());
            argv.push(socket_path(dir).display().to_string());
        }
        let spec = LaunchSpec::new(argv).timeout(options.timeout);
        let outcome = node.launch(spec).await.map_err(|e| match e {
            Error::Timeout(m) => Error::Bootstrap(m),
            other => Error::Bootstrap(format!(
                "Failed to run {}: {}",
                options.agent_command, other
            )),
        })?;
        if !outcome.success() {
            return Err(Error::Bootstrap(format!(
                "{} exited with code {}: {}",
                options.agent_command,
                outcome.code_display(),
                outcome.output()
            )));
        }

        let env = AgentEnv::parse(&outcome.stdout)?;
        let socket = env.socket().unwrap_or_default();
        log.line(format!("Started ssh-agent (socket {})", socket));
        info!(
            node = node.name(),
            socket = %socket,
            pid = ?env.pid(),
            "ssh-agent started"
        );
        Ok(Self {
            node,
            options,
            env,
            log,
        })
    }

    pub fn agent_env(&self) -> &AgentEnv {
        &self.env
    }

    fn work_dir(&self) -> PathBuf {
        self.options
            .temp_dir
            .clone()
            .unwrap_or_else(|| self.node.temp_dir())
    }

    async fn write_relay_script(&self, dir: &Path) -> Result<PathBuf> {
        let (suffix, body) = if self.node.is_unix() {
            (".sh", UNIX_RELAY_SCRIPT)
        } else {
            (".bat", WINDOWS_RELAY_SCRIPT)
        };
        self.node
            .write_temp_file(dir, "askpass_", suffix, body.as_bytes(), 0o700)
            .await
    }

    async fn run_add(
        &self,
        key_file: &Path,
        passphrase: Option<&str>,
        dir: &Path,
    ) -> Result<(LaunchOutcome, Option<PathBuf>)> {
        let mut spec = LaunchSpec::new([
            self.options.add_command.clone(),
            key_file.display().to_string(),
        ])
        .envs(self.env.vars())
        .timeout(self.options.timeout);

        let mut script = None;
        if let Some(passphrase) = passphrase {
            let path = self.write_relay_script(dir).await?;
            spec = spec
                .env("SSH_ASKPASS", path.display().to_string())
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", ":0")
                .env(PASSPHRASE_VAR, passphrase)
                .detach_tty();
            script = Some(path);
        }

        let result = self.node.launch(spec).await;
        match result {
            Ok(outcome) => Ok((outcome, script)),
            Err(e) => {
                if let Some(path) = &script {
                    let _ = self.node.remove(path).await;
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl RemoteAgent for NativeAgent {
    async fn socket(&self) -> Result<String> {
        self.env
            .socket()
            .map(str::to_string)
            .ok_or_else(|| Error::Bootstrap(format!("{} not announced", AUTH_SOCK_VAR)))
    }

    async fn environment(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.env.vars().clone())
    }

    async fn add_identity(
        &self,
        private_key: &str,
        passphrase: Option<&str>,
        comment: &str,
    ) -> Result<()> {
        self.log.line(format!("Adding identity: {}", comment));
        let dir = self.work_dir();
        self.node.create_dir(&dir).await?;

        let mut contents = private_key.as_bytes().to_vec();
        if !private_key.ends_with('\n') {
            contents.push(b'\n');
        }
        let key_file = self
            .node
            .write_temp_file(&dir, "private_key_", ".key", &contents, 0o600)
            .await;
        contents.fill(0);
        let key_file = key_file?;

        let result = self.run_add(&key_file, passphrase, &dir).await;

        if let Err(e) = self.node.remove(&key_file).await {
            warn!(path = %key_file.display(), error = %e, "Failed to delete private key file");
            self.log
                .warn(format!("Could not delete {}: {}", key_file.display(), e));
        }

        let (outcome, script) = result.map_err(|e| {
            Error::Identity(format!("{}: {}. Check the passphrase.", comment, e))
        })?;
        // The relay script deletes itself when run; clean up when it wasn't.
        if let Some(script) = script {
            if let Err(e) = self.node.remove(&script).await {
                debug!(path = %script.display(), error = %e, "Relay script cleanup failed");
            }
        }

        if !outcome.success() {
            return Err(Error::Identity(format!(
                "{}: ssh-add exited with code {}: {}. Check the passphrase.",
                comment,
                outcome.code_display(),
                outcome.output()
            )));
        }
        debug!(comment = %comment, "Identity added");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.log.line("Stopping ssh-agent");
        kill_announced(
            self.node.as_ref(),
            &self.options.agent_command,
            self.env.vars(),
            self.options.timeout,
        )
        .await?;
        info!(node = self.node.name(), pid = ?self.env.pid(), "ssh-agent stopped");
        Ok(())
    }
}

/// A fresh socket name in `dir`; `ssh-agent -a` will not bind over an
/// existing one.
fn socket_path(dir: &Path) -> PathBuf {
    let id = Uuid::new_v4().simple().to_string();
    dir.join(format!("agent-{}.sock", &id[..8]))
}

/// Runs `<agent_command> -k` against the agent described by `vars`.
pub async fn kill_announced(
    node: &dyn Node,
    agent_command: &str,
    vars: &BTreeMap<String, String>,
    timeout: Duration,
) -> Result<()> {
    if !vars.contains_key(AGENT_PID_VAR) {
        return Err(Error::Command(format!(
            "cannot stop ssh-agent: {} was not announced",
            AGENT_PID_VAR
        )));
    }
    let spec = LaunchSpec::new([agent_command, "-k"])
        .envs(vars)
        .timeout(timeout);
    let outcome = node.launch(spec).await.map_err(|e| match e {
        Error::Timeout(m) => Error::Command(m),
        other => Error::Command(format!("Failed to run {} -k: {}", agent_command, other)),
    })?;
    if !outcome.success() {
        return Err(Error::Command(format!(
            "{} -k exited with code {}: {}",
            agent_command,
            outcome.code_display(),
            outcome.output()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_core::fake::FakeNode;
    use std::path::PathBuf;

    fn setup() -> (tempfile::TempDir, Arc<FakeNode>) {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode::new(dir.path()));
        (dir, node)
    }

    fn options(dir: &Path) -> NativeOptions {
        NativeOptions::default().with_temp_dir(Some(&dir.join("work")))
    }

    /// Key files and relay scripts still in the work dir.
    fn leftovers(dir: &Path) -> Vec<PathBuf> {
        match std::fs::read_dir(dir.join("work")) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                    name.starts_with("private_key_") || name.starts_with("askpass_")
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_start_parses_announced_env() {
        let (dir, node) = setup();
        let (log, sink) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        let socket = PathBuf::from(agent.socket().await.unwrap());
        assert_eq!(socket.parent(), Some(dir.path().join("work").as_path()));
        assert!(socket.display().to_string().ends_with(".sock"));
        assert_eq!(agent.agent_env().pid(), Some(4001));
        assert_eq!(node.live_sockets(), vec![socket.clone()]);
        assert!(sink.contains("Started ssh-agent"));

        let start = node.launches_of("ssh-agent").pop().unwrap();
        assert_eq!(start.argv, vec!["ssh-agent".to_string(), "-a".to_string(), socket.display().to_string()]);
    }

    #[tokio::test]
    async fn test_start_without_temp_dir_lets_agent_choose() {
        let (dir, node) = setup();
        let (log, _) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), NativeOptions::default(), log)
            .await
            .unwrap();
        let socket = agent.socket().await.unwrap();
        assert!(socket.ends_with("agent.4001"));
        assert!(!dir.path().join("work").exists());
        assert_eq!(node.launches_of("ssh-agent").pop().unwrap().argv, vec!["ssh-agent"]);
    }

    #[tokio::test]
    async fn test_add_identity_without_passphrase() {
        let (dir, node) = setup();
        let (log, sink) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        agent
            .add_identity("-----KEY-----", None, "git (deploy)")
            .await
            .unwrap();

        let socket = PathBuf::from(agent.socket().await.unwrap());
        assert_eq!(node.keys_for(&socket), vec!["-----KEY-----\n".to_string()]);
        assert!(leftovers(dir.path()).is_empty());

        let add = node.launches_of("ssh-add").pop().unwrap();
        assert!(add.argv[1].ends_with(".key"));
        assert!(!add.env.contains_key("SSH_ASKPASS"));
        assert!(!add.detach_tty);
        assert!(sink.contains("Adding identity: git (deploy)"));
    }

    #[tokio::test]
    async fn test_add_identity_with_passphrase_uses_relay_script() {
        let (dir, node) = setup();
        let (log, sink) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        agent
            .add_identity("ENCRYPTED:secret\nbody", Some("secret"), "git")
            .await
            .unwrap();

        let add = node.launches_of("ssh-add").pop().unwrap();
        assert_eq!(add.env.get("SSH_ASKPASS_REQUIRE").map(String::as_str), Some("force"));
        assert_eq!(add.env.get("DISPLAY").map(String::as_str), Some(":0"));
        assert!(add.env["SSH_ASKPASS"].ends_with(".sh"));
        assert!(add.detach_tty);
        assert!(!Path::new(&add.env["SSH_ASKPASS"]).exists());
        assert!(leftovers(dir.path()).is_empty());

        let socket = PathBuf::from(agent.socket().await.unwrap());
        assert_eq!(node.keys_for(&socket).len(), 1);
        assert!(!sink.contents().contains("secret"));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_identity_error() {
        let (dir, node) = setup();
        let (log, sink) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        let err = agent
            .add_identity("ENCRYPTED:right\nbody", Some("wrong"), "git")
            .await
            .unwrap_err();
        match err {
            Error::Identity(message) => {
                // ssh-add asks again and finds the relay script gone.
                assert!(message.contains("ssh_askpass: exec("));
                assert!(message.contains("No such file or directory"));
                assert!(message.contains("Check the passphrase"));
                assert!(!message.contains("wrong"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(leftovers(dir.path()).is_empty());
        assert!(!sink.contents().contains("wrong"));
    }

    #[tokio::test]
    async fn test_start_timeout_is_bootstrap_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode::new(dir.path()).timing_out("ssh-agent"));
        let (log, _) = BuildLog::memory();
        let err = NativeAgent::start(node, options(dir.path()), log)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Bootstrap(ref m) if m.contains("did not finish within 60 seconds")));
    }

    #[tokio::test]
    async fn test_ssh_add_timeout_is_identity_error_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode::new(dir.path()).timing_out("ssh-add"));
        let (log, _) = BuildLog::memory();
        let agent = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        let err = agent
            .add_identity("ENCRYPTED:secret\nbody", Some("secret"), "git")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Identity(ref m) if m.contains("did not finish")));

        // The relay script never ran, so it had to be removed for it.
        let add = node.launches_of("ssh-add").pop().unwrap();
        assert!(!Path::new(&add.env["SSH_ASKPASS"]).exists());
        assert!(!Path::new(&add.argv[1]).exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_kill_timeout_is_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path()).timing_out("ssh-agent");
        let vars = BTreeMap::from([(AGENT_PID_VAR.to_string(), "4001".to_string())]);
        let err = kill_announced(&node, "ssh-agent", &vars, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Command(ref m) if m.contains("did not finish within 5 seconds")));
    }

    #[tokio::test]
    async fn test_stop_then_start_gives_new_socket() {
        let (dir, node) = setup();
        let (log, _) = BuildLog::memory();
        let first = NativeAgent::start(node.clone(), options(dir.path()), log.clone())
            .await
            .unwrap();
        let first_socket = first.socket().await.unwrap();
        first.stop().await.unwrap();
        assert!(!Path::new(&first_socket).exists());
        assert!(node.live_sockets().is_empty());

        let kill = node.launches_of("ssh-agent").pop().unwrap();
        assert_eq!(kill.argv, vec!["ssh-agent", "-k"]);
        assert_eq!(kill.env.get("SSH_AGENT_PID").map(String::as_str), Some("4001"));

        let second = NativeAgent::start(node.clone(), options(dir.path()), log)
            .await
            .unwrap();
        assert_ne!(second.socket().await.unwrap(), first_socket);
        // A second stop of a dead agent fails.
        assert!(matches!(first.stop().await, Err(Error::Command(_))));
    }

    #[tokio::test]
    async fn test_failed_start_carries_output() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode::new(dir.path()).failing_start("unable to bind socket"));
        let (log, _) = BuildLog::memory();
        let err = NativeAgent::start(node, options(dir.path()), log)
            .await
            .err()
            .unwrap();
        match err {
            Error::Bootstrap(message) => assert!(message.contains("unable to bind socket")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_bootstrap_error() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(FakeNode::new(dir.path()).without_agent());
        let (log, _) = BuildLog::memory();
        let result = NativeAgent::start(node, options(dir.path()), log).await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
    }
}
