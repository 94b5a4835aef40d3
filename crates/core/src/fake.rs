//! Scripted node that emulates OpenSSH's `ssh-agent` and `ssh-add` on a
//! real directory, so agent lifecycles can be exercised without OpenSSH.
//!
//! Keys whose first line is `ENCRYPTED:<passphrase>` require that passphrase,
//! obtained the way `ssh-add` does: by running `$SSH_ASKPASS` when no
//! terminal is available or `SSH_ASKPASS_REQUIRE=force` is set. A wrong
//! answer makes `ssh-add` ask again, as OpenSSH does.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::local::{create_private_dir, remove_path, write_private_file};
use crate::node::{LaunchOutcome, LaunchSpec, Node};

#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub detach_tty: bool,
    /// Watched paths that existed when the command was launched.
    pub present: Vec<PathBuf>,
}

impl LaunchRecord {
    pub fn program(&self) -> &str {
        self.argv
            .first()
            .map(|p| basename(p))
            .unwrap_or("")
    }
}

struct FakeAgent {
    socket: PathBuf,
    /// Directory the agent created for its socket; `None` with `-a`.
    dir: Option<PathBuf>,
    keys: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    agents: BTreeMap<u32, FakeAgent>,
    launches: Vec<LaunchRecord>,
    watched: Vec<PathBuf>,
}

pub struct FakeNode {
    name: String,
    root: PathBuf,
    unix: bool,
    local: bool,
    agent_installed: bool,
    start_failure: Option<String>,
    hanging: Vec<String>,
    state: Mutex<FakeState>,
}

impl FakeNode {
    /// A Unix node with `ssh-agent` installed, keeping its agents under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            name: "fake".to_string(),
            root: root.into(),
            unix: true,
            local: false,
            agent_installed: true,
            start_failure: None,
            hanging: Vec::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn non_unix(mut self) -> Self {
        self.unix = false;
        self
    }

    /// Reports the node as sharing this process's filesystem.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Every `ssh-agent` launch fails to spawn.
    pub fn without_agent(mut self) -> Self {
        self.agent_installed = false;
        self
    }

    /// `ssh-agent` runs but exits 1 with `message` on stderr.
    pub fn failing_start(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    /// Every launch of `program` outlives its timeout.
    pub fn timing_out(mut self, program: impl Into<String>) -> Self {
        self.hanging.push(program.into());
        self
    }

    /// Records, with every later launch, whether `path` existed at that moment.
    pub fn watch(&self, path: impl Into<PathBuf>) {
        self.state().watched.push(path.into());
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state().launches.clone()
    }

    pub fn launches_of(&self, program: &str) -> Vec<LaunchRecord> {
        self.launches()
            .into_iter()
            .filter(|l| l.program() == program)
            .collect()
    }

    /// Sockets of agents that are still running.
    pub fn live_sockets(&self) -> Vec<PathBuf> {
        self.state().agents.values().map(|a| a.socket.clone()).collect()
    }

    pub fn keys_for(&self, socket: &Path) -> Vec<String> {
        self.state()
            .agents
            .values()
            .find(|a| a.socket == socket)
            .map(|a| a.keys.clone())
            .unwrap_or_default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_agent(&self, spec: &LaunchSpec) -> Result<LaunchOutcome> {
        if let Some(message) = &self.start_failure {
            return Ok(LaunchOutcome {
                code: Some(1),
                stdout: String::new(),
                stderr: message.clone(),
            });
        }
        let bind_address = match spec.argv.get(1).map(String::as_str) {
            Some("-a") => match spec.argv.get(2) {
                Some(path) => Some(PathBuf::from(path)),
                None => return Ok(failure(1, "option requires an argument -- a")),
            },
            _ => None,
        };
        if let Some(path) = &bind_address {
            if path.exists() {
                return Ok(failure(
                    1,
                    &format!("bind: Address already in use\nunix_listener: cannot bind to path {}", path.display()),
                ));
            }
        }

        let mut state = self.state();
        state.next_pid += 1;
        let pid = 4000 + state.next_pid;
        let (socket, dir) = match bind_address {
            Some(path) => (path, None),
            None => {
                let dir = self.root.join(format!("ssh-fake{}", pid));
                create_private_dir(&dir)?;
                (dir.join(format!("agent.{}", pid)), Some(dir))
            }
        };
        std::fs::write(&socket, b"")?;
        let stdout = format!(
            "SSH_AUTH_SOCK={sock}; export SSH_AUTH_SOCK;\nSSH_AGENT_PID={pid}; export SSH_AGENT_PID;\necho Agent pid {pid};\n",
            sock = socket.display(),
            pid = pid
        );
        state.agents.insert(
            pid,
            FakeAgent {
                socket,
                dir,
                keys: Vec::new(),
            },
        );
        Ok(LaunchOutcome {
            code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }

    fn kill_agent(&self, spec: &LaunchSpec) -> Result<LaunchOutcome> {
        let pid = spec
            .env
            .get("SSH_AGENT_PID")
            .map(|p| p.trim())
            .filter(|p| !p.is_empty());
        let pid = match pid {
            Some(p) => p,
            None => {
                return Ok(failure(1, "SSH_AGENT_PID not set, cannot kill agent"));
            }
        };
        let pid: u32 = match pid.parse() {
            Ok(p) => p,
            Err(_) => return Ok(failure(1, &format!("{}: invalid PID", pid))),
        };
        let agent = self.state().agents.remove(&pid);
        match agent {
            Some(agent) => {
                remove_path(&agent.socket)?;
                if let Some(dir) = &agent.dir {
                    remove_path(dir)?;
                }
                Ok(LaunchOutcome {
                    code: Some(0),
                    stdout: format!(
                        "unset SSH_AUTH_SOCK;\nunset SSH_AGENT_PID;\necho Agent pid {} killed;\n",
                        pid
                    ),
                    stderr: String::new(),
                })
            }
            None => Ok(failure(1, "kill: No such process")),
        }
    }

    async fn add_key(&self, spec: &LaunchSpec) -> Result<LaunchOutcome> {
        let socket = spec.env.get("SSH_AUTH_SOCK").cloned().unwrap_or_default();
        let pid = {
            let state = self.state();
            state
                .agents
                .iter()
                .find(|(_, a)| a.socket.as_os_str() == socket.as_str())
                .map(|(pid, _)| *pid)
        };
        let pid = match pid {
            Some(p) => p,
            None => {
                return Ok(failure(
                    2,
                    "Could not open a connection to your authentication agent.",
                ))
            }
        };

        let key = match spec.argv.get(1).map(String::as_str) {
            Some("-") | None => String::from_utf8_lossy(spec.stdin.as_deref().unwrap_or_default())
                .to_string(),
            Some(path) => match std::fs::read_to_string(path) {
                Ok(k) => k,
                Err(e) => return Ok(failure(1, &format!("{}: {}", path, e))),
            },
        };

        if let Some(expected) = key
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("ENCRYPTED:"))
        {
            let mut accepted = false;
            for _ in 0..3 {
                match self.ask_passphrase(spec).await? {
                    Answer::Given(p) if p == expected => {
                        accepted = true;
                        break;
                    }
                    Answer::Given(_) => continue,
                    Answer::NoTty => {
                        return Ok(failure(
                            1,
                            "Enter passphrase: read_passphrase: can't open /dev/tty: No such device or address",
                        ))
                    }
                    Answer::Missing(askpass) => {
                        return Ok(failure(
                            1,
                            &format!("ssh_askpass: exec({}): No such file or directory", askpass),
                        ))
                    }
                }
            }
            if !accepted {
                return Ok(failure(1, "Bad passphrase"));
            }
        }

        if let Some(agent) = self.state().agents.get_mut(&pid) {
            agent.keys.push(key);
        }
        Ok(LaunchOutcome {
            code: Some(0),
            stdout: String::new(),
            stderr: format!("Identity added: {}\n", spec.argv.get(1).cloned().unwrap_or_default()),
        })
    }

    async fn ask_passphrase(&self, spec: &LaunchSpec) -> Result<Answer> {
        let askpass = match spec.env.get("SSH_ASKPASS") {
            Some(a) if !a.is_empty() => a.clone(),
            _ => return Ok(Answer::NoTty),
        };
        let forced = spec.env.get("SSH_ASKPASS_REQUIRE").map(String::as_str) == Some("force");
        if !forced && !spec.detach_tty {
            return Ok(Answer::NoTty);
        }
        if !Path::new(&askpass).exists() {
            return Ok(Answer::Missing(askpass));
        }
        match run_askpass(&askpass, spec).await? {
            Some(p) => Ok(Answer::Given(p)),
            None => Ok(Answer::NoTty),
        }
    }
}

enum Answer {
    Given(String),
    NoTty,
    /// The askpass program is gone, e.g. a relay script that already ran.
    Missing(String),
}

#[cfg(unix)]
async fn run_askpass(askpass: &str, spec: &LaunchSpec) -> Result<Option<String>> {
    let output = tokio::process::Command::new(askpass)
        .arg("Enter passphrase:")
        .envs(&spec.env)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(Some(stdout.trim_end_matches(['\r', '\n']).to_string()))
}

#[cfg(not(unix))]
async fn run_askpass(askpass: &str, spec: &LaunchSpec) -> Result<Option<String>> {
    // Mirrors the relay script: print the variable, then self-delete.
    let value = spec.env.get("SSH_PASSPHRASE").cloned();
    remove_path(Path::new(askpass))?;
    Ok(value)
}

fn failure(code: i32, stderr: &str) -> LaunchOutcome {
    LaunchOutcome {
        code: Some(code),
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

fn basename(program: &str) -> &str {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
}

#[async_trait]
impl Node for FakeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_unix(&self) -> bool {
        self.unix
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.clone()
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome> {
        {
            let mut state = self.state();
            let present = state
                .watched
                .iter()
                .filter(|p| std::fs::symlink_metadata(p).is_ok())
                .cloned()
                .collect();
            state.launches.push(LaunchRecord {
                argv: spec.argv.clone(),
                env: spec.env.clone(),
                detach_tty: spec.detach_tty,
                present,
            });
        }

        let program = basename(spec.program());
        if self.hanging.iter().any(|h| h == program) {
            return Err(Error::Timeout(format!(
                "'{}' did not finish within {} seconds",
                spec.display(),
                spec.timeout.as_secs()
            )));
        }
        let first_arg = spec.argv.get(1).map(String::as_str);
        match (program, first_arg) {
            ("ssh-agent", _) if !self.agent_installed => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "ssh-agent: command not found",
            ))),
            ("ssh-agent", Some("-k")) => self.kill_agent(&spec),
            ("ssh-agent", None | Some("-a")) => self.start_agent(&spec),
            ("ssh-add", _) => self.add_key(&spec).await,
            _ => Ok(failure(127, &format!("{}: command not found", spec.program()))),
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        create_private_dir(path)
    }

    async fn write_temp_file(
        &self,
        dir: &Path,
        prefix: &str,
        suffix: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<PathBuf> {
        write_private_file(dir, prefix, suffix, contents, mode)
    }

    async fn remove(&self, path: &Path) -> Result<bool> {
        remove_path(path)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(std::fs::symlink_metadata(path).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_start_and_kill() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path());
        let out = node.launch(LaunchSpec::new(["ssh-agent"])).await.unwrap();
        assert!(out.success());
        assert!(out.stdout.starts_with("SSH_AUTH_SOCK="));
        let socket = node.live_sockets().pop().unwrap();
        assert!(socket.exists());

        let unset = node
            .launch(LaunchSpec::new(["ssh-agent", "-k"]).env("SSH_AGENT_PID", ""))
            .await
            .unwrap();
        assert_eq!(unset.code, Some(1));

        let killed = node
            .launch(LaunchSpec::new(["ssh-agent", "-k"]).env("SSH_AGENT_PID", "4001"))
            .await
            .unwrap();
        assert!(killed.success());
        assert!(!socket.exists());
        assert!(node.live_sockets().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_key_needs_askpass() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path());
        node.launch(LaunchSpec::new(["ssh-agent"])).await.unwrap();
        let socket = node.live_sockets().pop().unwrap();
        let key = dir.path().join("k.key");
        std::fs::write(&key, "ENCRYPTED:pw\nbody\n").unwrap();

        let out = node
            .launch(
                LaunchSpec::new(["ssh-add".to_string(), key.display().to_string()])
                    .env("SSH_AUTH_SOCK", socket.display().to_string()),
            )
            .await
            .unwrap();
        assert_eq!(out.code, Some(1));
        assert!(node.keys_for(&socket).is_empty());
    }

    #[tokio::test]
    async fn test_bind_address_leaves_directory_alone() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path());
        let socket = dir.path().join("agent.sock");
        let spec = LaunchSpec::new(["ssh-agent".to_string(), "-a".to_string(), socket.display().to_string()]);
        assert!(node.launch(spec.clone()).await.unwrap().success());
        assert!(socket.exists());
        // OpenSSH refuses to bind over an existing socket.
        assert_eq!(node.launch(spec).await.unwrap().code, Some(1));

        node.launch(LaunchSpec::new(["ssh-agent", "-k"]).env("SSH_AGENT_PID", "4001"))
            .await
            .unwrap();
        assert!(!socket.exists());
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_timing_out_program() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path()).timing_out("ssh-add");
        let result = node.launch(LaunchSpec::new(["/usr/bin/ssh-add", "-l"])).await;
        assert!(matches!(result, Err(Error::Timeout(m)) if m.contains("60 seconds")));
        assert!(node.launch(LaunchSpec::new(["ssh-agent"])).await.is_ok());
    }

    #[tokio::test]
    async fn test_launch_records_watched_paths() {
        let dir = tempfile::tempdir().unwrap();
        let node = FakeNode::new(dir.path());
        let marker = dir.path().join("marker");
        node.watch(&marker);
        node.launch(LaunchSpec::new(["true"])).await.unwrap();
        std::fs::write(&marker, b"").unwrap();
        node.launch(LaunchSpec::new(["true"])).await.unwrap();

        let launches = node.launches();
        assert!(launches[0].present.is_empty());
        assert_eq!(launches[1].present, vec![marker]);
    }
}
