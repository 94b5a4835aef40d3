use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One command to run on a node: argv, environment overrides, optional stdin
/// and a hard timeout.
#[derive(Clone)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Start the process in a new session with no controlling terminal.
    pub detach_tty: bool,
}

impl LaunchSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            stdin: None,
            timeout: DEFAULT_TIMEOUT,
            detach_tty: false,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn detach_tty(mut self) -> Self {
        self.detach_tty = true;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// The command line for log output. Environment values are never shown.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

// Environment values may carry passphrases, so only keys are printed.
impl std::fmt::Debug for LaunchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchSpec")
            .field("argv", &self.argv)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("stdin", &self.stdin.as_ref().map(|b| b.len()))
            .field("timeout", &self.timeout)
            .field("detach_tty", &self.detach_tty)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchOutcome {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl LaunchOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code_display(&self) -> String {
        self.code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string())
    }

    /// Combined output, trimmed, for error details.
    pub fn output(&self) -> String {
        let stdout = self.stdout.trim();
        let stderr = self.stderr.trim();
        match (stdout.is_empty(), stderr.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout.to_string(),
            (true, false) => stderr.to_string(),
            (false, false) => format!("{}\n{}", stdout, stderr),
        }
    }
}

/// An execution node: somewhere commands run and temp files live.
///
/// A timed-out launch yields `Error::Timeout`; spawn failures yield
/// `Error::Io`. A process that ran returns `Ok` whatever its exit code.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    fn is_unix(&self) -> bool;

    fn temp_dir(&self) -> PathBuf;

    /// True when the node's filesystem is this process's own, so a socket
    /// bound here is reachable by commands launched there.
    fn is_local(&self) -> bool {
        false
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome>;

    /// Creates a directory (and parents) readable only by the owner.
    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Creates a uniquely named file in `dir` with the given permission bits
    /// and contents, and returns its path.
    async fn write_temp_file(
        &self,
        dir: &Path,
        prefix: &str,
        suffix: &str,
        contents: &[u8],
        mode: u32,
    ) -> Result<PathBuf>;

    /// Removes a file, socket or directory tree. `Ok(false)` if nothing was
    /// there.
    async fn remove(&self, path: &Path) -> Result<bool>;

    async fn exists(&self, path: &Path) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_env_values() {
        let spec = LaunchSpec::new(["ssh-add", "/tmp/k.key"])
            .env("SSH_PASSPHRASE", "secret")
            .timeout(Duration::from_secs(5));
        let rendered = format!("{:?}", spec);
        assert!(rendered.contains("SSH_PASSPHRASE"));
        assert!(!rendered.contains("secret"));
        assert_eq!(spec.program(), "ssh-add");
        assert_eq!(spec.display(), "ssh-add /tmp/k.key");
    }

    #[test]
    fn test_outcome_output_combines_streams() {
        let outcome = LaunchOutcome {
            code: Some(2),
            stdout: " out \n".to_string(),
            stderr: "err\n".to_string(),
        };
        assert!(!outcome.success());
        assert_eq!(outcome.output(), "out\nerr");
        assert_eq!(LaunchOutcome::default().code_display(), "signal");
    }
}
