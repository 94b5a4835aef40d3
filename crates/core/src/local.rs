use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Error, Result};
use crate::node::{LaunchOutcome, LaunchSpec, Node};

/// The machine this process runs on.
#[derive(Debug, Clone)]
pub struct LocalNode {
    name: String,
    temp_dir: PathBuf,
}

impl LocalNode {
    pub fn new() -> Self {
        Self {
            name: "local".to_string(),
            temp_dir: std::env::temp_dir(),
        }
    }

    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.temp_dir = dir;
        self
    }
}

impl Default for LocalNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for LocalNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_unix(&self) -> bool {
        cfg!(unix)
    }

    fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone()
    }

    fn is_local(&self) -> bool {
        true
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<LaunchOutcome> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| Error::Command("Empty command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if spec.detach_tty {
            // SAFETY: setsid is async-signal-safe and touches no Rust state.
            unsafe {
                cmd.pre_exec(|| {
                    libc::setsid();
                    Ok(())
                });
            }
        }

        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "Launching");
        let mut child = cmd.spawn()?;

        if let Some(input) = spec.stdin.as_deref() {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input).await?;
                stdin.shutdown().await?;
            }
        }

        match timeout(spec.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(LaunchOutcome {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout(format!(
                "'{}' did not finish within {} seconds",
                spec.display(),
                spec.timeout.as_secs()
            ))),
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

/// Whether a process with this pid is running on this machine. Without a
/// way to ask, every pid counts as running.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let pid = match libc::pid_t::try_from(pid) {
        Ok(p) if p > 0 => p,
        _ => return false,
    };
    // SAFETY: signal 0 only checks that the pid exists.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

pub(crate) fn create_private_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)?;
    set_mode(path, 0o700)
}

pub(crate) fn write_private_file(
    dir: &Path,
    prefix: &str,
    suffix: &str,
    contents: &[u8],
    mode: u32,
) -> Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile_in(dir)?;
    file.write_all(contents)?;
    file.flush()?;
    set_mode(file.path(), mode)?;
    // Closing the handle here matters: an executable still open for writing
    // cannot be exec'd on Linux.
    let (_, path) = file.keep().map_err(|e| Error::Io(e.error))?;
    Ok(path)
}

pub(crate) fn remove_path(path: &Path) -> Result<bool> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(Error::Io(e)),
    };
    let result = if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
