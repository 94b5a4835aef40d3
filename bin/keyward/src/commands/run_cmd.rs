use keyward_core::{Config, Error, Paths};
use keyward_scope::{AgentScope, ScopeRequest};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{ensure_abandoned, scope_context};

/// Runs `command` inside a fresh agent scope and returns its exit code.
pub async fn run(
    credentials: Vec<String>,
    ignore_missing: bool,
    temp_dir: Option<PathBuf>,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let ctx = scope_context(&paths, &config, temp_dir)?;

    let request = ScopeRequest::new(credentials).ignore_missing(ignore_missing);
    let scope = AgentScope::begin(ctx, request).await?;
    eprintln!("keyward scope {} (resume with `keyward resume {} -- ...`)", scope.id(), scope.id());

    let env = scope.environment();
    let cancel = cancel_on_ctrl_c();
    let code = scope.run_body(&cancel, exec(command, env)).await?;
    Ok(code)
}

/// Brings an interrupted scope back with a new agent and runs `command`.
pub async fn resume(
    scope_id: &str,
    temp_dir: Option<PathBuf>,
    force: bool,
    command: Vec<String>,
) -> anyhow::Result<i32> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let ctx = scope_context(&paths, &config, temp_dir)?;

    let record = ctx.store.load(scope_id).await?;
    ensure_abandoned(&record, force)?;
    let scope = AgentScope::resume(ctx, scope_id).await?;
    let env = scope.environment();
    let cancel = cancel_on_ctrl_c();
    let code = scope.run_body(&cancel, exec(command, env)).await?;
    Ok(code)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, tearing down");
            trigger.cancel();
        }
    });
    cancel
}

async fn exec(command: Vec<String>, env: BTreeMap<String, String>) -> keyward_core::Result<i32> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| Error::Command("No command given".to_string()))?;
    // Killed with the future if the build is cancelled.
    let status = tokio::process::Command::new(program)
        .args(args)
        .envs(&env)
        .kill_on_drop(true)
        .status()
        .await?;
    Ok(status.code().unwrap_or(1))
}
