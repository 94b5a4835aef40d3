pub mod doctor;
pub mod run_cmd;
pub mod scopes;

use keyward_agent::AgentSelector;
use keyward_core::{BuildLog, Config, FileCredentialStore, LocalNode, Node, Paths};
use keyward_scope::{ScopeContext, ScopeRecord, ScopeStore};
use std::path::PathBuf;
use std::sync::Arc;

/// Wires the local node, the configured credentials file and providers into
/// a scope context.
pub fn scope_context(
    paths: &Paths,
    config: &Config,
    temp_dir: Option<PathBuf>,
) -> anyhow::Result<ScopeContext> {
    paths.ensure_dirs()?;
    let node: Arc<dyn Node> = Arc::new(LocalNode::new().with_temp_dir(paths.tmp_dir()));
    let credentials = FileCredentialStore::load_or_empty(&config.credentials_file(paths))?;
    let selector = AgentSelector::from_config(config)?;
    Ok(ScopeContext::new(
        node,
        Arc::new(credentials),
        Arc::new(selector),
        ScopeStore::new(paths.clone()),
        BuildLog::tracing(),
    )
    .with_temp_hint(temp_dir.or_else(|| config.scope_temp_dir())))
}

/// Refuses to touch a scope whose controller is still running, unless forced.
pub fn ensure_abandoned(record: &ScopeRecord, force: bool) -> anyhow::Result<()> {
    if force || !record.owner_alive() {
        return Ok(());
    }
    anyhow::bail!(
        "Scope {} is still owned by running process {}; pass --force to take it over",
        record.id,
        record.owner_pid.unwrap_or_default()
    )
}

/// `running (pid N)`, `gone (pid N)` or `unknown` for listings.
pub fn owner_status(record: &ScopeRecord) -> String {
    match record.owner_pid {
        Some(pid) if record.owner_alive() => format!("running (pid {})", pid),
        Some(pid) => format!("gone (pid {})", pid),
        None => "unknown".to_string(),
    }
}
