use keyward_agent::AgentSelector;
use keyward_core::{BuildLog, Config, LocalNode, Node, Paths};
use keyward_scope::ScopeStore;
use std::path::Path;
use std::sync::Arc;

/// Checks the local node for everything an agent scope needs.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();

    println!();
    println!("keyward doctor");
    println!("==============");
    println!();

    let mut ok_count = 0u32;
    let mut warn_count = 0u32;
    let mut err_count = 0u32;

    println!("Configuration");
    if paths.config_file().exists() {
        print_ok("Config file", &paths.config_file().display().to_string());
    } else {
        print_ok("Config file not found", "using defaults");
    }
    ok_count += 1;
    let config = Config::load_or_default(&paths)?;

    let credentials_file = config.credentials_file(&paths);
    if credentials_file.exists() {
        print_ok("Credentials file", &credentials_file.display().to_string());
        ok_count += 1;
    } else {
        print_warn(
            "Credentials file not found",
            &format!("create {} to use `keyward run`", credentials_file.display()),
        );
        warn_count += 1;
    }
    println!();

    println!("Binaries");
    for (label, command) in [
        ("ssh-agent", config.agent.ssh_agent_command.as_str()),
        ("ssh-add", config.agent.ssh_add_command.as_str()),
    ] {
        match which::which(command) {
            Ok(path) => {
                print_ok(label, &path.display().to_string());
                ok_count += 1;
            }
            Err(_) => {
                print_err(&format!("{} not found", label), "install OpenSSH or set agent.* in config.json");
                err_count += 1;
            }
        }
    }
    if Path::new(&config.agent.unix_agent_path).exists() {
        print_ok("Fallback agent", &config.agent.unix_agent_path);
        ok_count += 1;
    } else {
        print_warn("Fallback agent missing", &config.agent.unix_agent_path);
        warn_count += 1;
    }
    println!();

    println!("Providers");
    match AgentSelector::from_config(&config) {
        Ok(selector) => {
            let node: Arc<dyn Node> = Arc::new(LocalNode::new());
            let (log, sink) = BuildLog::memory();
            for provider in selector.providers() {
                if provider.is_supported(&node, &log).await {
                    print_ok(provider.display_name(), "supported");
                    ok_count += 1;
                } else {
                    print_warn(provider.display_name(), "not supported on this node");
                    warn_count += 1;
                }
            }
            for line in sink.lines() {
                println!("    {}", line);
            }
        }
        Err(e) => {
            print_err("Provider configuration", &e.to_string());
            err_count += 1;
        }
    }
    println!();

    println!("Scopes");
    let records = ScopeStore::new(paths.clone()).list().await?;
    let (live, abandoned): (Vec<_>, Vec<_>) = records.iter().partition(|r| r.owner_alive());
    if !live.is_empty() {
        print_ok(&format!("{} scope(s) in use", live.len()), "owned by running controllers");
        ok_count += 1;
    }
    if abandoned.is_empty() {
        print_ok("No leftover scopes", "");
        ok_count += 1;
    } else {
        print_warn(
            &format!("{} scope(s) abandoned", abandoned.len()),
            "run `keyward scopes` and `keyward purge --all`",
        );
        warn_count += 1;
    }
    println!();

    println!("{} ok, {} warnings, {} errors", ok_count, warn_count, err_count);
    Ok(())
}

fn print_ok(label: &str, detail: &str) {
    if detail.is_empty() {
        println!("  [ok]   {}", label);
    } else {
        println!("  [ok]   {}: {}", label, detail);
    }
}

fn print_warn(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  [warn] {}", label);
    } else {
        println!("  [warn] {}: {}", label, hint);
    }
}

fn print_err(label: &str, hint: &str) {
    if hint.is_empty() {
        println!("  [err]  {}", label);
    } else {
        println!("  [err]  {}: {}", label, hint);
    }
}
