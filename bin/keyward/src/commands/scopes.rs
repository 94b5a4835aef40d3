use chrono::{Local, TimeZone};
use keyward_core::{Config, Paths};
use keyward_scope::{AgentScope, ScopeStore};

use super::{ensure_abandoned, owner_status, scope_context};

pub async fn list() -> anyhow::Result<()> {
    let paths = Paths::new();
    let records = ScopeStore::new(paths.clone()).list().await?;
    if records.is_empty() {
        println!("No scopes recorded.");
        return Ok(());
    }

    println!("{:<38} {:<14} {:<10} {:<20} CREDENTIALS", "ID", "STATE", "NODE", "CREATED");
    for record in &records {
        let created = Local
            .timestamp_millis_opt(record.created_at_ms)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<14} {:<10} {:<20} {}",
            record.id,
            format!("{:?}", record.state),
            record.node,
            created,
            record.credential_ids.join(",")
        );
        println!("  owner: {}", owner_status(record));
        if let Some(socket) = record.socket() {
            println!("  socket: {}", socket);
        }
        for path in record.ledger.entries() {
            println!("  artifact: {}", path.display());
        }
    }
    println!();
    println!("{} scope(s). Use `keyward purge <id>` to clean up.", records.len());
    Ok(())
}

pub async fn purge(scope_id: Option<String>, all: bool, force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let ctx = scope_context(&paths, &config, None)?;

    let ids: Vec<String> = if all {
        let mut ids = Vec::new();
        for record in ctx.store.list().await? {
            if ensure_abandoned(&record, force).is_ok() {
                ids.push(record.id);
            } else {
                println!("Skipping scope {}: owner {}", record.id, owner_status(&record));
            }
        }
        ids
    } else {
        match scope_id {
            Some(id) => {
                ensure_abandoned(&ctx.store.load(&id).await?, force)?;
                vec![id]
            }
            None => anyhow::bail!("Give a scope id or --all"),
        }
    };

    for id in ids {
        let deleted = AgentScope::purge(ctx.clone(), &id).await?;
        println!("Purged scope {} ({} artifact(s) deleted)", id, deleted);
    }
    Ok(())
}
