mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "Per-build ssh-agent with guaranteed teardown", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an agent, load credentials, run a command with SSH_AUTH_SOCK set
    Run {
        /// Credential id to load (repeatable)
        #[arg(short, long = "credential", required = true)]
        credentials: Vec<String>,

        /// Skip unknown credential ids instead of failing
        #[arg(long)]
        ignore_missing: bool,

        /// Parent directory for key files and relay scripts
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Restart the agent of an interrupted scope and run a command with it
    Resume {
        /// Scope id printed by `keyward run`
        scope_id: String,

        /// Parent directory for the work directory, for scopes that never
        /// chose one
        #[arg(long)]
        temp_dir: Option<PathBuf>,

        /// Resume even if the controller that owns the scope is still running
        #[arg(long)]
        force: bool,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop leftover agents and delete artifacts of interrupted scopes
    Purge {
        /// Scope id to purge
        scope_id: Option<String>,

        /// Purge every recorded scope
        #[arg(long, conflicts_with = "scope_id")]
        all: bool,

        /// Also purge scopes whose controller is still running
        #[arg(long)]
        force: bool,
    },

    /// List scopes that have not been torn down
    Scopes,

    /// Check ssh-agent availability and provider support
    Doctor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            credentials,
            ignore_missing,
            temp_dir,
            command,
        } => {
            let code = commands::run_cmd::run(credentials, ignore_missing, temp_dir, command).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Resume {
            scope_id,
            temp_dir,
            force,
            command,
        } => {
            let code = commands::run_cmd::resume(&scope_id, temp_dir, force, command).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Purge { scope_id, all, force } => {
            commands::scopes::purge(scope_id, all, force).await?;
        }
        Commands::Scopes => {
            commands::scopes::list().await?;
        }
        Commands::Doctor => {
            commands::doctor::run().await?;
        }
    }

    Ok(())
}
