//! `compliance-agent-appliance`: run the appliance, provision it, or drive
//! the update surface.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use compliance_appliance::agent::ApplianceAgent;
use compliance_appliance::config::{load_config, DEFAULT_STATE_DIR};
use compliance_appliance::{provisioning, update};

#[derive(Parser)]
#[command(name = "compliance-agent-appliance", version, about = "Self-healing compliance appliance")]
struct Cli {
    /// Path to config.yaml (default: <state_dir>/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provision this appliance with a one-time code
    #[arg(long, value_name = "CODE")]
    provision: Option<String>,

    /// Provision interactively (prompts for the code)
    #[arg(long)]
    provision_interactive: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Agent update operations (delegated to the partition applier)
    #[command(name = "update_agent")]
    UpdateAgent(UpdateArgs),
}

#[derive(Args)]
struct UpdateArgs {
    /// Check for an available update
    #[arg(long)]
    check: bool,
    /// Show current update status
    #[arg(long)]
    status: bool,
    /// Roll back to the previous partition
    #[arg(long)]
    rollback: bool,
    /// Report appliance health
    #[arg(long)]
    health: bool,
}

fn state_dir() -> PathBuf {
    std::env::var("STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STATE_DIR))
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let state_dir = state_dir();

    if let Some(code) = &cli.provision {
        return match provisioning::provision(code, &state_dir, None).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "provisioning failed");
                ExitCode::from(1)
            }
        };
    }
    if cli.provision_interactive {
        return match provisioning::provision_interactive(&state_dir, None).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "provisioning failed");
                ExitCode::from(1)
            }
        };
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| state_dir.join("config.yaml"));
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %config_path.display(), "invalid configuration");
            return ExitCode::from(1);
        }
    };

    if let Some(Command::UpdateAgent(args)) = &cli.command {
        let result = if args.check {
            update::check().await
        } else if args.rollback {
            update::rollback().await
        } else if args.health {
            update::health(&config).await
        } else {
            update::status(&config).await
        };
        return match result {
            Ok(value) => {
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "update command failed");
                ExitCode::from(1)
            }
        };
    }

    let agent = match ApplianceAgent::new(config) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            error!(error = %e, "failed to initialize appliance");
            return ExitCode::from(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(_) => {
                    let _ = ctrl_c.await;
                    info!("shutdown requested");
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    match agent.run(shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "appliance exited with error");
            ExitCode::from(1)
        }
    }
}
