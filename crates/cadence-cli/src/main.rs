//! CLI entry point: parses arguments, loads settings and runs the requested
//! command.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadence_cli::config::load_settings;
use cadence_cli::{Cli, CliError, Commands, run_simulation};
use cadence_core::SettingsUpdate;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over -v
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "cadence failed");
        std::process::exit(e.exit_code());
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Commands::Simulate {
            turns,
            config,
            session_timeout_ms,
            idle_debounce_ms,
        } => {
            let overrides = SettingsUpdate {
                session_inactivity_timeout_ms: session_timeout_ms.map(Some),
                ux_idle_debounce_ms: idle_debounce_ms.map(Some),
                ..SettingsUpdate::default()
            };
            let settings = load_settings(config.as_deref(), &overrides)?;
            tracing::debug!(?settings, "Settings loaded");

            let report = run_simulation(&settings, turns).await?;
            tracing::info!(
                turns = report.turns.len(),
                completed = report.directives_completed,
                failed = report.directives_failed,
                ux_changes = report.ux_states.len(),
                "Simulation finished"
            );
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| CliError::Runtime(e.to_string()))?;
            println!("{json}");
            Ok(())
        }
    }
}
