//! Command-line definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive the cadence voice-assistant runtime.
#[derive(Debug, Parser)]
#[command(name = "cadence")]
#[command(about = "Drive the cadence voice-assistant runtime")]
#[command(version)]
pub struct Cli {
    /// Enable verbose/debug output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run simulated dialog turns through every component
    Simulate {
        /// Number of dialog turns
        #[arg(long, default_value_t = 3)]
        turns: usize,

        /// JSON settings file
        #[arg(long, env = "CADENCE_CONFIG")]
        config: Option<PathBuf>,

        /// Override the session inactivity timeout (milliseconds)
        #[arg(long = "session-timeout-ms")]
        session_timeout_ms: Option<u64>,

        /// Override the dialog UX idle debounce (milliseconds)
        #[arg(long = "idle-debounce-ms")]
        idle_debounce_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn simulate_arguments() {
        let cli = Cli::parse_from([
            "cadence",
            "-v",
            "simulate",
            "--turns",
            "5",
            "--config",
            "/tmp/cadence.json",
            "--idle-debounce-ms",
            "0",
        ]);
        assert!(cli.verbose);
        let Commands::Simulate {
            turns,
            config,
            session_timeout_ms,
            idle_debounce_ms,
        } = cli.command;
        assert_eq!(turns, 5);
        assert_eq!(config, Some(PathBuf::from("/tmp/cadence.json")));
        assert_eq!(session_timeout_ms, None);
        assert_eq!(idle_debounce_ms, Some(0));
    }
}
