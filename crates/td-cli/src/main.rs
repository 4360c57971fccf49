mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use td_core::config::Config;

/// termdeck CLI -- drive PTY terminal sessions and watch for CLI agents.
#[derive(Parser)]
#[command(name = "td", version, about)]
struct Cli {
    /// Config file (defaults to ~/.termdeck/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration as TOML.
    Config,

    /// Open a terminal, type the given lines, and stream session events as
    /// JSON lines until the duration elapses.
    Run {
        /// Shell to launch instead of the configured default.
        #[arg(long)]
        shell: Option<String>,
        /// Working directory for the shell.
        #[arg(long)]
        cwd: Option<String>,
        /// A line to type into the terminal (repeatable).
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Pause between typed lines.
        #[arg(long, default_value_t = 200)]
        input_delay_ms: u64,
        /// How long to keep the terminal open.
        #[arg(long, default_value_t = 1500)]
        duration_ms: u64,
    },

    /// Classify a typed command line against the agent signatures.
    Detect {
        /// The line as a user would type it.
        line: String,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    td_telemetry::logging::init(
        "td",
        td_telemetry::logging::LogFormat::from_config(&config.general.log_format),
        &config.general.log_level,
    );

    match cli.command {
        Commands::Config => commands::config::run(&config)?,
        Commands::Run {
            shell,
            cwd,
            inputs,
            input_delay_ms,
            duration_ms,
        } => {
            commands::run::run(
                &config,
                commands::run::RunArgs {
                    shell,
                    cwd,
                    inputs,
                    input_delay_ms,
                    duration_ms,
                },
            )
            .await?;
        }
        Commands::Detect { line } => commands::detect::run(&config, &line)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_collects_repeated_inputs() {
        let cli = Cli::parse_from(["td", "run", "-i", "ls", "--input", "claude", "--duration-ms", "10"]);
        match cli.command {
            Commands::Run {
                inputs, duration_ms, ..
            } => {
                assert_eq!(inputs, vec!["ls", "claude"]);
                assert_eq!(duration_ms, 10);
            }
            _ => panic!("expected run"),
        }
    }
}
