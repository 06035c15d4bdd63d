use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "llm-telemetry", version, about = "LLM telemetry ingestion and rate limiting service")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true, env = "LLM_TELEMETRY_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the telemetry server (default)
    Start,

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Display the effective configuration as TOML
    Show,

    /// Validate configuration file
    Validate,
}

impl Cli {
    /// Get the command to execute, defaulting to Start if none provided
    pub fn get_command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_start() {
        let cli = Cli::parse_from(["llm-telemetry"]);
        assert_eq!(cli.get_command(), Commands::Start);
        assert_eq!(cli.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn test_config_subcommands() {
        let cli = Cli::parse_from(["llm-telemetry", "config", "validate", "--config", "/etc/t.toml"]);
        assert_eq!(
            cli.get_command(),
            Commands::Config {
                action: ConfigCommands::Validate
            }
        );
        assert_eq!(cli.config, PathBuf::from("/etc/t.toml"));

        let cli = Cli::parse_from(["llm-telemetry", "config", "show"]);
        assert_eq!(
            cli.get_command(),
            Commands::Config {
                action: ConfigCommands::Show
            }
        );
    }

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
