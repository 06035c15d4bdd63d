use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;

use llm_telemetry::{config, init_tracing};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let command = args.get_command();

    if command == cli::Commands::Version {
        println!("llm-telemetry v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let cfg = config::load_config(&args.config)?;
    init_tracing(&cfg.server.log_level, &cfg.server.log_format);

    match command {
        cli::Commands::Start => commands::start::execute(cfg).await?,
        cli::Commands::Config { action } => match action {
            cli::ConfigCommands::Show => commands::config::show(&cfg)?,
            cli::ConfigCommands::Validate => commands::config::validate(&cfg)?,
        },
        cli::Commands::Version => {}
    }

    Ok(())
}
