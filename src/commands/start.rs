use anyhow::Result;
use colored::Colorize;
use llm_telemetry::{config::Config, server};
use tracing::info;

/// Execute the start command
///
/// Runs the server in the foreground until SIGTERM/SIGINT.
pub async fn execute(cfg: Config) -> Result<()> {
    println!("{}", "Starting telemetry server...".green());
    info!(
        database = %cfg.database.url,
        counter_store = ?cfg.rate_limit.counter_store.backend,
        "Starting LLM telemetry service"
    );

    server::start_server(cfg).await?;

    Ok(())
}
