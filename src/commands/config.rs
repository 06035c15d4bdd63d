use anyhow::Result;
use colored::Colorize;
use llm_telemetry::config::{Config, CounterStoreBackend};
use tracing::info;

/// Execute the config show command
///
/// Prints the effective configuration (file plus environment overrides)
pub fn show(cfg: &Config) -> Result<()> {
    info!("Displaying effective configuration");

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(cfg)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
///
/// Loading already validated the configuration; this prints a summary
pub fn validate(cfg: &Config) -> Result<()> {
    println!("{}", "✓ Configuration is valid".green());
    println!();
    for line in summary(cfg) {
        println!("  {}", line);
    }

    info!("Configuration validation successful");
    Ok(())
}

fn summary(cfg: &Config) -> Vec<String> {
    let store = match cfg.rate_limit.counter_store.backend {
        CounterStoreBackend::Memory => "memory".to_string(),
        CounterStoreBackend::Sqlite => format!(
            "sqlite ({})",
            cfg.rate_limit
                .counter_store
                .url
                .as_deref()
                .unwrap_or(&cfg.database.url)
        ),
    };

    vec![
        format!("Listen: {}:{}", cfg.server.host, cfg.server.port),
        format!("Database: {}", cfg.database.url),
        format!(
            "Pipeline: queue {} / batch {} / flush every {}s",
            cfg.pipeline.queue_capacity, cfg.pipeline.batch_size, cfg.pipeline.flush_interval_secs
        ),
        format!(
            "Rate limit: {} ({}/min, {}/hour, store {})",
            if cfg.rate_limit.enabled { "on" } else { "off" },
            cfg.rate_limit.per_minute,
            cfg.rate_limit.per_hour,
            store
        ),
        format!("Priced models: {}", cfg.pricing.models.len()),
    ]
}
