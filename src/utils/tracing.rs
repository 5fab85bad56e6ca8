use std::str::FromStr;

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::fmt::Subscriber;

fn log_level() -> Level {
    std::env::var("LOG_LEVEL")
        .map_err(|e| anyhow!("LOG_LEVEL environment variable is not set: {}", e))
        .and_then(|l| Level::from_str(&l).map_err(|e| anyhow!("Invalid log level: {}", e)))
        .unwrap_or(Level::INFO)
}

pub fn init_tracing() -> Result<()> {
    let subscriber = Subscriber::builder().with_max_level(log_level()).finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("failed to set subscriber: {e}"))
}
