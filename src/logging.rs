//! Logging initialization.
//!
//! Log lines go to stderr so that CLI reports on stdout stay clean.
//! `RUST_LOG` overrides `[logging] level` when set.

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to create log filter")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
    };

    // A subscriber installed earlier (tests, embedding applications) wins.
    if let Err(e) = result {
        tracing::debug!(error = %e, "global subscriber already set");
    }
    Ok(())
}
