#![forbid(unsafe_code)]

mod config;

use std::io::{self, Write};

use anyhow::{Context, Result};
use rtg_layout::generate_layout;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, OutputFormat};

fn main() -> Result<()> {
    let config = Config::load()?;

    let filter = match &config.log_level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid log filter `{level}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    // stdout carries the report.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    tracing::info!(
        arch = %config.layout.arch,
        seed = config.layout.seed,
        cores = config.layout.cores,
        "generating layout"
    );
    let layout = generate_layout(&config.layout).context("layout generation failed")?;
    let report = layout.report();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match config.format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut out, &report).context("failed to write report")?;
            writeln!(out)?;
        }
        OutputFormat::Text => write!(out, "{report}")?,
    }
    out.flush()?;
    Ok(())
}
