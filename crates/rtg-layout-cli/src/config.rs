use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rtg_layout::{Arch, LayoutConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "rtg-layout", version, about = "Generate a seeded address-space layout")]
pub struct Args {
    /// JSON file with layout knobs. Knobs it does not name keep their defaults.
    ///
    /// Environment variable: `RTG_CONFIG`.
    #[arg(long, env = "RTG_CONFIG")]
    config: Option<PathBuf>,

    /// Seed of the run's random source.
    ///
    /// Environment variable: `RTG_SEED`.
    #[arg(long, env = "RTG_SEED")]
    seed: Option<u64>,

    /// Target architecture (`riscv64`, `aarch64` or `x86_64`).
    ///
    /// Environment variable: `RTG_ARCH`.
    #[arg(long, env = "RTG_ARCH")]
    arch: Option<Arch>,

    /// Number of simulated cores.
    ///
    /// Environment variable: `RTG_CORES`.
    #[arg(long, env = "RTG_CORES")]
    cores: Option<u32>,

    /// Number of cross-core pages (one barrier segment each).
    ///
    /// Environment variable: `RTG_CROSS_CORE_PAGES`.
    #[arg(long, env = "RTG_CROSS_CORE_PAGES")]
    cross_core_pages: Option<usize>,

    /// Report format written to stdout.
    ///
    /// Environment variable: `RTG_FORMAT`.
    #[arg(long, value_enum, env = "RTG_FORMAT")]
    format: Option<OutputFormat>,

    /// Log filter (tracing-subscriber EnvFilter syntax). Falls back to `RUST_LOG`.
    ///
    /// Environment variable: `RTG_LOG_LEVEL`.
    #[arg(long, env = "RTG_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub layout: LayoutConfig,
    pub format: OutputFormat,
    pub log_level: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// Flags and `RTG_*` variables override the config file, which overrides the defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        let mut layout = match &args.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => LayoutConfig::default(),
        };

        if let Some(seed) = args.seed {
            layout.seed = seed;
        }
        if let Some(arch) = args.arch {
            layout.arch = arch;
        }
        if let Some(cores) = args.cores {
            layout.cores = cores;
        }
        if let Some(pages) = args.cross_core_pages {
            layout.cross_core_pages = pages;
        }

        let log_level = args.log_level.and_then(|v| {
            let v = v.trim().to_string();
            (!v.is_empty()).then_some(v)
        });

        Ok(Self {
            layout,
            format: args.format.unwrap_or(OutputFormat::Json),
            log_level,
        })
    }
}
