use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::export;
use crate::geocoder::GeocodingService;
use crate::pipeline::{self, RunOptions, RunReport};

/// Resolve a Google Maps location export to the countries and states it covers
#[derive(Parser, Debug)]
#[command(name = "visited-countries")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Location export (CSV with title and URL columns)
    pub csv_file: PathBuf,

    /// Directory holding the geocoding caches [env: CACHE_DIR]
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Directory the JSON results are written to [env: OUTPUT_DIR]
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Only log errors; the final summary is still printed
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log every lookup and cache decision
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Log filter used unless `RUST_LOG` is set.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Runs the pipeline for the parsed command line and prints the summary.
pub async fn run(cli: Cli) -> AppResult<RunReport> {
    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    debug!(config = ?config.public_profile(), "configuration loaded");

    let options = RunOptions::new(cli.csv_file, &config);
    let lookup = GeocodingService::new(&config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; finishing the current record");
        flag.store(true, Ordering::SeqCst);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let report = pipeline::run(&config, &options, lookup, Some(cancel)).await?;
    print!("{}", export::render_summary(&report));
    Ok(report)
}
