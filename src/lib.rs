pub mod aggregate;
pub mod cache;
pub mod cli;
pub mod config;
pub mod errors;
pub mod export;
pub mod geocoder;
pub mod identity;
pub mod ingestion;
pub mod migration;
pub mod pipeline;
pub mod place;
pub mod resolver;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use crate::cli::Cli;
pub use crate::config::{AppConfig, TrackedCountries};
pub use crate::errors::{AppError, AppResult};
pub use crate::geocoder::{GeocodeLookup, GeocodingService};
pub use crate::pipeline::{run, RunOptions, RunReport};

/// Installs the stderr log subscriber. `RUST_LOG` takes precedence over
/// `default_directive`; later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
