//! Tracing setup shared by the CLI and tests.
//!
//! The filter comes from `RUST_LOG`, then `CVFLOW_LOG`, then defaults to `info`.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVEL_ENV: &str = "CVFLOW_LOG";

fn build_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_from_env(LOG_LEVEL_ENV))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
}

/// Installs the global subscriber. Calling it more than once is a no-op.
pub fn init_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let _ = tracing_subscriber::registry()
            .with(build_filter())
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init();
    });
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
