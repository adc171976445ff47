//! Logging bootstrap for the service binaries. Plain output for terminals,
//! JSON for log pipelines, level filtering through `RUST_LOG`.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogFormat;

static INIT: Once = Once::new();

/// Initializes the global subscriber. Safe to call more than once;
/// subsequent calls are no-ops.
pub fn init(format: LogFormat) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Plain => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer())
                    .init();
            }
        }
    });
}
