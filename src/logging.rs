//! Structured logging setup, mirroring the original service's
//! `configure_logger()`: JSON records in production, a human-readable
//! format everywhere else, both driven off `Settings::app_env`.

use crate::config::AppEnv;
use tracing_subscriber::EnvFilter;

/// Initializes the global `tracing` subscriber. Call once, at the very
/// start of `main`, before any other component is constructed.
pub fn init(app_env: AppEnv) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match app_env {
        AppEnv::Production => subscriber.json().init(),
        AppEnv::Development | AppEnv::Testing => subscriber.pretty().init(),
    }
}
