//! Logging related thingies

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::StubNsError;

/// `RUST_LOG` wins when set, otherwise the configured level (or debug when
/// the flag was passed) applies.
pub fn build_loglevel_filter_layer(log_level: &str, debug: bool) -> EnvFilter {
    let directive = match debug {
        true => "debug".to_string(),
        false => log_level.to_string(),
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
}

pub fn setup_logging(log_level: &str, debug: bool) -> Result<(), StubNsError> {
    tracing_subscriber::registry()
        .with(build_loglevel_filter_layer(log_level, debug))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|error| StubNsError::Startup(format!("Failed to start logger! {error:?}")))
}
