//! Log subscriber setup for applications embedding the driver.
//!
//! The driver itself only emits `tracing` events; installing a subscriber is the
//! host application's choice. These helpers mirror what the test suites use.

use crate::config::LogSettings;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the formatting layer selected by `settings`.
pub fn fmt_layer<S>(settings: &LogSettings) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span> + Send + Sync,
{
    if settings.json {
        Box::new(tracing_subscriber::fmt::layer().json().with_target(true))
    } else {
        Box::new(tracing_subscriber::fmt::layer().with_target(true))
    }
}

/// `RUST_LOG` when set, else the configured directive.
pub fn env_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.filter))
}

/// Install the global subscriber. Returns `false` when one was already installed.
pub fn init_logging(settings: &LogSettings) -> bool {
    tracing_subscriber::registry()
        .with(env_filter(settings))
        .with(fmt_layer(settings))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let settings = LogSettings::default();
        let _ = init_logging(&settings);
        assert!(!init_logging(&settings));
    }
}
