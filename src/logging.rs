//! Tracing setup and copy-progress throttling.
//!
//! Everything under the `vdxfer` target logs at info unless `verbose` is set
//! or `RUST_LOG` says otherwise. Copies report every block, so progress lines
//! go through a [`LogThrottle`].

use std::cell::Cell;
use std::time::{Duration, Instant};

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
    pub verbose: bool,
}

impl LogConfig {
    pub fn from_app_config(config: &crate::config::AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }

    /// Filter directive used when `RUST_LOG` is unset or invalid.
    fn default_directive(&self) -> &'static str {
        if self.verbose { "vdxfer=debug" } else { "vdxfer=info" }
    }
}

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_directive()));

    if config.json {
        // Span close events carry the copy duration for log aggregation.
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

/// Lets a progress line through at most once per interval.
///
/// The first call always passes. Owned by a single copy loop or reporter
/// task, so it is not shared across threads.
#[derive(Debug)]
pub struct LogThrottle {
    interval: Duration,
    last: Cell<Option<Instant>>,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Cell::new(None),
        }
    }

    pub fn should_log(&self) -> bool {
        self.should_log_at(Instant::now())
    }

    fn should_log_at(&self, now: Instant) -> bool {
        let due = match self.last.get() {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due {
            self.last.set(Some(now));
        }
        due
    }
}
