//! Logging setup
//!
//! The first call installs a global `tracing` subscriber; later calls only
//! swap its filter, so verbosity can be raised or lowered at any time.

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

static FILTER: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Verbosity of the reader's own log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off,
    /// Lifecycle events and failures
    Low,
    /// Plus per-consumer and per-batch activity
    Medium,
    /// Plus per-frame tracing
    High,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Off => "vreader=off",
            LogLevel::Low => "vreader=info",
            LogLevel::Medium => "vreader=debug",
            LogLevel::High => "vreader=trace",
        }
    }
}

/// Enable (or re-level) logging for every reader in the process.
pub fn enable_logs(level: LogLevel) {
    let filter = EnvFilter::new(level.directive());
    if let Some(handle) = FILTER.get() {
        let _ = handle.reload(filter);
        return;
    }

    let (filter_layer, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let subscriber = subscriber.with(tracing_tracy::TracyLayer::default());

    // Another subscriber may already be installed (an embedding application
    // or a test harness); leave it in charge in that case.
    if subscriber.try_init().is_ok() {
        let _ = FILTER.set(handle);
    }
}
