//! Logging from the worker.

use std::fmt;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

//----------- Logger -----------------------------------------------------------

/// The state of the worker logger.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    /// Launch the logger in fallback mode.
    ///
    /// Messages are written to stdout at `info` level (or whatever
    /// `RUST_LOG` asks for) until [`apply()`][Self::apply] installs the
    /// configured level.
    ///
    /// ## Panics
    ///
    /// Panics if a global [`tracing`] subscriber has been set already.
    pub fn launch() -> &'static Logger {
        let filter = make_env_filter("info");

        // A reload layer is tracing's way of making it possible to change
        // values at runtime. It gives us a handle we can use to update the
        // EnvFilter once the configuration has been read.
        let (filter, filter_handle) = reload::Layer::new(filter);

        let layer = FmtLayer::new()
            .with_ansi(supports_color::on(supports_color::Stream::Stdout).is_some())
            .with_writer(std::io::stdout);
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .init();

        Box::leak(Box::new(Self {
            filter: filter_handle,
        }))
    }

    /// Switch to the configured default level.
    pub fn apply(&self, level: &str) -> Result<(), String> {
        if level.parse::<LevelFilter>().is_err() {
            return Err(format!("invalid log level: '{level}'"));
        }
        self.filter
            .reload(make_env_filter(level))
            .map_err(|_| "could not reload filter".to_string())
    }
}

/// Make a new [`EnvFilter`] with the given default directive.
///
/// An explicit `RUST_LOG` in the environment wins over the configured
/// level.
fn make_env_filter(default_level: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_level)
    }
}
