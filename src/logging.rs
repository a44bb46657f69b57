//! Log output setup.

use std::io::IsTerminal;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Environment variable holding a filter directive, e.g. `delver=debug`.
pub const LOG_ENV: &str = "DELVER_LOG";

/// Installs a stderr `fmt` subscriber. `DELVER_LOG` takes precedence over
/// `default_level`. Colour is only used when stderr is a terminal, since the
/// JVM's stderr usually ends up in a log file. Does nothing if a global
/// subscriber is already set.
pub fn init(default_level: &str) {
    let ansi = std::io::stderr().is_terminal();
    let _ = tracing::subscriber::set_global_default(subscriber(default_level, ansi, std::io::stderr));
}

/// The subscriber [`init`] installs, writing to `writer`.
pub fn subscriber<W>(default_level: &str, ansi: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false)
        .with_ansi(ansi)
        .finish()
}
