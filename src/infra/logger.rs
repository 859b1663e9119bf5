// src/infra/logger.rs — Structured logging with tracing
//
// Plugin output (`log`, `print`, `console`) is emitted under the `plugin`
// target, so `RUST_LOG=plugin=debug` isolates it from host diagnostics.

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber. stdout carries command output, so logs go
/// to stderr.
pub fn init_logging(level: &str) {
    // Tests and embedders may have installed a subscriber already
    let _ = tracing::subscriber::set_global_default(subscriber(level, std::io::stderr));
}

fn subscriber<W>(level: &str, writer: W) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .compact()
        .finish()
}
