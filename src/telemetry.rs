//! Tracing initialisation

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialise the global tracing subscriber.
///
/// Defaults to INFO, or DEBUG when `debug` is set; `RUST_LOG` overrides
/// both.
pub fn init(debug: bool) {
    let default_level = if debug { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .init();
}
