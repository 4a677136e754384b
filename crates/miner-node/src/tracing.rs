//! Logging setup.
//!
//! `main` calls [`init_stdout`] once before anything logs. Other modules
//! `use crate::tracing::prelude::*` for the event macros.

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Log to stdout, filtered by `RUST_LOG` with INFO as the default level.
///
/// `verbose` raises the default to DEBUG; an explicit `RUST_LOG` still wins.
pub fn init_stdout(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_names(true),
        )
        .init();
}
