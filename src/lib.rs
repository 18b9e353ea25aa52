pub mod client;
pub mod config;
pub mod error;
pub mod fetchers;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod run_inference;
pub mod snapshot;
pub mod store;

pub use error::*;

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber. `RUST_LOG` wins over `level` when set.
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(service: &str, level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(service, "tracing initialized");
    }
}
