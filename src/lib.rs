pub mod app;
pub mod backup;
pub mod breathing;
pub mod crypto;
pub mod errors;
pub mod handoff;
pub mod models;
pub mod reconcile;
pub mod storage;
pub mod ui;

pub use app::run;

use tracing_subscriber::{EnvFilter, fmt};

/// Logs go to stderr so they never mix with command output. `RUST_LOG`
/// overrides the default `warn` level.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
