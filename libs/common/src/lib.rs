//! Shared runtime library for collector services
//!
//! Provides functions shared by all services:
//! - logging bootstrap
//! - graceful shutdown
//! - host resource sampling
//! - SQLite connection setup

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub mod logging;
pub mod shutdown;
pub mod system_metrics;

pub use logging::{init_logging, LogOptions};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
pub use system_metrics::{ResourceSampler, SystemResources};

// Re-export common dependencies
pub use anyhow;
pub use tokio;
