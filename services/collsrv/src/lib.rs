//! collsrv - PLC acquisition collector
//!
//! Polls Modbus TCP devices described by machine definition files, stores
//! readings and alarm transitions in SQLite, and fans readings out to MQTT
//! and realtime WebSocket subscribers.

pub mod alarm;
pub mod api;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod publish;
pub mod reader;
pub mod reconcile;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod transport;

pub use error::{CollectorError, Result};

pub const SERVICE_NAME: &str = "collsrv";
