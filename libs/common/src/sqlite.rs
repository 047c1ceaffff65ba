pub mod client;

pub use client::{SqliteClient, SqliteOptions, SqlitePool};
