//! Database connectivity and change-application layer.
//!
//! One [`Client`] contract over PostgreSQL, MySQL, SQLite and Cassandra:
//! catalog introspection, multi-statement execution with cancellation,
//! paged and streamed reads, transactional change bundles and table
//! alteration. Connections are pooled per server and database, optionally
//! through an SSH tunnel.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use client::{Client, DialectClient};
pub use config::Config;
pub use db::ConnectionManager;
pub use error::{DbError, DbResult};
