//! Database access layer.
//!
//! - Connection pools, SSH tunnels and the connection manager
//! - Query execution, statement classification and value normalization
//! - Cancellation of running queries
//! - Paged reads, streaming cursors, change bundles and table alteration
//! - Dispatch macros over the per-dialect enums

#[macro_use]
pub mod macros;
pub mod alter;
pub mod cancel;
pub mod changes;
pub mod classify;
pub mod cursor;
pub mod database_pool;
pub mod dialect;
pub mod executor;
pub mod params;
pub mod pool;
pub mod select;
pub mod tunnel;
pub mod types;

pub use alter::{SchemaChangeBuilder, builder_for};
pub use cancel::{CancelState, CancelableQuery, QueryRegistry};
pub use cursor::{CursorState, StreamingCursor};
pub use database_pool::{DatabasePoolConfig, DatabasePoolManager, DatabaseTarget};
pub use dialect::{SqlDialect, dialect_for};
pub use executor::QueryExecutor;
pub use params::Statement;
pub use pool::{ConnectionManager, DbPool};
pub use tunnel::{SshTunnel, TunnelManager};
