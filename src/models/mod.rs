//! Data models shared by the drivers and their callers.

pub mod changes;
pub mod connection;
pub mod query;
pub mod schema;

pub use changes::{
    AlterTableRequest, Alteration, DeleteChange, InsertChange, KeyValue, TableChangeBundle,
    UpdateChange,
};
pub use connection::{
    Capabilities, ConnectionConfigError, ConnectionInfo, DatabaseType, ServerConfig, SshAuth,
    TunnelConfig,
};
pub use query::{
    DEFAULT_CHUNK_SIZE, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_SELECT_LIMIT, ExecuteOptions,
    FilterOperator, FilterPredicate, MAX_QUERY_TIMEOUT_SECS, OrderBy, QueryParam, QueryResult,
    ResultField, Row, RowMode, SelectFilter, SelectTopRequest, SelectTopResult, SortDirection,
};
pub use schema::{
    ColumnMetadata, ForeignKeyAction, IndexMetadata, KeyMetadata, ListFilter, PrimaryKeyColumn,
    RoutineMetadata, RoutineType, TableMetadata, TableShape, TableType,
};
