//! The uniform client contract and its four dialect implementations.
//!
//! [`Client`] is the one trait every dialect client implements. Dialect
//! clients supply the catalog queries and a few execution primitives
//! (`fetch_statement`, `stream_statement`, `apply_plan`, `reselect`,
//! `run_cancelable`, `kill`); paging, change application, alteration and
//! batched column listing are provided on top of those.
//!
//! [`DialectClient`] is the closed set of clients handed out by the
//! connection manager. It is cheap to clone and forwards to the concrete
//! client with a macro-generated `match`.

pub(crate) mod catalog;
pub mod cassandra;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::alter::builder_for;
use crate::db::cancel::{CancelState, CancelableQuery, QueryRegistry, resolve};
use crate::db::changes::{ChangePlan, TableColumns, ensure_writable, plan_changes};
use crate::db::cursor::StreamingCursor;
use crate::db::dialect::{SqlDialect, dialect_for};
use crate::db::executor::QueryExecutor;
use crate::db::params::Statement;
use crate::db::pool::DbPool;
use crate::db::select::{build_select_top, count_value};
use crate::dispatch_client;
use crate::error::{DbError, DbResult};
use crate::impl_db_dispatch;
use crate::models::{
    AlterTableRequest, Capabilities, ColumnMetadata, ConnectionInfo, DatabaseType,
    ExecuteOptions, IndexMetadata, KeyMetadata, ListFilter, PrimaryKeyColumn, QueryResult,
    ResultField, RoutineMetadata, Row, SelectTopRequest, SelectTopResult, ServerConfig,
    TableChangeBundle, TableMetadata, TableShape,
};

pub use cassandra::CassandraClient;
pub use mysql::MySqlClient;
pub use postgres::PostgresClient;
pub use sqlite::SqliteClient;

/// State every dialect client carries.
#[derive(Debug)]
pub struct ClientContext {
    pub config: Arc<ServerConfig>,
    /// Database (keyspace) this client was connected to, if named.
    pub database: Option<String>,
    pub server_version: Option<String>,
    pub executor: QueryExecutor,
    pub registry: QueryRegistry,
}

impl ClientContext {
    pub fn new(config: Arc<ServerConfig>, database: Option<String>, query_timeout: Duration) -> Self {
        Self {
            config,
            database,
            server_version: None,
            executor: QueryExecutor::with_timeout(query_timeout),
            registry: QueryRegistry::default(),
        }
    }

    /// Connected database, falling back to the one in the server URL.
    pub fn database(&self) -> Option<&str> {
        self.database
            .as_deref()
            .or(self.config.database.as_deref())
    }

    pub fn read_only(&self) -> bool {
        self.config.read_only
    }
}

/// Operations every dialect client supports.
#[async_trait]
pub trait Client: Send + Sync {
    fn context(&self) -> &ClientContext;

    fn db_type(&self) -> DatabaseType {
        self.context().config.db_type
    }

    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(self.db_type())
    }

    fn capabilities(&self) -> Capabilities {
        self.dialect().capabilities()
    }

    fn wrap_identifier(&self, name: &str) -> String {
        self.dialect().wrap_identifier(name)
    }

    fn server_version(&self) -> Option<&str> {
        self.context().server_version.as_deref()
    }

    /// Catalog statement listing the columns of one table in the layout
    /// read by `catalog::column_from_row`.
    fn columns_sql(&self, table: &str, schema: Option<&str>) -> String;

    // --- execution primitives ---

    /// Run one statement and return its fields and rows.
    async fn fetch_statement(&self, statement: &Statement)
    -> DbResult<(Vec<ResultField>, Vec<Row>)>;

    /// Stream one statement, dropping the first `skip` rows.
    async fn stream_statement(
        &self,
        statement: Statement,
        skip: u64,
        chunk_size: usize,
    ) -> DbResult<StreamingCursor>;

    /// Run a planned change set atomically.
    async fn apply_plan(&self, plan: &ChangePlan) -> DbResult<()>;

    /// Read back the rows touched by a committed plan.
    async fn reselect(&self, plan: &ChangePlan) -> DbResult<Vec<Row>>;

    /// Execute `text` while publishing its server session to `state`.
    async fn run_cancelable(
        &self,
        state: Arc<CancelState>,
        text: &str,
        options: &ExecuteOptions,
    ) -> DbResult<Vec<QueryResult>>;

    /// Stop the query tracked by `state`.
    async fn kill(&self, state: &CancelState) -> DbResult<()>;

    // --- catalog ---

    async fn list_databases(&self) -> DbResult<Vec<String>>;

    async fn list_schemas(&self) -> DbResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn list_tables(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>>;

    async fn list_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>>;

    async fn list_materialized_views(&self, _filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        Ok(Vec::new())
    }

    async fn list_routines(&self, _filter: &ListFilter) -> DbResult<Vec<RoutineMetadata>> {
        Ok(Vec::new())
    }

    /// Columns of `table`, or of every table and view in `schema` when
    /// `table` is `None`. The latter sends all per-table catalog queries as
    /// one batch.
    async fn list_table_columns(
        &self,
        table: Option<&str>,
        schema: Option<&str>,
    ) -> DbResult<Vec<ColumnMetadata>> {
        if let Some(table) = table {
            let statement = Statement::raw(self.columns_sql(table, schema));
            let (_, rows) = self.fetch_statement(&statement).await?;
            return Ok(rows.iter().filter_map(catalog::column_from_row).collect());
        }

        let filter = ListFilter {
            schema: schema.map(String::from),
            ..ListFilter::default()
        };
        let mut relations = self.list_tables(&filter).await?;
        relations.extend(self.list_views(&filter).await?);
        if relations.is_empty() {
            return Ok(Vec::new());
        }

        let batch = relations
            .iter()
            .map(|r| self.columns_sql(&r.name, r.schema.as_deref().or(schema)))
            .collect::<Vec<_>>()
            .join(";\n");
        let results = self.execute_query(&batch, &ExecuteOptions::default()).await?;
        let columns: Vec<ColumnMetadata> = results
            .iter()
            .flat_map(|result| result.rows.iter())
            .filter_map(catalog::column_from_row)
            .collect();
        debug!(
            tables = relations.len(),
            columns = columns.len(),
            "Listed columns in one batch"
        );
        Ok(columns)
    }

    async fn list_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<IndexMetadata>>;

    /// Foreign keys declared on `table`.
    async fn get_table_keys(&self, table: &str, schema: Option<&str>)
    -> DbResult<Vec<KeyMetadata>>;

    async fn get_primary_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<PrimaryKeyColumn>>;

    /// The primary key column when the key has exactly one column.
    async fn get_primary_key(&self, table: &str, schema: Option<&str>) -> DbResult<Option<String>> {
        let mut keys = self.get_primary_keys(table, schema).await?;
        if keys.len() == 1 {
            Ok(keys.pop().map(|k| k.column_name))
        } else {
            Ok(None)
        }
    }

    async fn table_shape(&self, table: &str, schema: Option<&str>) -> DbResult<TableShape> {
        Ok(TableShape {
            columns: self.list_table_columns(Some(table), schema).await?,
            keys: self.get_table_keys(table, schema).await?,
            indexes: self.list_table_indexes(table, schema).await?,
        })
    }

    // --- reads ---

    async fn select_top(&self, request: &SelectTopRequest) -> DbResult<SelectTopResult> {
        let columns = self
            .list_table_columns(Some(&request.table), request.schema.as_deref())
            .await?;
        let plan = build_select_top(self.dialect(), request, &columns)?;

        let (mut fields, rows) = self.fetch_statement(&plan.page).await?;
        let rows: Vec<Row> = rows
            .into_iter()
            .skip(usize::try_from(plan.skip).unwrap_or(usize::MAX))
            .collect();
        if fields.is_empty() {
            fields = columns
                .iter()
                .filter(|c| request.columns.is_empty() || request.columns.contains(&c.name))
                .map(|c| ResultField::new(c.name.clone(), Some(c.data_type.clone())))
                .collect();
        }

        let (_, counted) = self.fetch_statement(&plan.count).await?;
        let total_records = count_value(counted.first().and_then(|row| row.get("total")));
        Ok(SelectTopResult {
            fields,
            rows,
            total_records,
        })
    }

    async fn select_top_stream(
        &self,
        request: &SelectTopRequest,
        chunk_size: usize,
    ) -> DbResult<StreamingCursor> {
        let columns = self
            .list_table_columns(Some(&request.table), request.schema.as_deref())
            .await?;
        let plan = build_select_top(self.dialect(), request, &columns)?;
        self.stream_statement(plan.page, plan.skip, chunk_size).await
    }

    async fn query_stream(&self, text: &str, chunk_size: usize) -> DbResult<StreamingCursor> {
        self.stream_statement(Statement::raw(text), 0, chunk_size).await
    }

    /// Run one or more statements, returning one result per statement.
    async fn execute_query(
        &self,
        text: &str,
        options: &ExecuteOptions,
    ) -> DbResult<Vec<QueryResult>> {
        tracked(&self.context().registry, |state| {
            self.run_cancelable(state, text, options)
        })
        .await
    }

    // --- writes ---

    /// Apply a change bundle in one transaction and return the rows as they
    /// read after commit.
    ///
    /// Column metadata is read before the transaction opens. The re-select
    /// runs after commit on its own statement, so a concurrent writer can
    /// change a row between the two.
    async fn apply_changes(&self, bundle: &TableChangeBundle) -> DbResult<Vec<Row>> {
        ensure_writable(self.context().read_only(), "apply changes")?;
        if bundle.is_empty() {
            return Ok(Vec::new());
        }

        let mut columns = TableColumns::new();
        for (schema, table) in bundle.tables() {
            let listed = self
                .list_table_columns(Some(&table), schema.as_deref())
                .await?;
            columns.insert((schema, table), listed);
        }

        let plan = plan_changes(self.dialect(), bundle, &columns)?;
        self.apply_plan(&plan).await?;
        info!(
            server_id = %self.context().config.id,
            steps = plan.steps.len(),
            "Changes committed"
        );
        self.reselect(&plan).await
    }

    async fn truncate_all_tables(&self, schema: Option<&str>) -> DbResult<()>;

    /// DDL statements implementing `request`, without running them.
    async fn alter_table_sql(&self, request: &AlterTableRequest) -> DbResult<Vec<String>> {
        let shape = self
            .table_shape(&request.table, request.schema.as_deref())
            .await?;
        builder_for(self.db_type()).build(request, &shape)
    }

    /// Build and run the DDL for `request`; returns the statements run.
    async fn alter_table(&self, request: &AlterTableRequest) -> DbResult<Vec<String>> {
        ensure_writable(self.context().read_only(), "alter table")?;
        let statements = self.alter_table_sql(request).await?;
        for statement in &statements {
            debug!(sql = %statement, "Running alteration");
            self.execute_query(statement, &ExecuteOptions::default())
                .await?;
        }
        info!(
            table = %request.table,
            statements = statements.len(),
            "Table altered"
        );
        Ok(statements)
    }

    // --- scripts ---

    /// `CREATE` statements that recreate the table and its indexes. Empty
    /// when the table does not exist.
    async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>>;

    async fn get_view_create_script(&self, view: &str, schema: Option<&str>)
    -> DbResult<Vec<String>>;

    async fn get_routine_create_script(
        &self,
        _routine: &str,
        _schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        Ok(Vec::new())
    }

    // --- lifecycle ---

    /// Kill every tracked query; the pool itself is closed by its owner.
    async fn disconnect(&self) {
        let pending = self.context().registry.drain();
        for state in pending {
            if let Err(e) = self.kill(&state).await {
                warn!(error = %e, "Failed to stop query on disconnect");
            }
        }
        debug!(server_id = %self.context().config.id, "Client disconnected");
    }
}

struct Registration<'a> {
    registry: &'a QueryRegistry,
    id: Uuid,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Run `run` under a fresh registry entry so `disconnect` can stop it.
pub(crate) async fn tracked<T, F, Fut>(registry: &QueryRegistry, run: F) -> DbResult<T>
where
    F: FnOnce(Arc<CancelState>) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    let id = Uuid::new_v4();
    let state = registry.register(id);
    let _registration = Registration { registry, id };
    let result = run(Arc::clone(&state)).await;
    resolve(result, state.is_canceling())
}

/// Generates the statement primitives shared by the sqlx-backed clients as
/// inherent methods; the trait impls forward to them.
macro_rules! sqlx_statement_ops {
    ($client:ty, $bind:path, $applier:ident) => {
        impl $client {
            async fn fetch_rows(
                &self,
                statement: &$crate::db::params::Statement,
            ) -> $crate::error::DbResult<(Vec<$crate::models::ResultField>, Vec<$crate::models::Row>)>
            {
                use $crate::db::types::NormalizeRow;

                let db_type = $crate::client::Client::db_type(self);
                let rows = $bind(sqlx::query(&statement.sql), &statement.params)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| $crate::error::DbError::from(e).with_driver_hint(db_type))?;
                let fields = rows.first().map(|row| row.fields()).unwrap_or_default();
                Ok((fields, rows.iter().map(|row| row.to_object()).collect()))
            }

            fn open_stream(
                &self,
                statement: $crate::db::params::Statement,
                skip: u64,
                chunk_size: usize,
            ) -> $crate::db::cursor::StreamingCursor {
                $crate::db::cursor::StreamingCursor::new(
                    chunk_size,
                    $crate::db::cursor::sql_row_producer!(self.pool.clone(), statement, $bind, skip),
                )
            }

            async fn apply_planned(
                &self,
                plan: &$crate::db::changes::ChangePlan,
            ) -> $crate::error::DbResult<()> {
                $crate::db::changes::$applier::apply(&self.pool, plan).await
            }

            async fn reselect_planned(
                &self,
                plan: &$crate::db::changes::ChangePlan,
            ) -> $crate::error::DbResult<Vec<$crate::models::Row>> {
                $crate::db::changes::$applier::reselect(&self.pool, plan).await
            }
        }
    };
}

pub(crate) use sqlx_statement_ops;

/// A connected client of any dialect.
#[derive(Clone)]
pub enum DialectClient {
    Postgres(Arc<PostgresClient>),
    MySql(Arc<MySqlClient>),
    Sqlite(Arc<SqliteClient>),
    Cassandra(Arc<CassandraClient>),
}

impl DialectClient {
    /// Wrap `pool` in the client of its dialect and read the server version.
    pub(crate) async fn connect(
        config: Arc<ServerConfig>,
        database: Option<String>,
        pool: DbPool,
        query_timeout: Duration,
    ) -> DbResult<Self> {
        let context = ClientContext::new(config, database, query_timeout);
        let client = impl_db_dispatch!(pool, {
            MySql(p) => Self::MySql(Arc::new(MySqlClient::connect(context, p).await?)),
            Postgres(p) => Self::Postgres(Arc::new(PostgresClient::connect(context, p).await?)),
            SQLite(p) => Self::Sqlite(Arc::new(SqliteClient::connect(context, p).await?)),
            Cassandra(s) => Self::Cassandra(Arc::new(CassandraClient::connect(context, s).await?)),
        });
        Ok(client)
    }

    pub fn as_client(&self) -> &(dyn Client + 'static) {
        dispatch_client!(self, c => &**c as &dyn Client)
    }

    pub fn info(&self) -> ConnectionInfo {
        let context = self.context();
        ConnectionInfo {
            connection_id: context.config.id.clone(),
            database_type: context.config.db_type,
            server_version: context.server_version.clone(),
            database: context.database().map(String::from),
            tunneled: context.config.tunnel.is_some(),
            read_only: context.read_only(),
        }
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.context().registry
    }

    /// A query that can be executed once and cancelled from elsewhere.
    pub fn query(&self, text: impl Into<String>) -> CancelableQuery {
        CancelableQuery::new(self.clone(), text.into())
    }

    /// Cancel a running query by id.
    pub async fn cancel_query(&self, id: Uuid) -> DbResult<()> {
        let state = self
            .registry()
            .get(&id)
            .ok_or_else(|| DbError::invalid_input(format!("No running query with id {}", id)))?;
        self.as_client().kill(&state).await
    }
}

impl Deref for DialectClient {
    type Target = dyn Client;

    fn deref(&self) -> &Self::Target {
        self.as_client()
    }
}

impl std::fmt::Debug for DialectClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialectClient")
            .field("db_type", &self.db_type())
            .field("server_id", &self.context().config.id)
            .finish()
    }
}
