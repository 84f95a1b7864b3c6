//! MySQL / MariaDB client.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Executor, MySqlPool};
use tracing::{debug, warn};

use super::{Client, ClientContext, catalog, sqlx_statement_ops};
use crate::db::cancel::CancelState;
use crate::db::changes::{ChangePlan, ensure_writable};
use crate::db::cursor::StreamingCursor;
use crate::db::executor;
use crate::db::params::{Statement, bind_mysql};
use crate::db::pool::{acquire, release, with_connection};
use crate::error::{DbError, DbResult};
use crate::models::{
    ExecuteOptions, ForeignKeyAction, IndexMetadata, KeyMetadata, ListFilter, PrimaryKeyColumn,
    QueryParam, QueryResult, ResultField, RoutineMetadata, RoutineType, Row, TableMetadata,
    TableType,
};

/// Catalog queries. `COALESCE(?, DATABASE())` falls back to the connected
/// database when no schema is given.
mod queries {
    pub const SERVER_VERSION: &str = "SELECT VERSION()";

    pub const CONNECTION_ID: &str = "SELECT CONNECTION_ID()";

    pub const LIST_DATABASES: &str = r#"
        SELECT SCHEMA_NAME AS name
        FROM information_schema.SCHEMATA
        ORDER BY SCHEMA_NAME
    "#;

    pub const LIST_RELATIONS: &str = r#"
        SELECT TABLE_SCHEMA AS table_schema, TABLE_NAME AS table_name
        FROM information_schema.TABLES
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_TYPE = ?
        ORDER BY TABLE_NAME
    "#;

    pub const LIST_ROUTINES: &str = r#"
        SELECT ROUTINE_SCHEMA AS routine_schema,
               ROUTINE_NAME AS routine_name,
               ROUTINE_TYPE AS routine_type,
               CONVERT(DTD_IDENTIFIER USING utf8mb4) AS data_type
        FROM information_schema.ROUTINES
        WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE())
        ORDER BY ROUTINE_NAME
    "#;

    /// Takes literal schema and table so it can be batched.
    pub const COLUMNS_TEMPLATE: &str = r#"
        SELECT TABLE_SCHEMA AS table_schema,
               TABLE_NAME AS table_name,
               COLUMN_NAME AS column_name,
               CONVERT(COLUMN_TYPE USING utf8mb4) AS data_type,
               IS_NULLABLE AS is_nullable,
               CONVERT(COLUMN_DEFAULT USING utf8mb4) AS column_default,
               ORDINAL_POSITION AS ordinal_position,
               (EXTRA LIKE '%VIRTUAL GENERATED%' OR EXTRA LIKE '%STORED GENERATED%') AS `generated`,
               (COLUMN_KEY = 'PRI') AS is_primary_key,
               EXTRA AS extra
        FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = {schema} AND TABLE_NAME = {table}
        ORDER BY ORDINAL_POSITION
    "#;

    pub const LIST_INDEXES: &str = r#"
        SELECT INDEX_NAME AS index_name,
               MAX(NON_UNIQUE = 0) AS is_unique,
               (INDEX_NAME = 'PRIMARY') AS is_primary,
               GROUP_CONCAT(COLUMN_NAME ORDER BY SEQ_IN_INDEX SEPARATOR ',') AS columns
        FROM information_schema.STATISTICS
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
        GROUP BY INDEX_NAME
        ORDER BY INDEX_NAME
    "#;

    pub const FOREIGN_KEYS: &str = r#"
        SELECT k.CONSTRAINT_NAME AS constraint_name,
               k.TABLE_NAME AS from_table,
               k.COLUMN_NAME AS from_column,
               k.REFERENCED_TABLE_SCHEMA AS to_schema,
               k.REFERENCED_TABLE_NAME AS to_table,
               k.REFERENCED_COLUMN_NAME AS to_column,
               r.DELETE_RULE AS on_delete,
               r.UPDATE_RULE AS on_update
        FROM information_schema.KEY_COLUMN_USAGE k
        JOIN information_schema.REFERENTIAL_CONSTRAINTS r
          ON r.CONSTRAINT_SCHEMA = k.CONSTRAINT_SCHEMA
         AND r.CONSTRAINT_NAME = k.CONSTRAINT_NAME
         AND r.TABLE_NAME = k.TABLE_NAME
        WHERE k.TABLE_SCHEMA = COALESCE(?, DATABASE()) AND k.TABLE_NAME = ?
          AND k.REFERENCED_TABLE_NAME IS NOT NULL
        ORDER BY k.CONSTRAINT_NAME, k.ORDINAL_POSITION
    "#;

    pub const PRIMARY_KEYS: &str = r#"
        SELECT COLUMN_NAME AS column_name, ORDINAL_POSITION AS position
        FROM information_schema.KEY_COLUMN_USAGE
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
          AND CONSTRAINT_NAME = 'PRIMARY'
        ORDER BY ORDINAL_POSITION
    "#;

    pub const RELATION_TYPE: &str = r#"
        SELECT TABLE_TYPE AS table_type
        FROM information_schema.TABLES
        WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
    "#;

    pub const ROUTINE_TYPES: &str = r#"
        SELECT ROUTINE_TYPE AS routine_type
        FROM information_schema.ROUTINES
        WHERE ROUTINE_SCHEMA = COALESCE(?, DATABASE()) AND ROUTINE_NAME = ?
    "#;
}

pub struct MySqlClient {
    ctx: ClientContext,
    pool: MySqlPool,
}

sqlx_statement_ops!(MySqlClient, bind_mysql, mysql);

fn schema_param(schema: Option<&str>) -> QueryParam {
    schema.map(QueryParam::from).unwrap_or(QueryParam::Null)
}

fn names(schema: Option<&str>, name: &str) -> Vec<QueryParam> {
    vec![schema_param(schema), QueryParam::from(name)]
}

impl MySqlClient {
    pub(crate) async fn connect(mut ctx: ClientContext, pool: MySqlPool) -> DbResult<Self> {
        let version: String = sqlx::query_scalar(queries::SERVER_VERSION)
            .fetch_one(&pool)
            .await?;
        ctx.server_version = Some(version);
        Ok(Self { ctx, pool })
    }

    async fn relations(
        &self,
        filter: &ListFilter,
        table_type: &str,
        entity_type: TableType,
    ) -> DbResult<Vec<TableMetadata>> {
        let statement = Statement::new(
            queries::LIST_RELATIONS,
            vec![schema_param(filter.schema.as_deref()), QueryParam::from(table_type)],
        );
        let (_, rows) = self.fetch_rows(&statement).await?;
        let relations: Vec<TableMetadata> = rows
            .iter()
            .filter_map(|row| {
                Some(TableMetadata::new(
                    catalog::text(row, "table_schema"),
                    catalog::text(row, "table_name")?,
                    entity_type,
                ))
            })
            .collect();
        debug!(kind = %entity_type, count = relations.len(), "Listed relations");
        Ok(filter.retain(relations, |r| r.name.as_str()))
    }

    /// Second column of a `SHOW CREATE ...` result.
    async fn show_create(&self, sql: &str, column: &str) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::raw(sql)).await?;
        Ok(rows
            .iter()
            .filter_map(|row| catalog::text(row, column))
            .collect())
    }
}

#[async_trait]
impl Client for MySqlClient {
    fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn columns_sql(&self, table: &str, schema: Option<&str>) -> String {
        let dialect = self.dialect();
        let schema = match schema {
            Some(s) => dialect.quote_literal(s),
            None => "DATABASE()".to_string(),
        };
        queries::COLUMNS_TEMPLATE
            .replace("{schema}", &schema)
            .replace("{table}", &dialect.quote_literal(table))
    }

    async fn fetch_statement(
        &self,
        statement: &Statement,
    ) -> DbResult<(Vec<ResultField>, Vec<Row>)> {
        self.fetch_rows(statement).await
    }

    async fn stream_statement(
        &self,
        statement: Statement,
        skip: u64,
        chunk_size: usize,
    ) -> DbResult<StreamingCursor> {
        Ok(self.open_stream(statement, skip, chunk_size))
    }

    async fn apply_plan(&self, plan: &ChangePlan) -> DbResult<()> {
        self.apply_planned(plan).await
    }

    async fn reselect(&self, plan: &ChangePlan) -> DbResult<Vec<Row>> {
        self.reselect_planned(plan).await
    }

    async fn run_cancelable(
        &self,
        state: Arc<CancelState>,
        text: &str,
        options: &ExecuteOptions,
    ) -> DbResult<Vec<QueryResult>> {
        let limit = self.ctx.executor.timeout_for(options);
        let mode = options.row_mode;
        let text = text.to_string();
        with_connection(&self.pool, move |conn| {
            Box::pin(async move {
                let id: u64 = sqlx::query_scalar(queries::CONNECTION_ID)
                    .fetch_one(&mut **conn)
                    .await?;
                let id = i64::try_from(id)
                    .map_err(|_| DbError::internal(format!("Connection id {} out of range", id)))?;
                state.set_session_id(id);
                if state.is_canceling() {
                    return Err(DbError::cancelled("query execution"));
                }
                executor::mysql::run(&mut **conn, &text, mode, limit).await
            })
        })
        .await
    }

    async fn kill(&self, state: &CancelState) -> DbResult<()> {
        state.begin_cancel();
        let Some(id) = state.session_id() else {
            return Ok(());
        };
        self.pool.execute(format!("KILL QUERY {}", id).as_str()).await?;
        debug!(connection_id = id, "Killed running query");
        Ok(())
    }

    async fn list_databases(&self) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::raw(queries::LIST_DATABASES)).await?;
        Ok(rows.iter().filter_map(|r| catalog::text(r, "name")).collect())
    }

    async fn list_tables(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, "BASE TABLE", TableType::Table).await
    }

    async fn list_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, "VIEW", TableType::View).await
    }

    async fn list_routines(&self, filter: &ListFilter) -> DbResult<Vec<RoutineMetadata>> {
        let statement = Statement::new(
            queries::LIST_ROUTINES,
            vec![schema_param(filter.schema.as_deref())],
        );
        let (_, rows) = self.fetch_rows(&statement).await?;
        let routines = rows
            .iter()
            .filter_map(|row| {
                Some(RoutineMetadata {
                    schema: catalog::text(row, "routine_schema"),
                    name: catalog::text(row, "routine_name")?,
                    routine_type: RoutineType::parse(
                        &catalog::text(row, "routine_type").unwrap_or_default(),
                    ),
                    return_type: catalog::text(row, "data_type").filter(|t| !t.is_empty()),
                })
            })
            .collect();
        Ok(filter.retain(routines, |r| r.name.as_str()))
    }

    async fn list_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<IndexMetadata>> {
        let statement = Statement::new(queries::LIST_INDEXES, names(schema, table));
        let (_, rows) = self.fetch_rows(&statement).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let columns = catalog::name_list(&catalog::text(row, "columns").unwrap_or_default());
                Some(
                    IndexMetadata::new(catalog::text(row, "index_name")?, columns)
                        .with_unique(catalog::flag(row, "is_unique"))
                        .with_primary(catalog::flag(row, "is_primary")),
                )
            })
            .collect())
    }

    async fn get_table_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<KeyMetadata>> {
        let statement = Statement::new(queries::FOREIGN_KEYS, names(schema, table));
        let (_, rows) = self.fetch_rows(&statement).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(KeyMetadata {
                    constraint_name: catalog::text(row, "constraint_name"),
                    from_table: catalog::text(row, "from_table")?,
                    from_column: catalog::text(row, "from_column")?,
                    to_schema: catalog::text(row, "to_schema"),
                    to_table: catalog::text(row, "to_table")?,
                    to_column: catalog::text(row, "to_column")?,
                    on_delete: ForeignKeyAction::parse(
                        &catalog::text(row, "on_delete").unwrap_or_default(),
                    ),
                    on_update: ForeignKeyAction::parse(
                        &catalog::text(row, "on_update").unwrap_or_default(),
                    ),
                })
            })
            .collect())
    }

    async fn get_primary_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<PrimaryKeyColumn>> {
        let statement = Statement::new(queries::PRIMARY_KEYS, names(schema, table));
        let (_, rows) = self.fetch_rows(&statement).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(PrimaryKeyColumn {
                    column_name: catalog::text(row, "column_name")?,
                    position: catalog::number(row, "position")
                        .and_then(|p| u32::try_from(p).ok())
                        .unwrap_or_default(),
                })
            })
            .collect())
    }

    /// Truncates with foreign key checks off on one connection, restoring
    /// them even when a truncate fails.
    async fn truncate_all_tables(&self, schema: Option<&str>) -> DbResult<()> {
        ensure_writable(self.ctx.read_only(), "truncate tables")?;
        let filter = ListFilter {
            schema: schema.map(String::from),
            ..ListFilter::default()
        };
        let tables = self.list_tables(&filter).await?;
        if tables.is_empty() {
            return Ok(());
        }
        let dialect = self.dialect();
        let targets: Vec<String> = tables
            .iter()
            .map(|t| dialect.qualify(t.schema.as_deref(), &t.name))
            .collect();

        let mut conn = acquire(&self.pool).await?;
        let outcome = async {
            (&mut *conn).execute("SET FOREIGN_KEY_CHECKS = 0").await?;
            for target in &targets {
                (&mut *conn)
                    .execute(format!("TRUNCATE TABLE {}", target).as_str())
                    .await?;
            }
            Ok::<_, DbError>(())
        }
        .await;
        let restored = (&mut *conn).execute("SET FOREIGN_KEY_CHECKS = 1").await;
        if let Err(e) = &restored {
            warn!(error = %e, "Failed to restore foreign key checks");
        }
        release(conn, restored.is_err());
        outcome?;
        debug!(tables = targets.len(), "Truncated tables");
        Ok(())
    }

    async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let statement = Statement::new(queries::RELATION_TYPE, names(schema, table));
        let (_, rows) = self.fetch_rows(&statement).await?;
        let is_table = catalog::text_at(&rows, "table_type").as_deref() == Some("BASE TABLE");
        if !is_table {
            return Ok(Vec::new());
        }
        let target = self.dialect().qualify(schema, table);
        self.show_create(&format!("SHOW CREATE TABLE {}", target), "Create Table")
            .await
    }

    async fn get_view_create_script(
        &self,
        view: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let statement = Statement::new(queries::RELATION_TYPE, names(schema, view));
        let (_, rows) = self.fetch_rows(&statement).await?;
        if catalog::text_at(&rows, "table_type").as_deref() != Some("VIEW") {
            return Ok(Vec::new());
        }
        let target = self.dialect().qualify(schema, view);
        self.show_create(&format!("SHOW CREATE VIEW {}", target), "Create View")
            .await
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let statement = Statement::new(queries::ROUTINE_TYPES, names(schema, routine));
        let (_, rows) = self.fetch_rows(&statement).await?;
        let target = self.dialect().qualify(schema, routine);

        let mut script = Vec::new();
        for row in &rows {
            let kind = RoutineType::parse(&catalog::text(row, "routine_type").unwrap_or_default());
            let column = match kind {
                RoutineType::Procedure => "Create Procedure",
                RoutineType::Function => "Create Function",
            };
            let sql = format!("SHOW CREATE {} {}", kind.as_sql(), target);
            script.extend(self.show_create(&sql, column).await?);
        }
        Ok(script)
    }
}
