//! SQLite client.
//!
//! Catalog reads go through the table-valued pragma functions so every
//! listing is a plain `SELECT`. Attached databases are addressed through the
//! optional schema argument.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Executor, SqlitePool};
use tracing::{debug, warn};

use super::{Client, ClientContext, catalog, sqlx_statement_ops};
use crate::db::cancel::CancelState;
use crate::db::changes::{ChangePlan, ensure_writable};
use crate::db::cursor::StreamingCursor;
use crate::db::executor;
use crate::db::params::{Statement, bind_sqlite};
use crate::db::pool::{acquire, release, with_connection};
use crate::error::{DbError, DbResult};
use crate::models::{
    ExecuteOptions, ForeignKeyAction, IndexMetadata, KeyMetadata, ListFilter, PrimaryKeyColumn,
    QueryParam, QueryResult, ResultField, Row, TableMetadata, TableType,
};

mod queries {
    pub const SERVER_VERSION: &str = "SELECT sqlite_version()";

    pub const LIST_DATABASES: &str = "SELECT name FROM pragma_database_list ORDER BY seq";

    pub const FOREIGN_KEYS_ENABLED: &str = "PRAGMA foreign_keys";

    /// `{master}` is the (possibly schema-qualified) `sqlite_master`.
    pub const LIST_RELATIONS: &str = r#"
        SELECT name AS table_name
        FROM {master}
        WHERE type = ?1 AND name NOT LIKE 'sqlite\_%' ESCAPE '\'
        ORDER BY name
    "#;

    pub const COLUMNS_TEMPLATE: &str = r#"
        SELECT {schema} AS table_schema,
               {table} AS table_name,
               name AS column_name,
               type AS data_type,
               CASE WHEN "notnull" = 0 THEN 'YES' ELSE 'NO' END AS is_nullable,
               dflt_value AS column_default,
               cid AS ordinal_position,
               hidden IN (2, 3) AS generated,
               pk > 0 AS is_primary_key,
               NULL AS extra
        FROM pragma_table_xinfo({args})
        WHERE hidden <> 1
        ORDER BY cid
    "#;

    pub const INDEX_LIST: &str = r#"SELECT name, "unique" AS is_unique, origin FROM pragma_index_list({args}) ORDER BY name"#;

    pub const INDEX_COLUMNS: &str = "SELECT name FROM pragma_index_info({args}) ORDER BY seqno";

    pub const FOREIGN_KEYS: &str = r#"
        SELECT id, seq, "table" AS to_table, "from" AS from_column, "to" AS to_column,
               on_update, on_delete
        FROM pragma_foreign_key_list({args})
        ORDER BY id, seq
    "#;

    pub const PRIMARY_KEYS: &str = r#"
        SELECT name AS column_name, pk AS position
        FROM pragma_table_info({args})
        WHERE pk > 0
        ORDER BY pk
    "#;

    pub const OBJECT_SQL: &str = r#"
        SELECT sql FROM {master} WHERE type = ?1 AND name = ?2 AND sql IS NOT NULL
    "#;

    pub const INDEX_SQL: &str = r#"
        SELECT sql FROM {master}
        WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL
        ORDER BY name
    "#;
}

pub struct SqliteClient {
    ctx: ClientContext,
    pool: SqlitePool,
}

sqlx_statement_ops!(SqliteClient, bind_sqlite, sqlite);

impl SqliteClient {
    pub(crate) async fn connect(mut ctx: ClientContext, pool: SqlitePool) -> DbResult<Self> {
        let version: String = sqlx::query_scalar(queries::SERVER_VERSION)
            .fetch_one(&pool)
            .await?;
        ctx.server_version = Some(version);
        Ok(Self { ctx, pool })
    }

    fn master(&self, schema: Option<&str>) -> String {
        match schema {
            Some(s) => format!("{}.sqlite_master", self.wrap_identifier(s)),
            None => "sqlite_master".to_string(),
        }
    }

    /// Pragma function call with the target as `?1` and the schema as `?2`.
    fn pragma(template: &str, target: &str, schema: Option<&str>) -> Statement {
        let mut params = vec![QueryParam::from(target)];
        let args = match schema {
            Some(s) => {
                params.push(QueryParam::from(s));
                "?1, ?2"
            }
            None => "?1",
        };
        Statement::new(template.replace("{args}", args), params)
    }

    async fn relations(
        &self,
        filter: &ListFilter,
        kind: &str,
        entity_type: TableType,
    ) -> DbResult<Vec<TableMetadata>> {
        let schema = filter.schema.as_deref();
        let sql = queries::LIST_RELATIONS.replace("{master}", &self.master(schema));
        let (_, rows) = self
            .fetch_rows(&Statement::new(sql, vec![QueryParam::from(kind)]))
            .await?;
        let relations: Vec<TableMetadata> = rows
            .iter()
            .filter_map(|row| {
                Some(TableMetadata::new(
                    schema.map(String::from),
                    catalog::text(row, "table_name")?,
                    entity_type,
                ))
            })
            .collect();
        debug!(kind, count = relations.len(), "Listed relations");
        Ok(filter.retain(relations, |r| r.name.as_str()))
    }

    async fn object_sql(
        &self,
        kind: &str,
        name: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let sql = queries::OBJECT_SQL.replace("{master}", &self.master(schema));
        let statement = Statement::new(sql, vec![QueryParam::from(kind), QueryParam::from(name)]);
        let (_, rows) = self.fetch_rows(&statement).await?;
        Ok(rows
            .iter()
            .filter_map(|row| catalog::text(row, "sql"))
            .map(|sql| format!("{};", sql))
            .collect())
    }
}

#[async_trait]
impl Client for SqliteClient {
    fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn columns_sql(&self, table: &str, schema: Option<&str>) -> String {
        let dialect = self.dialect();
        let table_literal = dialect.quote_literal(table);
        let (schema_value, args) = match schema {
            Some(s) => {
                let literal = dialect.quote_literal(s);
                (literal.clone(), format!("{}, {}", table_literal, literal))
            }
            None => ("NULL".to_string(), table_literal.clone()),
        };
        queries::COLUMNS_TEMPLATE
            .replace("{schema}", &schema_value)
            .replace("{table}", &table_literal)
            .replace("{args}", &args)
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

    /// No kill command; the run is raced against the cancellation token and
    /// the interrupted connection is closed.
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
                tokio::select! {
                    biased;
                    _ = state.token().cancelled() => Err(DbError::cancelled("query execution")),
                    result = executor::sqlite::run(&mut **conn, &text, mode, limit) => result,
                }
            })
        })
        .await
    }

    async fn kill(&self, state: &CancelState) -> DbResult<()> {
        state.begin_cancel();
        Ok(())
    }

    async fn list_databases(&self) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::raw(queries::LIST_DATABASES)).await?;
        Ok(rows.iter().filter_map(|r| catalog::text(r, "name")).collect())
    }

    async fn list_tables(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, "table", TableType::Table).await
    }

    async fn list_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, "view", TableType::View).await
    }

    /// Rowid-alias primary keys have no backing index; one named `PRIMARY`
    /// is synthesized for them.
    async fn list_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<IndexMetadata>> {
        let (_, listed) = self
            .fetch_rows(&Self::pragma(queries::INDEX_LIST, table, schema))
            .await?;

        let mut indexes = Vec::with_capacity(listed.len() + 1);
        for row in &listed {
            let Some(name) = catalog::text(row, "name") else {
                continue;
            };
            let (_, cols) = self
                .fetch_rows(&Self::pragma(queries::INDEX_COLUMNS, &name, schema))
                .await?;
            let columns = cols.iter().filter_map(|c| catalog::text(c, "name")).collect();
            let primary = catalog::text(row, "origin").as_deref() == Some("pk");
            indexes.push(
                IndexMetadata::new(name, columns)
                    .with_unique(catalog::flag(row, "is_unique"))
                    .with_primary(primary),
            );
        }

        if !indexes.iter().any(|i| i.primary) {
            let key: Vec<String> = self
                .get_primary_keys(table, schema)
                .await?
                .into_iter()
                .map(|k| k.column_name)
                .collect();
            if !key.is_empty() {
                indexes.insert(0, IndexMetadata::new("PRIMARY", key).with_primary(true));
            }
        }
        Ok(indexes)
    }

    async fn get_table_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<KeyMetadata>> {
        let (_, rows) = self
            .fetch_rows(&Self::pragma(queries::FOREIGN_KEYS, table, schema))
            .await?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            let (Some(to_table), Some(from_column)) =
                (catalog::text(row, "to_table"), catalog::text(row, "from_column"))
            else {
                continue;
            };
            // A reference without a column names the parent's primary key.
            let to_column = match catalog::text(row, "to_column") {
                Some(column) => column,
                None => {
                    let seq = catalog::number(row, "seq").unwrap_or_default();
                    self.get_primary_keys(&to_table, schema)
                        .await?
                        .into_iter()
                        .find(|k| i64::from(k.position) == seq + 1)
                        .map(|k| k.column_name)
                        .unwrap_or_default()
                }
            };
            keys.push(KeyMetadata {
                constraint_name: None,
                from_table: table.to_string(),
                from_column,
                to_schema: schema.map(String::from),
                to_table,
                to_column,
                on_delete: ForeignKeyAction::parse(
                    &catalog::text(row, "on_delete").unwrap_or_default(),
                ),
                on_update: ForeignKeyAction::parse(
                    &catalog::text(row, "on_update").unwrap_or_default(),
                ),
            });
        }
        Ok(keys)
    }

    async fn get_primary_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<PrimaryKeyColumn>> {
        let (_, rows) = self
            .fetch_rows(&Self::pragma(queries::PRIMARY_KEYS, table, schema))
            .await?;
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

    /// SQLite has no `TRUNCATE`; every table is emptied with foreign key
    /// enforcement suspended on one connection and autoincrement counters
    /// reset.
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
        let sequence = format!(
            "DELETE FROM {}",
            self.master(schema)
                .replace("sqlite_master", "sqlite_sequence")
        );

        let mut conn = acquire(&self.pool).await?;
        let enforced: i64 = sqlx::query_scalar(queries::FOREIGN_KEYS_ENABLED)
            .fetch_one(&mut *conn)
            .await?;
        let outcome = async {
            (&mut *conn).execute("PRAGMA foreign_keys = OFF").await?;
            for target in &targets {
                (&mut *conn)
                    .execute(format!("DELETE FROM {}", target).as_str())
                    .await?;
            }
            // absent until a table uses AUTOINCREMENT
            if let Err(e) = (&mut *conn).execute(sequence.as_str()).await {
                debug!(error = %e, "No autoincrement counters to reset");
            }
            Ok::<_, DbError>(())
        }
        .await;

        let mut discard = false;
        if enforced != 0
            && let Err(e) = (&mut *conn).execute("PRAGMA foreign_keys = ON").await
        {
            warn!(error = %e, "Failed to restore foreign key enforcement");
            discard = true;
        }
        release(conn, discard);
        outcome?;
        debug!(tables = targets.len(), "Emptied tables");
        Ok(())
    }

    async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let mut script = self.object_sql("table", table, schema).await?;
        if script.is_empty() {
            return Ok(script);
        }
        let sql = queries::INDEX_SQL.replace("{master}", &self.master(schema));
        let (_, rows) = self
            .fetch_rows(&Statement::new(sql, vec![QueryParam::from(table)]))
            .await?;
        script.extend(
            rows.iter()
                .filter_map(|row| catalog::text(row, "sql"))
                .map(|sql| format!("{};", sql)),
        );
        Ok(script)
    }

    async fn get_view_create_script(
        &self,
        view: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        self.object_sql("view", view, schema).await
    }
}
