//! PostgreSQL client.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use super::{Client, ClientContext, catalog, sqlx_statement_ops};
use crate::db::cancel::CancelState;
use crate::db::changes::ChangePlan;
use crate::db::cursor::StreamingCursor;
use crate::db::dialect::SqlDialect;
use crate::db::executor;
use crate::db::params::{Statement, bind_postgres};
use crate::db::pool::with_connection;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, ExecuteOptions, ForeignKeyAction, IndexMetadata, KeyMetadata, ListFilter,
    PrimaryKeyColumn, QueryParam, QueryResult, ResultField, RoutineMetadata, RoutineType, Row,
    TableMetadata, TableType,
};

const DEFAULT_SCHEMA: &str = "public";

mod queries {
    pub const SERVER_VERSION: &str = "SELECT current_setting('server_version') AS version";

    pub const BACKEND_PID: &str = "SELECT pg_backend_pid()";

    pub const CANCEL_BACKEND: &str = "SELECT pg_cancel_backend($1)";

    pub const LIST_DATABASES: &str = r#"
        SELECT datname::text AS name
        FROM pg_catalog.pg_database
        WHERE datistemplate = false
        ORDER BY datname
    "#;

    pub const LIST_SCHEMAS: &str = r#"
        SELECT schema_name::text AS name
        FROM information_schema.schemata
        WHERE left(schema_name, 3) <> 'pg_' AND schema_name <> 'information_schema'
        ORDER BY schema_name
    "#;

    pub const LIST_RELATIONS: &str = r#"
        SELECT table_schema::text AS table_schema, table_name::text AS table_name
        FROM information_schema.tables
        WHERE table_schema = $1 AND table_type = $2
        ORDER BY table_name
    "#;

    pub const LIST_MATERIALIZED_VIEWS: &str = r#"
        SELECT schemaname::text AS table_schema, matviewname::text AS table_name
        FROM pg_catalog.pg_matviews
        WHERE schemaname = $1
        ORDER BY matviewname
    "#;

    pub const LIST_ROUTINES: &str = r#"
        SELECT routine_schema::text AS routine_schema,
               routine_name::text AS routine_name,
               routine_type::text AS routine_type,
               data_type::text AS data_type
        FROM information_schema.routines
        WHERE routine_schema = $1
        ORDER BY routine_name
    "#;

    /// Takes literal schema and table names so it can be batched.
    pub const COLUMNS_TEMPLATE: &str = r#"
        SELECT n.nspname::text AS table_schema,
               cl.relname::text AS table_name,
               a.attname::text AS column_name,
               format_type(a.atttypid, a.atttypmod) AS data_type,
               CASE WHEN a.attnotnull THEN 'NO' ELSE 'YES' END AS is_nullable,
               pg_get_expr(d.adbin, d.adrelid) AS column_default,
               a.attnum::int AS ordinal_position,
               (a.attgenerated = 's') AS generated,
               COALESCE(pk.indisprimary, false) AS is_primary_key,
               CASE WHEN a.attidentity IN ('a', 'd') THEN 'identity' END AS extra
        FROM pg_catalog.pg_attribute a
        JOIN pg_catalog.pg_class cl ON cl.oid = a.attrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
        LEFT JOIN pg_catalog.pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
        LEFT JOIN pg_catalog.pg_index pk
               ON pk.indrelid = a.attrelid AND pk.indisprimary AND a.attnum = ANY(pk.indkey)
        WHERE n.nspname = {schema} AND cl.relname = {table}
          AND a.attnum > 0 AND NOT a.attisdropped
        ORDER BY a.attnum
    "#;

    pub const LIST_INDEXES: &str = r#"
        SELECT ic.relname::text AS index_name,
               ix.indisunique AS is_unique,
               ix.indisprimary AS is_primary,
               string_agg(a.attname::text, ',' ORDER BY array_position(ix.indkey::int2[], a.attnum)) AS columns
        FROM pg_catalog.pg_index ix
        JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
        JOIN pg_catalog.pg_class ic ON ic.oid = ix.indexrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
        JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey)
        WHERE n.nspname = $1 AND t.relname = $2
        GROUP BY ic.relname, ix.indisunique, ix.indisprimary
        ORDER BY ic.relname
    "#;

    pub const FOREIGN_KEYS: &str = r#"
        SELECT con.conname::text AS constraint_name,
               cl.relname::text AS from_table,
               a.attname::text AS from_column,
               fn.nspname::text AS to_schema,
               fcl.relname::text AS to_table,
               fa.attname::text AS to_column,
               CASE con.confdeltype
                   WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET NULL'
                   WHEN 'd' THEN 'SET DEFAULT' WHEN 'r' THEN 'RESTRICT'
                   ELSE 'NO ACTION' END AS on_delete,
               CASE con.confupdtype
                   WHEN 'c' THEN 'CASCADE' WHEN 'n' THEN 'SET NULL'
                   WHEN 'd' THEN 'SET DEFAULT' WHEN 'r' THEN 'RESTRICT'
                   ELSE 'NO ACTION' END AS on_update
        FROM pg_catalog.pg_constraint con
        JOIN pg_catalog.pg_class cl ON cl.oid = con.conrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = cl.relnamespace
        JOIN pg_catalog.pg_class fcl ON fcl.oid = con.confrelid
        JOIN pg_catalog.pg_namespace fn ON fn.oid = fcl.relnamespace
        CROSS JOIN LATERAL unnest(con.conkey, con.confkey)
             WITH ORDINALITY AS k(from_attnum, to_attnum, position)
        JOIN pg_catalog.pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.from_attnum
        JOIN pg_catalog.pg_attribute fa ON fa.attrelid = con.confrelid AND fa.attnum = k.to_attnum
        WHERE con.contype = 'f' AND n.nspname = $1 AND cl.relname = $2
        ORDER BY con.conname, k.position
    "#;

    pub const PRIMARY_KEYS: &str = r#"
        SELECT a.attname::text AS column_name, k.position::int AS position
        FROM pg_catalog.pg_index ix
        JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
        CROSS JOIN LATERAL unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, position)
        JOIN pg_catalog.pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
        WHERE ix.indisprimary AND n.nspname = $1 AND t.relname = $2
        ORDER BY k.position
    "#;

    pub const INDEX_DEFINITIONS: &str = r#"
        SELECT pg_get_indexdef(ix.indexrelid) AS definition
        FROM pg_catalog.pg_index ix
        JOIN pg_catalog.pg_class t ON t.oid = ix.indrelid
        JOIN pg_catalog.pg_namespace n ON n.oid = t.relnamespace
        WHERE NOT ix.indisprimary AND n.nspname = $1 AND t.relname = $2
        ORDER BY 1
    "#;

    pub const VIEW_DEFINITION: &str = r#"
        SELECT definition FROM pg_catalog.pg_views WHERE schemaname = $1 AND viewname = $2
    "#;

    pub const MATERIALIZED_VIEW_DEFINITION: &str = r#"
        SELECT definition FROM pg_catalog.pg_matviews WHERE schemaname = $1 AND matviewname = $2
    "#;

    pub const ROUTINE_DEFINITIONS: &str = r#"
        SELECT pg_get_functiondef(p.oid) AS definition
        FROM pg_catalog.pg_proc p
        JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
        WHERE n.nspname = $1 AND p.proname = $2 AND p.prokind IN ('f', 'p')
        ORDER BY p.oid
    "#;
}

pub struct PostgresClient {
    ctx: ClientContext,
    pool: PgPool,
}

sqlx_statement_ops!(PostgresClient, bind_postgres, postgres);

fn names(schema: &str, table: &str) -> Vec<QueryParam> {
    vec![QueryParam::from(schema), QueryParam::from(table)]
}

impl PostgresClient {
    pub(crate) async fn connect(mut ctx: ClientContext, pool: PgPool) -> DbResult<Self> {
        let version: String = sqlx::query_scalar(queries::SERVER_VERSION)
            .fetch_one(&pool)
            .await?;
        ctx.server_version = Some(version);
        Ok(Self { ctx, pool })
    }

    fn schema_or_default<'a>(schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or(DEFAULT_SCHEMA)
    }

    async fn relations(
        &self,
        filter: &ListFilter,
        sql: &str,
        table_type: Option<&str>,
        entity_type: TableType,
    ) -> DbResult<Vec<TableMetadata>> {
        let schema = Self::schema_or_default(filter.schema.as_deref());
        let mut params = vec![QueryParam::from(schema)];
        if let Some(kind) = table_type {
            params.push(QueryParam::from(kind));
        }
        let (_, rows) = self.fetch_rows(&Statement::new(sql, params)).await?;
        let relations: Vec<TableMetadata> = rows
            .iter()
            .filter_map(|row| {
                let name = catalog::text(row, "table_name")?;
                Some(TableMetadata::new(
                    catalog::text(row, "table_schema"),
                    name,
                    entity_type,
                ))
            })
            .collect();
        debug!(schema, kind = %entity_type, count = relations.len(), "Listed relations");
        Ok(filter.retain(relations, |r| r.name.as_str()))
    }

    async fn definitions(&self, sql: &str, schema: &str, name: &str) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::new(sql, names(schema, name))).await?;
        Ok(rows
            .iter()
            .filter_map(|row| catalog::text(row, "definition"))
            .collect())
    }
}

/// `CREATE TABLE` text rebuilt from catalog metadata.
fn create_table_ddl(
    dialect: &dyn SqlDialect,
    schema: &str,
    table: &str,
    columns: &[ColumnMetadata],
    primary_key: &[PrimaryKeyColumn],
    keys: &[KeyMetadata],
) -> String {
    let mut lines: Vec<String> = columns
        .iter()
        .map(|c| {
            let mut line = format!("  {} {}", dialect.wrap_identifier(&c.name), c.data_type);
            if c.extra.as_deref() == Some("identity") {
                line.push_str(" GENERATED BY DEFAULT AS IDENTITY");
            } else if let Some(default) = &c.default_value {
                if c.generated {
                    line.push_str(&format!(" GENERATED ALWAYS AS ({}) STORED", default));
                } else {
                    line.push_str(&format!(" DEFAULT {}", default));
                }
            }
            if !c.nullable {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();

    if !primary_key.is_empty() {
        let cols: Vec<String> = primary_key
            .iter()
            .map(|k| dialect.wrap_identifier(&k.column_name))
            .collect();
        lines.push(format!("  PRIMARY KEY ({})", cols.join(", ")));
    }

    let mut constraint_order: Vec<&str> = Vec::new();
    for key in keys {
        let name = key.constraint_name.as_deref().unwrap_or_default();
        if !constraint_order.contains(&name) {
            constraint_order.push(name);
        }
    }
    for name in constraint_order {
        let parts: Vec<&KeyMetadata> = keys
            .iter()
            .filter(|k| k.constraint_name.as_deref().unwrap_or_default() == name)
            .collect();
        let Some(first) = parts.first() else {
            continue;
        };
        let from: Vec<String> = parts
            .iter()
            .map(|k| dialect.wrap_identifier(&k.from_column))
            .collect();
        let to: Vec<String> = parts
            .iter()
            .map(|k| dialect.wrap_identifier(&k.to_column))
            .collect();
        let mut line = format!(
            "  CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            dialect.wrap_identifier(name),
            from.join(", "),
            dialect.qualify(first.to_schema.as_deref(), &first.to_table),
            to.join(", ")
        );
        if first.on_delete != ForeignKeyAction::NoAction {
            line.push_str(&format!(" ON DELETE {}", first.on_delete));
        }
        if first.on_update != ForeignKeyAction::NoAction {
            line.push_str(&format!(" ON UPDATE {}", first.on_update));
        }
        lines.push(line);
    }

    format!(
        "CREATE TABLE {} (\n{}\n);",
        dialect.qualify(Some(schema), table),
        lines.join(",\n")
    )
}

#[async_trait]
impl Client for PostgresClient {
    fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn columns_sql(&self, table: &str, schema: Option<&str>) -> String {
        let dialect = self.dialect();
        queries::COLUMNS_TEMPLATE
            .replace(
                "{schema}",
                &dialect.quote_literal(Self::schema_or_default(schema)),
            )
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
                let pid: i32 = sqlx::query_scalar(queries::BACKEND_PID)
                    .fetch_one(&mut **conn)
                    .await?;
                state.set_session_id(i64::from(pid));
                if state.is_canceling() {
                    return Err(DbError::cancelled("query execution"));
                }
                executor::postgres::run(&mut **conn, &text, mode, limit).await
            })
        })
        .await
    }

    async fn kill(&self, state: &CancelState) -> DbResult<()> {
        state.begin_cancel();
        let Some(pid) = state.session_id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| DbError::internal(format!("Backend pid {} out of range", pid)))?;
        let signalled: bool = sqlx::query_scalar(queries::CANCEL_BACKEND)
            .bind(pid)
            .fetch_one(&self.pool)
            .await?;
        debug!(pid, signalled, "Sent cancel request");
        Ok(())
    }

    async fn list_databases(&self) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::raw(queries::LIST_DATABASES)).await?;
        Ok(rows.iter().filter_map(|r| catalog::text(r, "name")).collect())
    }

    async fn list_schemas(&self) -> DbResult<Vec<String>> {
        let (_, rows) = self.fetch_rows(&Statement::raw(queries::LIST_SCHEMAS)).await?;
        Ok(rows.iter().filter_map(|r| catalog::text(r, "name")).collect())
    }

    async fn list_tables(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(
            filter,
            queries::LIST_RELATIONS,
            Some("BASE TABLE"),
            TableType::Table,
        )
        .await
    }

    async fn list_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, queries::LIST_RELATIONS, Some("VIEW"), TableType::View)
            .await
    }

    async fn list_materialized_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(
            filter,
            queries::LIST_MATERIALIZED_VIEWS,
            None,
            TableType::MaterializedView,
        )
        .await
    }

    async fn list_routines(&self, filter: &ListFilter) -> DbResult<Vec<RoutineMetadata>> {
        let schema = Self::schema_or_default(filter.schema.as_deref());
        let statement = Statement::new(queries::LIST_ROUTINES, vec![QueryParam::from(schema)]);
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
                    return_type: catalog::text(row, "data_type"),
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
        let schema = Self::schema_or_default(schema);
        let statement = Statement::new(queries::LIST_INDEXES, names(schema, table));
        let (_, rows) = self.fetch_rows(&statement).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let name = catalog::text(row, "index_name")?;
                let columns = catalog::name_list(&catalog::text(row, "columns").unwrap_or_default());
                Some(
                    IndexMetadata::new(name, columns)
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
        let schema = Self::schema_or_default(schema);
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
        let schema = Self::schema_or_default(schema);
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

    async fn truncate_all_tables(&self, schema: Option<&str>) -> DbResult<()> {
        crate::db::changes::ensure_writable(self.ctx.read_only(), "truncate tables")?;
        let filter = ListFilter {
            schema: Some(Self::schema_or_default(schema).to_string()),
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
        let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", targets.join(", "));
        self.execute_query(&sql, &ExecuteOptions::default()).await?;
        debug!(tables = tables.len(), "Truncated tables");
        Ok(())
    }

    async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let schema_name = Self::schema_or_default(schema);
        let columns = self.list_table_columns(Some(table), Some(schema_name)).await?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let primary_key = self.get_primary_keys(table, Some(schema_name)).await?;
        let keys = self.get_table_keys(table, Some(schema_name)).await?;

        let mut script = vec![create_table_ddl(
            self.dialect(),
            schema_name,
            table,
            &columns,
            &primary_key,
            &keys,
        )];
        script.extend(
            self.definitions(queries::INDEX_DEFINITIONS, schema_name, table)
                .await?
                .into_iter()
                .map(|d| format!("{};", d)),
        );
        Ok(script)
    }

    async fn get_view_create_script(
        &self,
        view: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let schema_name = Self::schema_or_default(schema);
        let target = self.dialect().qualify(Some(schema_name), view);

        let plain = self
            .definitions(queries::VIEW_DEFINITION, schema_name, view)
            .await?;
        if let Some(definition) = plain.into_iter().next() {
            return Ok(vec![format!(
                "CREATE OR REPLACE VIEW {} AS\n{}",
                target,
                definition.trim()
            )]);
        }

        let materialized = self
            .definitions(queries::MATERIALIZED_VIEW_DEFINITION, schema_name, view)
            .await?;
        Ok(materialized
            .into_iter()
            .map(|definition| {
                format!(
                    "CREATE MATERIALIZED VIEW {} AS\n{}",
                    target,
                    definition.trim()
                )
            })
            .collect())
    }

    async fn get_routine_create_script(
        &self,
        routine: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        self.definitions(
            queries::ROUTINE_DEFINITIONS,
            Self::schema_or_default(schema),
            routine,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::PostgresDialect;

    #[test]
    fn test_create_table_ddl() {
        let columns = vec![
            ColumnMetadata::new("orders", "id", "integer", 1)
                .with_nullable(false)
                .with_extra(Some("identity".into())),
            ColumnMetadata::new("orders", "user_id", "integer", 2).with_nullable(false),
            ColumnMetadata::new("orders", "note", "text", 3)
                .with_default(Some("'none'::text".into())),
        ];
        let primary_key = vec![PrimaryKeyColumn {
            column_name: "id".into(),
            position: 1,
        }];
        let keys = vec![KeyMetadata {
            constraint_name: Some("orders_user_fk".into()),
            from_table: "orders".into(),
            from_column: "user_id".into(),
            to_schema: Some("public".into()),
            to_table: "users".into(),
            to_column: "id".into(),
            on_delete: ForeignKeyAction::Cascade,
            on_update: ForeignKeyAction::NoAction,
        }];
        let ddl = create_table_ddl(&PostgresDialect, "public", "orders", &columns, &primary_key, &keys);
        assert_eq!(
            ddl,
            "CREATE TABLE \"public\".\"orders\" (\n\
             \x20 \"id\" integer GENERATED BY DEFAULT AS IDENTITY NOT NULL,\n\
             \x20 \"user_id\" integer NOT NULL,\n\
             \x20 \"note\" text DEFAULT 'none'::text,\n\
             \x20 PRIMARY KEY (\"id\"),\n\
             \x20 CONSTRAINT \"orders_user_fk\" FOREIGN KEY (\"user_id\") REFERENCES \"public\".\"users\" (\"id\") ON DELETE CASCADE\n\
             );"
        );
    }
}
