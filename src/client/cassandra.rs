//! Cassandra / ScyllaDB client.
//!
//! Keyspaces play the role of schemas. Catalog data comes from
//! `system_schema`; parameterized statements are prepared first so values
//! can be converted to the exact CQL types the server expects.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use scylla::Session;
use scylla::frame::response::result::{ColumnSpec, CqlValue};
use scylla::transport::iterator::RowIterator;
use tracing::debug;

use super::{Client, ClientContext, catalog};
use crate::db::cancel::CancelState;
use crate::db::changes::{self, ChangePlan, ensure_writable};
use crate::db::cursor::{Producer, RowSink, StreamingCursor};
use crate::db::dialect::SqlDialect;
use crate::db::executor;
use crate::db::params::{Statement, to_cql};
use crate::db::types::{cql, shape_row};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, ExecuteOptions, IndexMetadata, KeyMetadata, ListFilter, PrimaryKeyColumn,
    QueryParam, QueryResult, ResultField, Row, TableMetadata, TableType,
};

mod queries {
    pub const SERVER_VERSION: &str = "SELECT release_version FROM system.local";

    pub const LIST_KEYSPACES: &str = "SELECT keyspace_name FROM system_schema.keyspaces";

    pub const LIST_TABLES: &str =
        "SELECT keyspace_name, table_name FROM system_schema.tables WHERE keyspace_name = ?";

    pub const LIST_VIEWS: &str =
        "SELECT keyspace_name, view_name FROM system_schema.views WHERE keyspace_name = ?";

    pub const KEYSPACE_COLUMNS: &str = "SELECT keyspace_name, table_name, column_name, \
        clustering_order, kind, position, type FROM system_schema.columns WHERE keyspace_name = ?";

    pub const LIST_INDEXES: &str = "SELECT index_name, kind, options FROM system_schema.indexes \
        WHERE keyspace_name = ? AND table_name = ?";

    pub const VIEW_DEFINITION: &str = "SELECT base_table_name, where_clause, include_all_columns \
        FROM system_schema.views WHERE keyspace_name = ? AND view_name = ?";
}

pub struct CassandraClient {
    ctx: ClientContext,
    session: Arc<Session>,
}

fn typed_values(params: &[QueryParam], specs: &[ColumnSpec]) -> Vec<Option<CqlValue>> {
    params
        .iter()
        .enumerate()
        .map(|(i, param)| {
            let ty = specs.get(i).map(|spec| cql::type_name(&spec.typ));
            to_cql(param, ty.as_deref())
        })
        .collect()
}

fn fields_and_rows(
    specs: &[ColumnSpec],
    rows: Option<Vec<scylla::frame::response::result::Row>>,
) -> (Vec<ResultField>, Vec<Row>) {
    let fields = executor::cassandra::fields_of(specs);
    let rows = rows
        .unwrap_or_default()
        .iter()
        .map(|row| {
            let values = row.columns.iter().map(|v| cql::to_json(v.as_ref()));
            shape_row(&fields, values.collect())
        })
        .collect();
    (fields, rows)
}

async fn open_iter(session: &Session, statement: &Statement) -> DbResult<RowIterator> {
    if statement.params.is_empty() {
        return Ok(session.query_iter(statement.sql.as_str(), ()).await?);
    }
    let prepared = session.prepare(statement.sql.as_str()).await?;
    let values = typed_values(&statement.params, prepared.get_variable_col_specs());
    Ok(session.execute_iter(prepared, values).await?)
}

/// Producer paging through a CQL result set.
fn row_producer(session: Arc<Session>, statement: Statement, skip: u64) -> Producer {
    Box::new(move |sink: RowSink| {
        Box::pin(async move {
            let opened = tokio::select! {
                biased;
                _ = sink.cancelled() => return,
                opened = open_iter(&session, &statement) => opened,
            };
            let mut iter = match opened {
                Ok(iter) => iter,
                Err(e) => {
                    sink.fail(e).await;
                    return;
                }
            };

            let fields = executor::cassandra::fields_of(iter.get_column_specs());
            let mut sent_fields = false;
            let mut skip = skip;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = sink.cancelled() => break,
                    next = iter.next() => next,
                };
                match next {
                    Some(Ok(row)) => {
                        if !sent_fields {
                            sent_fields = true;
                            if !sink.send_fields(fields.clone()).await {
                                break;
                            }
                        }
                        if skip > 0 {
                            skip -= 1;
                            continue;
                        }
                        let values = row.columns.iter().map(|v| cql::to_json(v.as_ref()));
                        if !sink.send_row(shape_row(&fields, values.collect())).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        sink.fail(DbError::from(e)).await;
                        break;
                    }
                    None => break,
                }
            }
        })
    })
}

/// Rank of a column kind in primary key order.
fn kind_rank(kind: &str) -> u8 {
    match kind {
        "partition_key" => 0,
        "clustering" => 1,
        "static" => 2,
        _ => 3,
    }
}

/// Order one table's columns as CQL declares them (partition key, clustering
/// key, then the rest by name) and number them from 1.
fn order_columns(rows: &[Row]) -> Vec<ColumnMetadata> {
    let mut sorted: Vec<&Row> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        let key = |row: &Row| {
            let kind = catalog::text(row, "kind").unwrap_or_default();
            (
                kind_rank(&kind),
                catalog::number(row, "position").unwrap_or_default(),
                catalog::text(row, "column_name").unwrap_or_default(),
            )
        };
        key(a).cmp(&key(b))
    });

    let mut columns = Vec::with_capacity(sorted.len());
    for row in sorted {
        let (Some(table), Some(name)) = (
            catalog::text(row, "table_name"),
            catalog::text(row, "column_name"),
        ) else {
            continue;
        };
        let kind = catalog::text(row, "kind").unwrap_or_default();
        let is_key = kind_rank(&kind) < 2;
        let ordinal = u32::try_from(columns.len() + 1).unwrap_or(u32::MAX);
        columns.push(
            ColumnMetadata::new(
                table,
                name,
                catalog::text(row, "type").unwrap_or_default(),
                ordinal,
            )
            .with_schema(catalog::text(row, "keyspace_name"))
            .with_nullable(!is_key)
            .with_primary_key(is_key)
            .with_extra(Some(kind)),
        );
    }
    columns
}

fn primary_key_clause(dialect: &dyn SqlDialect, columns: &[ColumnMetadata]) -> String {
    let quoted = |kind: &str| -> Vec<String> {
        columns
            .iter()
            .filter(|c| c.extra.as_deref() == Some(kind))
            .map(|c| dialect.wrap_identifier(&c.name))
            .collect()
    };
    let partition = quoted("partition_key");
    let clustering = quoted("clustering");
    let partition = if partition.len() == 1 {
        partition.join("")
    } else {
        format!("({})", partition.join(", "))
    };
    let mut parts = vec![partition];
    parts.extend(clustering);
    format!("PRIMARY KEY ({})", parts.join(", "))
}

impl CassandraClient {
    pub(crate) async fn connect(ctx: ClientContext, session: Arc<Session>) -> DbResult<Self> {
        let mut client = Self { ctx, session };
        let (_, rows) = client
            .fetch_statement(&Statement::raw(queries::SERVER_VERSION))
            .await?;
        client.ctx.server_version = catalog::first_text(&rows);
        Ok(client)
    }

    fn keyspace(&self, schema: Option<&str>) -> DbResult<String> {
        schema
            .or(self.ctx.database())
            .map(String::from)
            .ok_or_else(|| DbError::invalid_input("No keyspace given and none selected on connect"))
    }

    async fn relations(
        &self,
        filter: &ListFilter,
        sql: &str,
        name_column: &str,
        entity_type: TableType,
    ) -> DbResult<Vec<TableMetadata>> {
        let keyspace = self.keyspace(filter.schema.as_deref())?;
        let statement = Statement::new(sql, vec![QueryParam::from(keyspace.as_str())]);
        let (_, rows) = self.fetch_statement(&statement).await?;
        let mut relations: Vec<TableMetadata> = rows
            .iter()
            .filter_map(|row| {
                Some(TableMetadata::new(
                    catalog::text(row, "keyspace_name"),
                    catalog::text(row, name_column)?,
                    entity_type,
                ))
            })
            .collect();
        relations.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(
            keyspace = %keyspace,
            kind = %entity_type,
            count = relations.len(),
            "Listed relations"
        );
        Ok(filter.retain(relations, |r| r.name.as_str()))
    }

    async fn columns_of(&self, table: &str, keyspace: &str) -> DbResult<Vec<ColumnMetadata>> {
        let (_, rows) = self
            .fetch_statement(&Statement::raw(self.columns_sql(table, Some(keyspace))))
            .await?;
        Ok(order_columns(&rows))
    }
}

#[async_trait]
impl Client for CassandraClient {
    fn context(&self) -> &ClientContext {
        &self.ctx
    }

    fn columns_sql(&self, table: &str, schema: Option<&str>) -> String {
        let dialect = self.dialect();
        let keyspace = schema.or(self.ctx.database()).unwrap_or_default();
        format!(
            "{} AND table_name = {}",
            queries::KEYSPACE_COLUMNS.replace("?", &dialect.quote_literal(keyspace)),
            dialect.quote_literal(table)
        )
    }

    async fn fetch_statement(
        &self,
        statement: &Statement,
    ) -> DbResult<(Vec<ResultField>, Vec<Row>)> {
        let result = if statement.params.is_empty() {
            self.session.query(statement.sql.as_str(), ()).await?
        } else {
            let prepared = self.session.prepare(statement.sql.as_str()).await?;
            let values = typed_values(&statement.params, prepared.get_variable_col_specs());
            self.session.execute(&prepared, values).await?
        };
        Ok(fields_and_rows(&result.col_specs, result.rows))
    }

    async fn stream_statement(
        &self,
        statement: Statement,
        skip: u64,
        chunk_size: usize,
    ) -> DbResult<StreamingCursor> {
        Ok(StreamingCursor::new(
            chunk_size,
            row_producer(Arc::clone(&self.session), statement, skip),
        ))
    }

    async fn apply_plan(&self, plan: &ChangePlan) -> DbResult<()> {
        changes::cassandra::apply(&self.session, plan).await
    }

    async fn reselect(&self, plan: &ChangePlan) -> DbResult<Vec<Row>> {
        changes::cassandra::reselect(&self.session, plan).await
    }

    async fn run_cancelable(
        &self,
        state: Arc<CancelState>,
        text: &str,
        options: &ExecuteOptions,
    ) -> DbResult<Vec<QueryResult>> {
        let limit = self.ctx.executor.timeout_for(options);
        tokio::select! {
            biased;
            _ = state.token().cancelled() => Err(DbError::cancelled("query execution")),
            result = executor::cassandra::run(&self.session, text, options.row_mode, limit) => result,
        }
    }

    async fn kill(&self, state: &CancelState) -> DbResult<()> {
        state.begin_cancel();
        Ok(())
    }

    async fn list_databases(&self) -> DbResult<Vec<String>> {
        let (_, rows) = self
            .fetch_statement(&Statement::raw(queries::LIST_KEYSPACES))
            .await?;
        let mut keyspaces: Vec<String> = rows
            .iter()
            .filter_map(|r| catalog::text(r, "keyspace_name"))
            .collect();
        keyspaces.sort();
        Ok(keyspaces)
    }

    async fn list_schemas(&self) -> DbResult<Vec<String>> {
        self.list_databases().await
    }

    async fn list_tables(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(filter, queries::LIST_TABLES, "table_name", TableType::Table)
            .await
    }

    /// CQL has no plain views.
    async fn list_views(&self, _filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        Ok(Vec::new())
    }

    async fn list_materialized_views(&self, filter: &ListFilter) -> DbResult<Vec<TableMetadata>> {
        self.relations(
            filter,
            queries::LIST_VIEWS,
            "view_name",
            TableType::MaterializedView,
        )
        .await
    }

    async fn list_table_columns(
        &self,
        table: Option<&str>,
        schema: Option<&str>,
    ) -> DbResult<Vec<ColumnMetadata>> {
        let keyspace = self.keyspace(schema)?;
        if let Some(table) = table {
            return self.columns_of(table, &keyspace).await;
        }

        let statement = Statement::new(
            queries::KEYSPACE_COLUMNS,
            vec![QueryParam::from(keyspace.as_str())],
        );
        let (_, rows) = self.fetch_statement(&statement).await?;
        let mut tables: Vec<String> = rows
            .iter()
            .filter_map(|r| catalog::text(r, "table_name"))
            .collect();
        tables.sort();
        tables.dedup();

        let mut columns = Vec::with_capacity(rows.len());
        for table in &tables {
            let own: Vec<Row> = rows
                .iter()
                .filter(|r| catalog::text(r, "table_name").as_deref() == Some(table.as_str()))
                .cloned()
                .collect();
            columns.extend(order_columns(&own));
        }
        Ok(columns)
    }

    /// Secondary indexes plus a synthesized `PRIMARY` entry for the key.
    async fn list_table_indexes(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<IndexMetadata>> {
        let keyspace = self.keyspace(schema)?;
        let key: Vec<String> = self
            .get_primary_keys(table, Some(&keyspace))
            .await?
            .into_iter()
            .map(|k| k.column_name)
            .collect();

        let mut indexes = Vec::new();
        if !key.is_empty() {
            indexes.push(IndexMetadata::new("PRIMARY", key).with_primary(true));
        }

        let statement = Statement::new(
            queries::LIST_INDEXES,
            vec![QueryParam::from(keyspace.as_str()), QueryParam::from(table)],
        );
        let (_, rows) = self.fetch_statement(&statement).await?;
        for row in &rows {
            let Some(name) = catalog::text(row, "index_name") else {
                continue;
            };
            let target = row
                .get("options")
                .and_then(|options| options.get("target"))
                .and_then(|t| t.as_str())
                .map(|t| t.trim_matches('"').to_string());
            indexes.push(IndexMetadata::new(name, target.into_iter().collect()));
        }
        Ok(indexes)
    }

    /// CQL has no foreign keys.
    async fn get_table_keys(
        &self,
        _table: &str,
        _schema: Option<&str>,
    ) -> DbResult<Vec<KeyMetadata>> {
        Ok(Vec::new())
    }

    async fn get_primary_keys(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<PrimaryKeyColumn>> {
        let columns = self.list_table_columns(Some(table), schema).await?;
        Ok(columns
            .into_iter()
            .filter(|c| c.is_primary_key)
            .enumerate()
            .map(|(i, c)| PrimaryKeyColumn {
                column_name: c.name,
                position: u32::try_from(i + 1).unwrap_or(u32::MAX),
            })
            .collect())
    }

    async fn truncate_all_tables(&self, schema: Option<&str>) -> DbResult<()> {
        ensure_writable(self.ctx.read_only(), "truncate tables")?;
        let keyspace = self.keyspace(schema)?;
        let filter = ListFilter {
            schema: Some(keyspace.clone()),
            ..ListFilter::default()
        };
        let tables = self.list_tables(&filter).await?;
        let dialect = self.dialect();
        for table in &tables {
            let sql = format!("TRUNCATE {}", dialect.qualify(Some(&keyspace), &table.name));
            self.session.query(sql.as_str(), ()).await?;
        }
        debug!(keyspace = %keyspace, tables = tables.len(), "Truncated tables");
        Ok(())
    }

    async fn get_table_create_script(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let keyspace = self.keyspace(schema)?;
        let columns = self.columns_of(table, &keyspace).await?;
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.dialect();
        let target = dialect.qualify(Some(&keyspace), table);

        let mut lines: Vec<String> = columns
            .iter()
            .map(|c| {
                let suffix = if c.extra.as_deref() == Some("static") {
                    " STATIC"
                } else {
                    ""
                };
                format!("  {} {}{}", dialect.wrap_identifier(&c.name), c.data_type, suffix)
            })
            .collect();
        lines.push(format!("  {}", primary_key_clause(dialect, &columns)));
        let mut ddl = format!("CREATE TABLE {} (\n{}\n)", target, lines.join(",\n"));

        // clustering order lives only in the raw catalog rows
        let (_, raw) = self
            .fetch_statement(&Statement::raw(self.columns_sql(table, Some(&keyspace))))
            .await?;
        let order: Vec<String> = columns
            .iter()
            .filter(|c| c.extra.as_deref() == Some("clustering"))
            .map(|c| {
                let direction = raw
                    .iter()
                    .find(|r| catalog::text(r, "column_name").as_deref() == Some(c.name.as_str()))
                    .and_then(|r| catalog::text(r, "clustering_order"))
                    .unwrap_or_else(|| "asc".to_string());
                format!("{} {}", dialect.wrap_identifier(&c.name), direction.to_uppercase())
            })
            .collect();
        if order.iter().any(|o| o.ends_with("DESC")) {
            ddl.push_str(&format!(" WITH CLUSTERING ORDER BY ({})", order.join(", ")));
        }
        ddl.push(';');

        let mut script = vec![ddl];
        for index in self.list_table_indexes(table, Some(&keyspace)).await? {
            if index.primary {
                continue;
            }
            let targets: Vec<String> = index
                .columns
                .iter()
                .map(|c| dialect.wrap_identifier(c))
                .collect();
            script.push(format!(
                "CREATE INDEX {} ON {} ({});",
                dialect.wrap_identifier(&index.name),
                target,
                targets.join(", ")
            ));
        }
        Ok(script)
    }

    /// Materialized view definition rebuilt from `system_schema.views`.
    async fn get_view_create_script(
        &self,
        view: &str,
        schema: Option<&str>,
    ) -> DbResult<Vec<String>> {
        let keyspace = self.keyspace(schema)?;
        let statement = Statement::new(
            queries::VIEW_DEFINITION,
            vec![QueryParam::from(keyspace.as_str()), QueryParam::from(view)],
        );
        let (_, rows) = self.fetch_statement(&statement).await?;
        let Some(definition) = rows.first() else {
            return Ok(Vec::new());
        };
        let base = catalog::text(definition, "base_table_name").unwrap_or_default();
        let where_clause = catalog::text(definition, "where_clause").unwrap_or_default();

        let dialect = self.dialect();
        let columns = self.columns_of(view, &keyspace).await?;
        let projection = if catalog::flag(definition, "include_all_columns") {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| dialect.wrap_identifier(&c.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        Ok(vec![format!(
            "CREATE MATERIALIZED VIEW {} AS\n  SELECT {} FROM {}\n  WHERE {}\n  {};",
            dialect.qualify(Some(&keyspace), view),
            projection,
            dialect.qualify(Some(&keyspace), &base),
            where_clause,
            primary_key_clause(dialect, &columns)
        )])
    }
}
