//! Query execution engine.
//!
//! Runs SQL text (one or more statements) and normalizes the results:
//!
//! 1. The text is classified with [`classify`](crate::db::classify::classify)
//!    so every result can be labelled with its command verb.
//! 2. SQL dialects send the whole text in one round trip through the text
//!    protocol; the driver's per-statement completion markers delimit the
//!    result sets. Cassandra runs the statements one by one.
//! 3. Results are zipped with the classification by position. Results beyond
//!    the classified count are labelled `UNKNOWN`.
//!
//! The dialect submodules share one shape and differ only in the connection
//! type; callers own the connection so the cancellation layer can capture
//! the session id first.

use std::time::Duration;

use futures_util::TryStreamExt;
use sqlx::Either;
use tokio::time::timeout;

use crate::db::classify::{
    ClassifiedStatement, UNKNOWN_COMMAND, classify, reports_changes, returns_rows,
};
use crate::db::types::{NormalizeRow, shape_fields, shape_row};
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteOptions, QueryResult, ResultField, RowMode};

/// Statement timeout policy shared by a client's operations.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    default_timeout: Duration,
}

impl QueryExecutor {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(u64::from(
            crate::models::DEFAULT_QUERY_TIMEOUT_SECS,
        )))
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Timeout for one `execute_query` call; capped by the options.
    pub fn timeout_for(&self, options: &ExecuteOptions) -> Duration {
        let default_secs = u32::try_from(self.default_timeout.as_secs()).unwrap_or(u32::MAX);
        Duration::from_secs(u64::from(options.effective_timeout(default_secs)))
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn timeout_error(operation: &str, limit: Duration) -> DbError {
    DbError::timeout(
        operation,
        u32::try_from(limit.as_secs()).unwrap_or(u32::MAX),
    )
}

/// Label and shape per-statement outputs (`rows`, `rows_affected`).
fn assemble<R: NormalizeRow>(
    outputs: Vec<(Vec<R>, u64)>,
    classified: &[ClassifiedStatement],
    mode: RowMode,
) -> Vec<QueryResult> {
    outputs
        .into_iter()
        .enumerate()
        .map(|(i, (rows, affected))| {
            let command = classified
                .get(i)
                .map(|s| s.command.clone())
                .unwrap_or_else(|| UNKNOWN_COMMAND.to_string());
            if rows.is_empty() && !returns_rows(&command) {
                // SQLite keeps the last DML count across DDL
                let affected = if reports_changes(&command) { affected } else { 0 };
                return QueryResult::with_affected(command, affected);
            }
            let fields = rows
                .first()
                .map(|r| shape_fields(r.fields(), mode))
                .unwrap_or_default();
            let rows = rows.iter().map(|r| shape_row(&fields, r.values())).collect();
            QueryResult::with_rows(command, fields, rows)
        })
        .collect()
}

macro_rules! text_protocol_runner {
    ($module:ident, $conn:ty, $dialect:expr) => {
        pub mod $module {
            use super::*;
            use sqlx::{Column, Executor, Statement as _, TypeInfo};

            /// Column descriptors of `sql` without running it.
            async fn describe_fields(
                conn: &mut $conn,
                sql: &str,
                mode: RowMode,
            ) -> Vec<ResultField> {
                match (&mut *conn).prepare(sql).await {
                    Ok(statement) => {
                        let fields = statement
                            .columns()
                            .iter()
                            .map(|col| {
                                ResultField::new(col.name(), Some(col.type_info().name().to_string()))
                            })
                            .collect();
                        shape_fields(fields, mode)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Could not describe empty result set");
                        Vec::new()
                    }
                }
            }

            /// Run `sql` as one batch on `conn`.
            pub async fn run(
                conn: &mut $conn,
                sql: &str,
                mode: RowMode,
                limit: Duration,
            ) -> DbResult<Vec<QueryResult>> {
                let classified = classify(sql, $dialect);
                if classified.is_empty() {
                    return Ok(Vec::new());
                }
                tracing::debug!(
                    dialect = %$dialect,
                    statements = classified.len(),
                    "Executing batch"
                );

                let batch = async {
                    let mut outputs = Vec::with_capacity(classified.len());
                    {
                        let mut rows = Vec::new();
                        let mut stream = (&mut *conn).fetch_many(sql);
                        while let Some(item) = stream.try_next().await? {
                            match item {
                                Either::Left(done) => {
                                    outputs.push((std::mem::take(&mut rows), done.rows_affected()))
                                }
                                Either::Right(row) => rows.push(row),
                            }
                        }
                        if !rows.is_empty() {
                            outputs.push((rows, 0));
                        }
                    }

                    // empty row sets carry no columns; read them from the statement
                    let mut results = assemble(outputs, &classified, mode);
                    for (result, statement) in results.iter_mut().zip(&classified) {
                        if result.fields.is_empty() && returns_rows(&result.command) {
                            result.fields =
                                describe_fields(&mut *conn, &statement.text, mode).await;
                        }
                    }
                    Ok::<_, DbError>(results)
                };

                match timeout(limit, batch).await {
                    Ok(results) => results.map_err(|e| e.with_driver_hint($dialect)),
                    Err(_) => Err(timeout_error("query execution", limit)),
                }
            }
        }
    };
}

text_protocol_runner!(mysql, sqlx::MySqlConnection, crate::models::DatabaseType::MySQL);
text_protocol_runner!(postgres, sqlx::PgConnection, crate::models::DatabaseType::PostgreSQL);
text_protocol_runner!(sqlite, sqlx::SqliteConnection, crate::models::DatabaseType::SQLite);

pub mod cassandra {
    use super::*;
    use crate::db::types::cql;
    use crate::models::DatabaseType;
    use scylla::Session;
    use scylla::frame::response::result::ColumnSpec;

    pub(crate) fn fields_of(specs: &[ColumnSpec]) -> Vec<ResultField> {
        specs
            .iter()
            .map(|spec| ResultField::new(spec.name.clone(), Some(cql::type_name(&spec.typ))))
            .collect()
    }

    /// Run each statement of `sql` in order; CQL has no multi-statement text.
    pub async fn run(
        session: &Session,
        sql: &str,
        mode: RowMode,
        limit: Duration,
    ) -> DbResult<Vec<QueryResult>> {
        let classified = classify(sql, DatabaseType::Cassandra);
        if classified.is_empty() {
            return Ok(Vec::new());
        }
        tracing::debug!(statements = classified.len(), "Executing CQL statements");

        let batch = async {
            let mut results = Vec::with_capacity(classified.len());
            for statement in &classified {
                let response = session.query(statement.text.as_str(), ()).await?;
                let result = match response.rows {
                    Some(rows) => {
                        let fields = shape_fields(fields_of(&response.col_specs), mode);
                        let rows = rows
                            .iter()
                            .map(|row| {
                                let values = row.columns.iter().map(|v| cql::to_json(v.as_ref()));
                                shape_row(&fields, values.collect())
                            })
                            .collect();
                        QueryResult::with_rows(statement.command.clone(), fields, rows)
                    }
                    None => QueryResult::with_affected(statement.command.clone(), 0),
                };
                results.push(result);
            }
            Ok::<_, DbError>(results)
        };

        match timeout(limit, batch).await {
            Ok(results) => results,
            Err(_) => Err(timeout_error("query execution", limit)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MAX_QUERY_TIMEOUT_SECS;
    use sqlx::Connection;

    #[test]
    fn test_executor_timeouts() {
        let executor = QueryExecutor::with_timeout(Duration::from_secs(45));
        assert_eq!(
            executor.timeout_for(&ExecuteOptions::default()),
            Duration::from_secs(45)
        );
        let capped = ExecuteOptions {
            row_mode: RowMode::Object,
            timeout_secs: Some(u32::MAX),
        };
        assert_eq!(
            executor.timeout_for(&capped),
            Duration::from_secs(u64::from(MAX_QUERY_TIMEOUT_SECS))
        );
    }

    #[tokio::test]
    async fn test_batch_results_are_split_and_labelled() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let results = sqlite::run(
            &mut conn,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO t (name) VALUES ('a'), ('b');
             SELECT id, name FROM t ORDER BY id;
             SELECT count(*) AS n FROM t WHERE id > 100;",
            RowMode::Object,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let commands: Vec<_> = results.iter().map(|r| r.command.as_str()).collect();
        assert_eq!(commands, vec!["CREATE", "INSERT", "SELECT", "SELECT"]);
        assert_eq!(results[1].affected_rows, Some(2));
        assert!(results[1].row_count.is_none());
        assert_eq!(results[2].row_count, Some(2));
        assert_eq!(results[2].rows[1]["name"], "b");
        assert_eq!(results[3].rows[0]["n"], 0);
    }

    #[tokio::test]
    async fn test_ddl_does_not_inherit_change_count() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let results = sqlite::run(
            &mut conn,
            "CREATE TABLE t (a INT);
             INSERT INTO t VALUES (1), (2), (3);
             CREATE TABLE z (a INT);
             DROP TABLE z;
             DELETE FROM t WHERE a > 1;",
            RowMode::Object,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let affected: Vec<_> = results.iter().map(|r| r.affected_rows).collect();
        assert_eq!(affected, vec![Some(0), Some(3), Some(0), Some(0), Some(2)]);
    }

    #[tokio::test]
    async fn test_empty_select_keeps_its_columns() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let results = sqlite::run(
            &mut conn,
            "CREATE TABLE t (id INTEGER PRIMARY KEY, title TEXT);
             SELECT * FROM t WHERE id = -1;
             SELECT title, id FROM t WHERE id = -1;",
            RowMode::Array,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(results[1].row_count, Some(0));
        let names: Vec<_> = results[1].fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "title"]);
        let ids: Vec<_> = results[2].fields.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c1"]);
        assert_eq!(results[2].fields[0].name, "title");
    }

    #[tokio::test]
    async fn test_array_mode_keys_by_position() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let results = sqlite::run(
            &mut conn,
            "SELECT 1 AS a, 2 AS a",
            RowMode::Array,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        let row = &results[0].rows[0];
        assert_eq!(row["c0"], 1);
        assert_eq!(row["c1"], 2);
        assert_eq!(results[0].fields[1].name, "a");
    }

    #[tokio::test]
    async fn test_empty_text_has_no_results() {
        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:").await.unwrap();
        for text in ["", "  ", "-- nothing here"] {
            let results = sqlite::run(&mut conn, text, RowMode::Object, Duration::from_secs(5))
                .await
                .unwrap();
            assert!(results.is_empty());
        }
    }
}
