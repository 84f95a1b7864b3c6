//! Change-application engine.
//!
//! A [`TableChangeBundle`] is planned into parameterized statements (inserts,
//! then updates, then deletes) and applied inside one transaction. Any
//! failure rolls the whole bundle back and surfaces as
//! [`DbError::ChangesRolledBack`]. Cassandra has no transactions; its bundle
//! is checked up front and sent as one logged batch.
//!
//! Updated rows are re-selected after the commit, outside the transaction, so
//! a concurrent writer can change them between the commit and the re-select.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::db::dialect::SqlDialect;
use crate::db::params::Statement;
use crate::db::types::{TypeCategory, categorize_type};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, DatabaseType, KeyValue, QueryParam, Row, TableChangeBundle,
};

/// Live columns of every table a bundle touches, keyed by `(schema, table)`.
pub type TableColumns = HashMap<(Option<String>, String), Vec<ColumnMetadata>>;

/// Parse a textual bit literal: `b'0101'`, `0b0101` or `0101`.
pub fn parse_bit_literal(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = if let Some(inner) = text
        .strip_prefix("b'")
        .or_else(|| text.strip_prefix("B'"))
        .and_then(|rest| rest.strip_suffix('\''))
    {
        inner
    } else if let Some(rest) = text.strip_prefix("0b").or_else(|| text.strip_prefix("0B")) {
        rest
    } else {
        text
    };
    if digits.is_empty() || digits.len() > 64 || !digits.chars().all(|c| c == '0' || c == '1') {
        return None;
    }
    u64::from_str_radix(digits, 2).ok()
}

/// Declared width of a bit column; `None` for variable-width `varbit`.
fn bit_width(column_type: &str) -> Option<u32> {
    let lower = column_type.to_lowercase();
    if lower.starts_with("varbit") || lower.starts_with("bit varying") {
        return None;
    }
    match lower.split_once('(') {
        Some((_, rest)) => rest.trim_end_matches(')').trim().parse().ok(),
        None => Some(1),
    }
}

fn bit_error(value: &JsonValue, column_type: &str) -> DbError {
    DbError::invalid_input(format!(
        "value {} is not a valid bit literal for a column of type {}",
        value, column_type
    ))
}

fn coerce_bit(value: &JsonValue, column_type: &str, db: DatabaseType) -> DbResult<QueryParam> {
    let width = bit_width(column_type);
    if width == Some(1) {
        let bit = match value {
            JsonValue::Bool(b) => Some(u64::from(*b)),
            JsonValue::Number(n) => n.as_u64().filter(|n| *n <= 1),
            JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(1),
                "false" => Some(0),
                other => parse_bit_literal(other).filter(|n| *n <= 1),
            },
            _ => None,
        };
        return bit
            .map(|b| QueryParam::Int(b as i64))
            .ok_or_else(|| bit_error(value, column_type));
    }

    let (bits, digits) = match value {
        JsonValue::Number(n) => {
            let n = n.as_u64().ok_or_else(|| bit_error(value, column_type))?;
            (n, None)
        }
        JsonValue::String(s) => {
            let n = parse_bit_literal(s).ok_or_else(|| bit_error(value, column_type))?;
            let trimmed = s.trim().trim_start_matches("0b").trim_start_matches("0B");
            let digits = trimmed
                .trim_start_matches("b'")
                .trim_start_matches("B'")
                .trim_end_matches('\'');
            (n, Some(digits.to_string()))
        }
        _ => return Err(bit_error(value, column_type)),
    };

    match db {
        // bit strings are cast server-side from their textual form
        DatabaseType::PostgreSQL => {
            let text = match (width, digits) {
                (Some(w), _) => format!("{:0width$b}", bits, width = w as usize),
                (None, Some(d)) => d,
                (None, None) => format!("{:b}", bits),
            };
            Ok(QueryParam::String(text))
        }
        _ => Ok(QueryParam::Int(bits as i64)),
    }
}

/// Convert a JSON payload value into the parameter a column of
/// `column_type` accepts.
pub fn coerce_value(
    value: &JsonValue,
    column_type: Option<&str>,
    db: DatabaseType,
) -> DbResult<QueryParam> {
    if value.is_null() {
        return Ok(QueryParam::Null);
    }
    let Some(column_type) = column_type else {
        return Ok(QueryParam::from(value));
    };
    match categorize_type(column_type, db) {
        TypeCategory::Bit => coerce_bit(value, column_type, db),
        TypeCategory::Json => Ok(QueryParam::Json(value.clone())),
        TypeCategory::Boolean => match value {
            JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Ok(QueryParam::Bool(true)),
            JsonValue::String(s) if s.eq_ignore_ascii_case("false") => {
                Ok(QueryParam::Bool(false))
            }
            other => Ok(QueryParam::from(other)),
        },
        // structured values headed for text columns are stored as JSON text
        TypeCategory::Text if value.is_array() || value.is_object() => {
            Ok(QueryParam::String(value.to_string()))
        }
        _ => Ok(QueryParam::from(value)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// One statement of a bundle.
#[derive(Debug, Clone)]
pub struct PlannedStep {
    pub kind: StepKind,
    pub table: String,
    pub statement: Statement,
    /// Declared column type of each parameter, in parameter order.
    pub param_types: Vec<Option<String>>,
    /// Run when the statement touched no row; the step fails unless it finds one.
    pub existence: Option<Statement>,
    /// Fail when the statement touches no row and there is no existence check.
    pub must_match: bool,
    /// Human-readable key predicate used in errors.
    pub target: String,
}

impl PlannedStep {
    /// Label of this step inside a rolled-back error.
    pub fn stage(&self, index: usize) -> String {
        format!("{} #{} on {}", self.kind, index + 1, self.table)
    }

    /// Column types of the existence check's parameters.
    pub fn existence_types(&self) -> &[Option<String>] {
        let keys = self.existence.as_ref().map_or(0, |s| s.params.len());
        &self.param_types[self.param_types.len().saturating_sub(keys)..]
    }

    pub fn no_match_error(&self) -> DbError {
        DbError::invalid_input(format!(
            "{} on {} matched no row ({})",
            self.kind, self.table, self.target
        ))
    }
}

/// Ordered statements for a bundle plus the post-commit re-selects.
#[derive(Debug, Clone, Default)]
pub struct ChangePlan {
    pub steps: Vec<PlannedStep>,
    pub reselects: Vec<Statement>,
    /// Column types of each re-select's parameters.
    pub reselect_types: Vec<Vec<Option<String>>>,
}

struct Planner<'a> {
    dialect: &'a dyn SqlDialect,
    db: DatabaseType,
    columns: &'a TableColumns,
}

impl Planner<'_> {
    fn column_type<'c>(
        &'c self,
        schema: &Option<String>,
        table: &str,
        column: &str,
    ) -> Option<&'c str> {
        self.columns
            .get(&(schema.clone(), table.to_string()))
            .and_then(|cols| cols.iter().find(|c| c.name == column))
            .map(|c| c.data_type.as_str())
    }

    fn marker(&self, index: usize, column_type: Option<&str>) -> String {
        match column_type {
            Some(ty) => self.dialect.typed_placeholder(index, ty),
            None => self.dialect.placeholder(index),
        }
    }

    /// `WHERE k1 = p AND k2 = p`, numbering placeholders after `params`.
    fn key_clause(
        &self,
        schema: &Option<String>,
        table: &str,
        keys: &[KeyValue],
        params: &mut Vec<QueryParam>,
        types: &mut Vec<Option<String>>,
    ) -> DbResult<String> {
        let mut parts = Vec::with_capacity(keys.len());
        for key in keys {
            let ty = self.column_type(schema, table, &key.column);
            params.push(coerce_value(&key.value, ty, self.db)?);
            types.push(ty.map(str::to_string));
            parts.push(format!(
                "{} = {}",
                self.dialect.wrap_identifier(&key.column),
                self.marker(params.len(), ty)
            ));
        }
        Ok(parts.join(" AND "))
    }

    fn existence(
        &self,
        schema: &Option<String>,
        table: &str,
        keys: &[KeyValue],
    ) -> DbResult<Statement> {
        let mut params = Vec::new();
        let mut types = Vec::new();
        let clause = self.key_clause(schema, table, keys, &mut params, &mut types)?;
        Ok(Statement::new(
            format!(
                "SELECT {} FROM {} WHERE {} LIMIT 1",
                self.dialect.wrap_identifier(&keys[0].column),
                self.dialect.qualify(schema.as_deref(), table),
                clause
            ),
            params,
        ))
    }
}

fn describe_keys(keys: &[KeyValue]) -> String {
    keys.iter()
        .map(|k| format!("{} = {}", k.column, k.value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Plan `bundle` against the live columns of the tables it touches.
pub fn plan_changes(
    dialect: &dyn SqlDialect,
    bundle: &TableChangeBundle,
    columns: &TableColumns,
) -> DbResult<ChangePlan> {
    let db = dialect.db_type();
    let planner = Planner {
        dialect,
        db,
        columns,
    };
    let mut plan = ChangePlan::default();

    for insert in &bundle.inserts {
        let table = dialect.qualify(insert.schema.as_deref(), &insert.table);
        for row in &insert.data {
            let mut params = Vec::with_capacity(row.len());
            let mut types = Vec::with_capacity(row.len());
            let mut names = Vec::with_capacity(row.len());
            let mut markers = Vec::with_capacity(row.len());
            for (column, value) in row {
                let ty = planner.column_type(&insert.schema, &insert.table, column);
                params.push(coerce_value(value, ty, db)?);
                types.push(ty.map(str::to_string));
                names.push(dialect.wrap_identifier(column));
                markers.push(planner.marker(params.len(), ty));
            }
            let sql = if names.is_empty() {
                match db {
                    DatabaseType::MySQL => format!("INSERT INTO {} () VALUES ()", table),
                    DatabaseType::Cassandra => {
                        return Err(DbError::invalid_input(format!(
                            "insert into {} needs at least the primary key columns",
                            insert.table
                        )));
                    }
                    _ => format!("INSERT INTO {} DEFAULT VALUES", table),
                }
            } else {
                format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    names.join(", "),
                    markers.join(", ")
                )
            };
            plan.steps.push(PlannedStep {
                kind: StepKind::Insert,
                table: insert.table.clone(),
                statement: Statement::new(sql, params),
                param_types: types,
                existence: None,
                must_match: false,
                target: String::new(),
            });
        }
    }

    for update in &bundle.updates {
        let keys = update.key_predicates();
        if keys.is_empty() {
            return Err(DbError::invalid_input(format!(
                "update of {}.{} has no primary key predicate",
                update.table, update.column
            )));
        }
        // the live catalog type wins over the caller's hint
        let ty = planner
            .column_type(&update.schema, &update.table, &update.column)
            .or(update.column_type.as_deref());
        let mut params = vec![coerce_value(&update.value, ty, db)?];
        let mut types = vec![ty.map(str::to_string)];
        let set = format!(
            "{} = {}",
            dialect.wrap_identifier(&update.column),
            planner.marker(1, ty)
        );
        let clause =
            planner.key_clause(&update.schema, &update.table, &keys, &mut params, &mut types)?;
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            dialect.qualify(update.schema.as_deref(), &update.table),
            set,
            clause
        );
        plan.steps.push(PlannedStep {
            kind: StepKind::Update,
            table: update.table.clone(),
            statement: Statement::new(sql, params),
            param_types: types,
            existence: Some(planner.existence(&update.schema, &update.table, &keys)?),
            must_match: true,
            target: describe_keys(&keys),
        });

        // a changed key column is looked up by its new value
        let reselect_keys: Vec<KeyValue> = keys
            .into_iter()
            .map(|mut k| {
                if k.column == update.column {
                    k.value = update.value.clone();
                }
                k
            })
            .collect();
        let mut params = Vec::new();
        let mut types = Vec::new();
        let clause = planner.key_clause(
            &update.schema,
            &update.table,
            &reselect_keys,
            &mut params,
            &mut types,
        )?;
        plan.reselects.push(Statement::new(
            format!(
                "SELECT * FROM {} WHERE {}",
                dialect.qualify(update.schema.as_deref(), &update.table),
                clause
            ),
            params,
        ));
        plan.reselect_types.push(types);
    }

    for delete in &bundle.deletes {
        let keys = delete.key_predicates();
        if keys.is_empty() {
            return Err(DbError::invalid_input(format!(
                "delete from {} has no primary key predicate",
                delete.table
            )));
        }
        let mut params = Vec::new();
        let mut types = Vec::new();
        let clause =
            planner.key_clause(&delete.schema, &delete.table, &keys, &mut params, &mut types)?;
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            dialect.qualify(delete.schema.as_deref(), &delete.table),
            clause
        );
        // Cassandra reports no affected rows, so its deletes are checked first
        let existence = if db == DatabaseType::Cassandra {
            Some(planner.existence(&delete.schema, &delete.table, &keys)?)
        } else {
            None
        };
        plan.steps.push(PlannedStep {
            kind: StepKind::Delete,
            table: delete.table.clone(),
            statement: Statement::new(sql, params),
            param_types: types,
            existence,
            must_match: true,
            target: describe_keys(&keys),
        });
    }

    Ok(plan)
}

/// Reject writes on read-only servers.
pub(crate) fn ensure_writable(read_only: bool, operation: &str) -> DbResult<()> {
    if read_only {
        return Err(DbError::permission(
            operation,
            "the server is configured read-only",
        ));
    }
    Ok(())
}

async fn rollback_quietly<F, E>(rollback: F, stage: &str)
where
    F: std::future::Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(e) = rollback.await {
        tracing::warn!(stage = %stage, error = %e, "Rollback after failed change bundle failed");
    }
}

/// Transactional appliers for the SQL dialects.
///
/// Each generated module exposes `apply(pool, plan)` and
/// `reselect(pool, plan)`.
macro_rules! transactional_applier {
    ($module:ident, $db:ty, $bind:path) => {
        pub mod $module {
            use super::*;
            use crate::db::pool::{acquire, release};
            use crate::db::types::NormalizeRow;
            use sqlx::Connection;

            async fn run_steps(
                tx: &mut sqlx::Transaction<'_, $db>,
                plan: &ChangePlan,
            ) -> Result<(), (String, DbError)> {
                for (index, step) in plan.steps.iter().enumerate() {
                    let stage = || step.stage(index);
                    let affected = $bind(sqlx::query(&step.statement.sql), &step.statement.params)
                        .execute(&mut **tx)
                        .await
                        .map_err(|e| (stage(), DbError::from(e)))?
                        .rows_affected();
                    if affected > 0 {
                        continue;
                    }
                    match &step.existence {
                        // an update that left the value unchanged may report zero rows
                        Some(check) => {
                            let found = $bind(sqlx::query(&check.sql), &check.params)
                                .fetch_optional(&mut **tx)
                                .await
                                .map_err(|e| (stage(), DbError::from(e)))?;
                            if found.is_none() {
                                return Err((stage(), step.no_match_error()));
                            }
                        }
                        None if step.must_match => return Err((stage(), step.no_match_error())),
                        None => {}
                    }
                }
                Ok(())
            }

            /// Apply every step in one transaction; all or nothing.
            pub async fn apply(pool: &sqlx::Pool<$db>, plan: &ChangePlan) -> DbResult<()> {
                let mut conn = acquire(pool).await?;
                let mut tx = conn
                    .begin()
                    .await
                    .map_err(|e| DbError::rolled_back("begin", DbError::from(e)))?;
                tracing::debug!(steps = plan.steps.len(), "Applying change bundle");

                let outcome = match run_steps(&mut tx, plan).await {
                    Ok(()) => tx
                        .commit()
                        .await
                        .map_err(|e| DbError::rolled_back("commit", DbError::from(e))),
                    Err((stage, err)) => {
                        rollback_quietly(tx.rollback(), &stage).await;
                        Err(DbError::rolled_back(stage, err))
                    }
                };
                let discard = matches!(
                    &outcome,
                    Err(DbError::ChangesRolledBack { source, .. }) if source.is_connection_lost()
                );
                release(conn, discard);
                outcome
            }

            /// Re-select updated rows by key; rows that vanished are skipped.
            pub async fn reselect(pool: &sqlx::Pool<$db>, plan: &ChangePlan) -> DbResult<Vec<Row>> {
                let mut rows = Vec::with_capacity(plan.reselects.len());
                for statement in &plan.reselects {
                    let found = $bind(sqlx::query(&statement.sql), &statement.params)
                        .fetch_optional(pool)
                        .await?;
                    if let Some(row) = found {
                        rows.push(row.to_object());
                    }
                }
                Ok(rows)
            }
        }
    };
}

transactional_applier!(mysql, sqlx::MySql, crate::db::params::bind_mysql);
transactional_applier!(postgres, sqlx::Postgres, crate::db::params::bind_postgres);
transactional_applier!(sqlite, sqlx::Sqlite, crate::db::params::bind_sqlite);

pub mod cassandra {
    use super::*;
    use crate::db::params::to_cql;
    use crate::db::types::cql;
    use scylla::Session;
    use scylla::batch::{Batch, BatchType};
    use scylla::frame::response::result::CqlValue;

    fn values(params: &[QueryParam], types: &[Option<String>]) -> Vec<Option<CqlValue>> {
        params
            .iter()
            .enumerate()
            .map(|(i, p)| to_cql(p, types.get(i).and_then(|t| t.as_deref())))
            .collect()
    }

    /// Check every keyed step, then send the bundle as one logged batch.
    pub async fn apply(session: &Session, plan: &ChangePlan) -> DbResult<()> {
        for (index, step) in plan.steps.iter().enumerate() {
            let Some(check) = &step.existence else {
                continue;
            };
            let found = session
                .query(
                    check.sql.as_str(),
                    values(&check.params, step.existence_types()),
                )
                .await
                .map_err(|e| DbError::rolled_back(step.stage(index), DbError::from(e)))?;
            let exists = found.rows.is_some_and(|rows| !rows.is_empty());
            if !exists {
                return Err(DbError::rolled_back(
                    step.stage(index),
                    step.no_match_error(),
                ));
            }
        }
        if plan.steps.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new(BatchType::Logged);
        let mut batch_values = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            batch.append_statement(step.statement.sql.as_str());
            batch_values.push(values(&step.statement.params, &step.param_types));
        }
        tracing::debug!(steps = plan.steps.len(), "Applying CQL batch");
        session
            .batch(&batch, batch_values)
            .await
            .map_err(|e| DbError::rolled_back("batch", DbError::from(e)))?;
        Ok(())
    }

    pub async fn reselect(session: &Session, plan: &ChangePlan) -> DbResult<Vec<Row>> {
        let mut rows = Vec::with_capacity(plan.reselects.len());
        for (statement, types) in plan.reselects.iter().zip(&plan.reselect_types) {
            let result = session
                .query(statement.sql.as_str(), values(&statement.params, types))
                .await?;
            let names: Vec<String> = result.col_specs.iter().map(|s| s.name.clone()).collect();
            for row in result.rows.unwrap_or_default() {
                rows.push(
                    names
                        .iter()
                        .cloned()
                        .zip(row.columns.iter().map(|v| cql::to_json(v.as_ref())))
                        .collect(),
                );
            }
        }
        Ok(rows)
    }
}
