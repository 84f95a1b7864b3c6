//! Paged table reads for `select_top`.
//!
//! Builds the page statement and the matching `COUNT(*)` statement from a
//! [`SelectTopRequest`]. Structured predicates are always bound as
//! parameters; a raw filter string is inserted verbatim.

use serde_json::Value as JsonValue;

use crate::db::dialect::SqlDialect;
use crate::db::params::Statement;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, DatabaseType, FilterOperator, FilterPredicate, QueryParam, SelectFilter,
    SelectTopRequest,
};

/// Statements for one page.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectPlan {
    pub page: Statement,
    pub count: Statement,
    /// Rows the caller drops from the front of the page (dialects without
    /// `OFFSET`).
    pub skip: u64,
}

struct WhereClause {
    sql: String,
    params: Vec<QueryParam>,
}

fn column_type<'a>(columns: &'a [ColumnMetadata], name: &str) -> Option<&'a str> {
    columns
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.data_type.as_str())
}

fn in_values(value: &QueryParam) -> Vec<QueryParam> {
    match value {
        QueryParam::Json(JsonValue::Array(items)) => items.iter().map(QueryParam::from).collect(),
        QueryParam::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

fn build_where(
    dialect: &dyn SqlDialect,
    filter: &SelectFilter,
    columns: &[ColumnMetadata],
) -> DbResult<Option<WhereClause>> {
    let predicates: &[FilterPredicate] = match filter {
        SelectFilter::None => return Ok(None),
        SelectFilter::Raw(raw) if raw.trim().is_empty() => return Ok(None),
        SelectFilter::Raw(raw) => {
            return Ok(Some(WhereClause {
                sql: format!("WHERE ({})", raw),
                params: Vec::new(),
            }));
        }
        SelectFilter::Predicates(p) if p.is_empty() => return Ok(None),
        SelectFilter::Predicates(p) => p,
    };

    let mut params = Vec::new();
    let mut parts = Vec::with_capacity(predicates.len());
    for predicate in predicates {
        let field = dialect.wrap_identifier(&predicate.field);
        let ty = column_type(columns, &predicate.field);
        let mut marker = |param: QueryParam| {
            params.push(param);
            match ty {
                Some(ty) => dialect.typed_placeholder(params.len(), ty),
                None => dialect.placeholder(params.len()),
            }
        };
        let part = match predicate.operator {
            FilterOperator::IsNull | FilterOperator::IsNotNull => {
                format!("{} {}", field, predicate.operator.as_sql())
            }
            FilterOperator::In => {
                let values = in_values(&predicate.value);
                if values.is_empty() {
                    return Err(DbError::invalid_input(format!(
                        "IN filter on '{}' needs at least one value",
                        predicate.field
                    )));
                }
                let markers: Vec<String> = values.into_iter().map(&mut marker).collect();
                format!("{} IN ({})", field, markers.join(", "))
            }
            op => {
                let placeholder = marker(predicate.value.clone());
                format!("{} {} {}", field, op.as_sql(), placeholder)
            }
        };
        parts.push(part);
    }

    Ok(Some(WhereClause {
        sql: format!("WHERE {}", parts.join(" AND ")),
        params,
    }))
}

/// Build the page and count statements for `request`.
///
/// `columns` is the table's live metadata, used to cast placeholders on
/// dialects that need it; pass an empty slice when unknown.
pub fn build_select_top(
    dialect: &dyn SqlDialect,
    request: &SelectTopRequest,
    columns: &[ColumnMetadata],
) -> DbResult<SelectPlan> {
    if request.table.trim().is_empty() {
        return Err(DbError::invalid_input("table name is required"));
    }
    let table = dialect.qualify(request.schema.as_deref(), &request.table);
    let projection = if request.columns.is_empty() {
        "*".to_string()
    } else {
        request
            .columns
            .iter()
            .map(|c| dialect.wrap_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let is_cql = dialect.db_type() == DatabaseType::Cassandra;

    let filter = build_where(dialect, &request.filter, columns)?;
    let (where_sql, params) = match filter {
        Some(w) => (format!(" {}", w.sql), w.params),
        None => (String::new(), Vec::new()),
    };
    let allow_filtering = if is_cql && !where_sql.is_empty() {
        " ALLOW FILTERING"
    } else {
        ""
    };

    let mut page = format!("SELECT {} FROM {}{}", projection, table, where_sql);
    if !request.order_by.is_empty() {
        let order: Vec<String> = request
            .order_by
            .iter()
            .map(|o| format!("{} {}", dialect.wrap_identifier(&o.field), o.direction.as_sql()))
            .collect();
        page.push_str(" ORDER BY ");
        page.push_str(&order.join(", "));
    }
    let paging = dialect.limit_offset_sql(request.limit.map(u64::from), request.offset);
    if !paging.is_empty() {
        page.push(' ');
        page.push_str(&paging);
    }
    page.push_str(allow_filtering);

    let count = format!(
        "SELECT COUNT(*) AS total FROM {}{}{}",
        table, where_sql, allow_filtering
    );

    Ok(SelectPlan {
        page: Statement::new(page, params.clone()),
        count: Statement::new(count, params),
        skip: if is_cql { request.offset } else { 0 },
    })
}

/// Convert a count column to `u64`; drivers report it as integer or text.
pub(crate) fn count_value(value: Option<&JsonValue>) -> u64 {
    match value {
        Some(JsonValue::Number(n)) => n.as_u64().unwrap_or_default(),
        Some(JsonValue::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}
