//! Parameter binding for generated statements.
//!
//! Builders produce a [`Statement`] (text plus ordered [`QueryParam`]s); the
//! `bind_*` functions attach those parameters to a dialect's query object.

use crate::models::QueryParam;
use scylla::frame::response::result::CqlValue;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Statement text with its bind parameters in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<QueryParam>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Json(v) => query.bind(Json(v)),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        // SQLite doesn't have native JSON type, store as string
        QueryParam::Json(v) => query.bind(v.to_string()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

pub(crate) fn bind_mysql<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    params.iter().fold(query, bind_mysql_param)
}

pub(crate) fn bind_postgres<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    params.iter().fold(query, bind_postgres_param)
}

pub(crate) fn bind_sqlite<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [QueryParam],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    params.iter().fold(query, bind_sqlite_param)
}

/// Convert a parameter to the CQL value a column of `cql_type` accepts.
///
/// CQL serialization is strict about widths, so integers are narrowed to the
/// declared type. Values that cannot be represented are sent as text and left
/// for the server to reject.
pub(crate) fn to_cql(param: &QueryParam, cql_type: Option<&str>) -> Option<CqlValue> {
    let ty = cql_type.map(|t| t.trim().to_lowercase()).unwrap_or_default();
    let value = match param {
        QueryParam::Null => return None,
        QueryParam::Bool(v) => CqlValue::Boolean(*v),
        QueryParam::Int(v) => match ty.as_str() {
            "int" => i32::try_from(*v).map(CqlValue::Int).unwrap_or(CqlValue::BigInt(*v)),
            "smallint" => i16::try_from(*v)
                .map(CqlValue::SmallInt)
                .unwrap_or(CqlValue::BigInt(*v)),
            "tinyint" => i8::try_from(*v)
                .map(CqlValue::TinyInt)
                .unwrap_or(CqlValue::BigInt(*v)),
            "double" => CqlValue::Double(*v as f64),
            "float" => CqlValue::Float(*v as f32),
            "text" | "varchar" => CqlValue::Text(v.to_string()),
            _ => CqlValue::BigInt(*v),
        },
        QueryParam::Float(v) => match ty.as_str() {
            "float" => CqlValue::Float(*v as f32),
            _ => CqlValue::Double(*v),
        },
        QueryParam::String(s) => match ty.as_str() {
            "uuid" | "timeuuid" => match uuid::Uuid::parse_str(s) {
                Ok(u) if ty == "uuid" => CqlValue::Uuid(u),
                _ => CqlValue::Text(s.clone()),
            },
            "ascii" => CqlValue::Ascii(s.clone()),
            "int" => s
                .parse::<i32>()
                .map(CqlValue::Int)
                .unwrap_or_else(|_| CqlValue::Text(s.clone())),
            "bigint" | "counter" => s
                .parse::<i64>()
                .map(CqlValue::BigInt)
                .unwrap_or_else(|_| CqlValue::Text(s.clone())),
            "boolean" => match s.to_lowercase().as_str() {
                "true" | "1" => CqlValue::Boolean(true),
                "false" | "0" => CqlValue::Boolean(false),
                _ => CqlValue::Text(s.clone()),
            },
            _ => CqlValue::Text(s.clone()),
        },
        QueryParam::Json(v) => CqlValue::Text(v.to_string()),
        QueryParam::Bytes(v) => CqlValue::Blob(v.clone()),
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_cql_narrows_integers() {
        assert_eq!(to_cql(&QueryParam::Int(5), Some("int")), Some(CqlValue::Int(5)));
        assert_eq!(to_cql(&QueryParam::Int(5), Some("bigint")), Some(CqlValue::BigInt(5)));
        assert_eq!(to_cql(&QueryParam::Int(5), None), Some(CqlValue::BigInt(5)));
        assert_eq!(
            to_cql(&QueryParam::Int(i64::MAX), Some("int")),
            Some(CqlValue::BigInt(i64::MAX))
        );
    }

    #[test]
    fn test_to_cql_parses_text_for_typed_columns() {
        let id = "1b4e28ba-2fa1-11d2-883f-0016d3cca427";
        assert!(matches!(
            to_cql(&QueryParam::String(id.into()), Some("uuid")),
            Some(CqlValue::Uuid(_))
        ));
        assert_eq!(
            to_cql(&QueryParam::String("42".into()), Some("int")),
            Some(CqlValue::Int(42))
        );
        assert_eq!(to_cql(&QueryParam::Null, Some("int")), None);
    }
}
