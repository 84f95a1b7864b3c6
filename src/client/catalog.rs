//! Reading catalog rows.
//!
//! Catalog queries come back as normalized JSON rows. Depending on the
//! protocol a driver used, flags and numbers may arrive as booleans,
//! integers or text, so these helpers accept all of them.

use serde_json::Value as JsonValue;

use crate::models::{ColumnMetadata, Row};

pub(crate) fn text(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn number(row: &Row, key: &str) -> Option<i64> {
    match row.get(key)? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub(crate) fn flag(row: &Row, key: &str) -> bool {
    match row.get(key) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(JsonValue::String(s)) => matches!(
            s.to_ascii_lowercase().as_str(),
            "t" | "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

/// `key` of the first row, if any.
pub(crate) fn text_at(rows: &[Row], key: &str) -> Option<String> {
    rows.first().and_then(|row| text(row, key))
}

/// Text of the first column, for single-value queries.
pub(crate) fn first_text(rows: &[Row]) -> Option<String> {
    rows.first()?.values().next().and_then(|v| match v {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    })
}

/// Parse a row of the shared column listing layout: `table_schema`,
/// `table_name`, `column_name`, `data_type`, `is_nullable`, `column_default`,
/// `ordinal_position`, `generated`, `is_primary_key`, `extra`.
pub(crate) fn column_from_row(row: &Row) -> Option<ColumnMetadata> {
    let table = text(row, "table_name")?;
    let name = text(row, "column_name")?;
    let data_type = text(row, "data_type").unwrap_or_default();
    let ordinal = number(row, "ordinal_position")
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or_default();
    Some(
        ColumnMetadata::new(table, name, data_type, ordinal)
            .with_schema(text(row, "table_schema"))
            .with_nullable(flag(row, "is_nullable"))
            .with_default(text(row, "column_default"))
            .with_generated(flag(row, "generated"))
            .with_primary_key(flag(row, "is_primary_key"))
            .with_extra(text(row, "extra")),
    )
}

/// Split a comma-joined aggregate into names.
pub(crate) fn name_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: JsonValue) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_flags_from_any_protocol() {
        let r = row(json!({"a": true, "b": 1, "c": "t", "d": "YES", "e": "NO", "f": null}));
        assert!(flag(&r, "a"));
        assert!(flag(&r, "b"));
        assert!(flag(&r, "c"));
        assert!(flag(&r, "d"));
        assert!(!flag(&r, "e"));
        assert!(!flag(&r, "f"));
        assert!(!flag(&r, "missing"));
    }

    #[test]
    fn test_column_row() {
        let r = row(json!({
            "table_schema": "public",
            "table_name": "users",
            "column_name": "id",
            "data_type": "integer",
            "is_nullable": "NO",
            "column_default": "nextval('users_id_seq'::regclass)",
            "ordinal_position": "1",
            "generated": false,
            "is_primary_key": "t",
            "extra": null
        }));
        let column = column_from_row(&r).unwrap();
        assert_eq!(column.schema.as_deref(), Some("public"));
        assert_eq!(column.ordinal, 1);
        assert!(!column.nullable);
        assert!(column.is_primary_key);
        assert!(column.default_value.is_some());
        assert_eq!(column.extra, None);
    }

    #[test]
    fn test_name_list() {
        assert_eq!(name_list("a, b,,c"), vec!["a", "b", "c"]);
        assert!(name_list("").is_empty());
    }
}
