//! Row normalization: driver rows to JSON values keyed by field.
//!
//! Decoding is two-phase. [`categorize_type`] sorts the column's type name
//! into a [`TypeCategory`], then the dialect decoder extracts the value. A
//! value that no typed decoder accepts falls back to its text form, so
//! exotic types (intervals, ranges, enums, inet) still come through.

use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as _, Type, TypeInfo};

use crate::models::{DatabaseType, ResultField, Row, RowMode};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Bit,
    Temporal,
    Text,
    Binary,
    Json,
    Uuid,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores floats
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower == "bit" || lower.starts_with("bit(") || lower == "varbit" || lower.starts_with("bit varying") {
        return TypeCategory::Bit;
    }
    if lower.contains("int") && !lower.contains("interval") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower == "uuid" {
        return TypeCategory::Uuid;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    if matches!(
        lower.as_str(),
        "date" | "time" | "timetz" | "timestamp" | "timestamptz" | "datetime"
    ) {
        return TypeCategory::Temporal;
    }
    if lower.contains("char") || lower == "text" || lower == "name" {
        return TypeCategory::Text;
    }
    TypeCategory::Unknown
}

/// Wrapper type for raw DECIMAL/NUMERIC values as strings, keeping exact precision.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        // DECIMAL travels as text in both MySQL protocols
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("numeric")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => pg_numeric_from_binary(value.as_bytes()?)
                .map(RawDecimal)
                .ok_or_else(|| "malformed binary numeric".into()),
        }
    }
}

/// Render PostgreSQL's binary NUMERIC (base-10000 digit groups) as text.
pub(crate) fn pg_numeric_from_binary(buf: &[u8]) -> Option<String> {
    if buf.len() < 8 {
        return None;
    }
    let word = |i: usize| i16::from_be_bytes([buf[i], buf[i + 1]]);
    let ndigits = usize::try_from(word(0)).ok()?;
    let weight = i32::from(word(2));
    let sign = u16::from_be_bytes([buf[4], buf[5]]);
    let dscale = usize::from(u16::from_be_bytes([buf[6], buf[7]]));

    if sign == 0xC000 {
        return Some("NaN".to_string());
    }
    if buf.len() < 8 + 2 * ndigits {
        return None;
    }
    let group = |i: i32| -> i16 {
        usize::try_from(i)
            .ok()
            .filter(|&i| i < ndigits)
            .map(|i| word(8 + 2 * i))
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&group(i).to_string());
            } else {
                out.push_str(&format!("{:04}", group(i)));
            }
        }
    }
    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while frac.len() < dscale {
            frac.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        frac.truncate(dscale);
        out.push('.');
        out.push_str(&frac);
    }
    Some(out)
}

/// Base64 for binary columns.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Driver rows that can be normalized.
pub trait NormalizeRow {
    /// Column descriptors keyed by name.
    fn fields(&self) -> Vec<ResultField>;

    /// Column values in column order.
    fn values(&self) -> Vec<JsonValue>;

    /// Name-keyed object, the shape cursors and re-selects return.
    fn to_object(&self) -> Row {
        let fields = self.fields();
        shape_row(&fields, self.values())
    }
}

/// Re-key field descriptors for the requested row mode.
pub fn shape_fields(mut fields: Vec<ResultField>, mode: RowMode) -> Vec<ResultField> {
    if mode == RowMode::Array {
        for (i, field) in fields.iter_mut().enumerate() {
            field.id = ResultField::positional_id(i);
        }
    }
    fields
}

/// Pair values with the ids of already-shaped fields.
pub fn shape_row(fields: &[ResultField], values: Vec<JsonValue>) -> Row {
    fields
        .iter()
        .zip(values)
        .map(|(field, value)| (field.id.clone(), value))
        .collect()
}

macro_rules! impl_normalize_row {
    ($row:ty, $db:expr, $decoder:path) => {
        impl NormalizeRow for $row {
            fn fields(&self) -> Vec<ResultField> {
                self.columns()
                    .iter()
                    .map(|col| ResultField::new(col.name(), Some(col.type_info().name().to_string())))
                    .collect()
            }

            fn values(&self) -> Vec<JsonValue> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        $decoder(self, idx, type_name, categorize_type(type_name, $db))
                    })
                    .collect()
            }
        }
    };
}

impl_normalize_row!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_normalize_row!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_normalize_row!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

mod mysql {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        match category {
            TypeCategory::Decimal => match row.try_get::<Option<RawDecimal>, _>(idx) {
                Ok(Some(v)) => JsonValue::String(v.0),
                Ok(None) => JsonValue::Null,
                Err(e) => {
                    tracing::warn!(error = ?e, "Failed to decode DECIMAL");
                    JsonValue::Null
                }
            },
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => {
                if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                    return v.map(float_value).unwrap_or(JsonValue::Null);
                }
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| float_value(f64::from(v)))
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Bit => row
                .try_get_unchecked::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|bytes| JsonValue::Number(bits_to_u64(&bytes).into()))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            _ => decode_text(row, idx, type_name),
        }
    }

    fn decode_integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
            return v.map(|v| JsonValue::Number(v.into())).unwrap_or(JsonValue::Null);
        }
        // narrower declared types (TINYINT(1), YEAR)
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return JsonValue::Number(v.into());
        }
        JsonValue::Null
    }

    fn decode_temporal(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        let decoded = match type_name.to_uppercase().as_str() {
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)
                .map(|v| v.map(|d| d.to_string())),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(idx)
                .map(|v| v.map(|t| t.to_string())),
            "TIMESTAMP" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)
                .map(|v| v.map(|t| t.to_rfc3339())),
            _ => row
                .try_get::<Option<NaiveDateTime>, _>(idx)
                .map(|v| v.map(|t| t.to_string())),
        };
        match decoded {
            Ok(v) => v.map(JsonValue::String).unwrap_or(JsonValue::Null),
            // zero dates and negative TIME values only survive as text
            Err(_) => decode_text(row, idx, type_name),
        }
    }

    fn decode_text(row: &MySqlRow, idx: usize, type_name: &str) -> JsonValue {
        let text = row
            .try_get::<Option<String>, _>(idx)
            .or_else(|_| row.try_get_unchecked::<Option<String>, _>(idx));
        match text {
            Ok(Some(v)) => {
                if type_name.to_lowercase().contains("json") {
                    if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                        return json;
                    }
                }
                JsonValue::String(v)
            }
            _ => JsonValue::Null,
        }
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        let typed = match category {
            TypeCategory::Decimal => row
                .try_get::<Option<RawDecimal>, _>(idx)
                .map(|v| v.map(|d| JsonValue::String(d.0))),
            TypeCategory::Integer => decode_integer(row, idx),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .map(|v| v.map(JsonValue::Bool)),
            TypeCategory::Float => row
                .try_get::<Option<f64>, _>(idx)
                .or_else(|_| row.try_get::<Option<f32>, _>(idx).map(|v| v.map(f64::from)))
                .map(|v| v.map(float_value)),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .map(|v| v.map(|b| encode_binary(&b))),
            TypeCategory::Json => row.try_get::<Option<JsonValue>, _>(idx),
            TypeCategory::Uuid => row
                .try_get::<Option<uuid::Uuid>, _>(idx)
                .map(|v| v.map(|u| JsonValue::String(u.to_string()))),
            TypeCategory::Temporal => decode_temporal(row, idx, type_name),
            TypeCategory::Text => row
                .try_get::<Option<String>, _>(idx)
                .map(|v| v.map(JsonValue::String)),
            TypeCategory::Bit | TypeCategory::Unknown => return decode_as_text(row, idx),
        };
        match typed {
            Ok(v) => v.unwrap_or(JsonValue::Null),
            Err(_) => decode_as_text(row, idx),
        }
    }

    fn decode_integer(row: &PgRow, idx: usize) -> Result<Option<JsonValue>, sqlx::Error> {
        if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
            return Ok(v.map(|v| JsonValue::Number(v.into())));
        }
        if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
            return Ok(v.map(|v| JsonValue::Number(v.into())));
        }
        row.try_get::<Option<i16>, _>(idx)
            .map(|v| v.map(|v| JsonValue::Number(v.into())))
    }

    fn decode_temporal(
        row: &PgRow,
        idx: usize,
        type_name: &str,
    ) -> Result<Option<JsonValue>, sqlx::Error> {
        let text = match type_name.to_uppercase().as_str() {
            "DATE" => row
                .try_get::<Option<NaiveDate>, _>(idx)?
                .map(|d| d.to_string()),
            "TIME" => row
                .try_get::<Option<NaiveTime>, _>(idx)?
                .map(|t| t.to_string()),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(idx)?
                .map(|t| t.to_rfc3339()),
            "TIMESTAMP" => row
                .try_get::<Option<NaiveDateTime>, _>(idx)?
                .map(|t| t.to_string()),
            _ => return Ok(Some(decode_as_text(row, idx))),
        };
        Ok(text.map(JsonValue::String))
    }

    /// Text-format values (simple query protocol) of any type.
    fn decode_as_text(row: &PgRow, idx: usize) -> JsonValue {
        use sqlx::ValueRef;
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        match raw.format() {
            PgValueFormat::Text => raw
                .as_str()
                .map(|s| JsonValue::String(s.to_string()))
                .unwrap_or(JsonValue::Null),
            PgValueFormat::Binary => raw
                .as_bytes()
                .ok()
                .map(|b| match std::str::from_utf8(b) {
                    Ok(s) if !s.contains('\0') => JsonValue::String(s.to_string()),
                    _ => encode_binary(b),
                })
                .unwrap_or(JsonValue::Null),
        }
    }
}

mod sqlite {
    use super::*;
    use sqlx::ValueRef;

    /// Declared type picks the decoder; the value's storage class is the fallback.
    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> JsonValue {
        let Ok(raw) = row.try_get_raw(idx) else {
            return JsonValue::Null;
        };
        if raw.is_null() {
            return JsonValue::Null;
        }
        let storage = raw.type_info().name().to_uppercase();

        if category == TypeCategory::Boolean {
            if let Ok(Some(v)) = row.try_get::<Option<bool>, _>(idx) {
                return JsonValue::Bool(v);
            }
        }

        match storage.as_str() {
            "INTEGER" => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(|v| JsonValue::Number(v.into()))
                .unwrap_or(JsonValue::Null),
            "REAL" => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            "BLOB" => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary(&v))
                .unwrap_or(JsonValue::Null),
            _ => match row.try_get_unchecked::<Option<String>, _>(idx) {
                Ok(Some(v)) => {
                    if category == TypeCategory::Json || type_name.to_lowercase().contains("json") {
                        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                            return json;
                        }
                    }
                    JsonValue::String(v)
                }
                _ => JsonValue::Null,
            },
        }
    }
}

/// Fold big-endian BIT bytes into an integer.
pub(crate) fn bits_to_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

pub(crate) mod cql {
    use scylla::frame::response::result::{ColumnType, CqlValue};
    use serde_json::{Map, Value as JsonValue};

    use super::{encode_binary, float_value};

    /// Lowercase CQL name of a column type (`int`, `text`, `timeuuid`).
    pub fn type_name(typ: &ColumnType) -> String {
        match typ {
            ColumnType::Custom(name) => name.to_string(),
            other => format!("{:?}", other).to_lowercase(),
        }
    }

    /// CQL value to JSON; collections and UDTs nest.
    pub fn to_json(value: Option<&CqlValue>) -> JsonValue {
        let Some(value) = value else {
            return JsonValue::Null;
        };
        match value {
            CqlValue::Ascii(s) | CqlValue::Text(s) => JsonValue::String(s.clone()),
            CqlValue::Boolean(b) => JsonValue::Bool(*b),
            CqlValue::TinyInt(v) => JsonValue::Number((*v).into()),
            CqlValue::SmallInt(v) => JsonValue::Number((*v).into()),
            CqlValue::Int(v) => JsonValue::Number((*v).into()),
            CqlValue::BigInt(v) => JsonValue::Number((*v).into()),
            CqlValue::Float(v) => float_value(f64::from(*v)),
            CqlValue::Double(v) => float_value(*v),
            CqlValue::Blob(b) => encode_binary(b),
            CqlValue::Uuid(u) => JsonValue::String(u.to_string()),
            CqlValue::Inet(ip) => JsonValue::String(ip.to_string()),
            CqlValue::Empty => JsonValue::Null,
            CqlValue::List(items) | CqlValue::Set(items) => {
                JsonValue::Array(items.iter().map(|v| to_json(Some(v))).collect())
            }
            CqlValue::Map(pairs) => {
                let object: Map<String, JsonValue> = pairs
                    .iter()
                    .map(|(k, v)| (key_text(k), to_json(Some(v))))
                    .collect();
                JsonValue::Object(object)
            }
            CqlValue::Tuple(items) => {
                JsonValue::Array(items.iter().map(|v| to_json(v.as_ref())).collect())
            }
            CqlValue::UserDefinedType { fields, .. } => JsonValue::Object(
                fields
                    .iter()
                    .map(|(name, v)| (name.clone(), to_json(v.as_ref())))
                    .collect(),
            ),
            // counters, varints, decimals, dates, times, timestamps, durations, timeuuids
            other => JsonValue::String(format!("{:?}", other)),
        }
    }

    fn key_text(key: &CqlValue) -> String {
        match to_json(Some(key)) {
            JsonValue::String(s) => s,
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(categorize_type("INT", DatabaseType::MySQL), TypeCategory::Integer);
        assert_eq!(categorize_type("SERIAL", DatabaseType::PostgreSQL), TypeCategory::Integer);
        assert_eq!(categorize_type("INTERVAL", DatabaseType::PostgreSQL), TypeCategory::Unknown);
        assert_eq!(categorize_type("NUMERIC", DatabaseType::PostgreSQL), TypeCategory::Decimal);
        assert_eq!(categorize_type("numeric", DatabaseType::SQLite), TypeCategory::Float);
        assert_eq!(categorize_type("BIT", DatabaseType::MySQL), TypeCategory::Bit);
        assert_eq!(categorize_type("VARBIT", DatabaseType::PostgreSQL), TypeCategory::Bit);
        assert_eq!(categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL), TypeCategory::Temporal);
        assert_eq!(categorize_type("jsonb", DatabaseType::PostgreSQL), TypeCategory::Json);
        assert_eq!(categorize_type("VARCHAR", DatabaseType::MySQL), TypeCategory::Text);
    }

    #[test]
    fn test_pg_numeric_binary() {
        // 123.45: weight 0, groups [123, 4500], dscale 2
        let buf = [0, 2, 0, 0, 0, 0, 0, 2, 0, 123, 0x11, 0x94];
        assert_eq!(pg_numeric_from_binary(&buf).as_deref(), Some("123.45"));

        // -0.5: weight -1, groups [5000], dscale 1
        let buf = [0, 1, 0xFF, 0xFF, 0x40, 0, 0, 1, 0x13, 0x88];
        assert_eq!(pg_numeric_from_binary(&buf).as_deref(), Some("-0.5"));

        // 10000: weight 1, groups [1], dscale 0
        let buf = [0, 1, 0, 1, 0, 0, 0, 0, 0, 1];
        assert_eq!(pg_numeric_from_binary(&buf).as_deref(), Some("10000"));

        let nan = [0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert_eq!(pg_numeric_from_binary(&nan).as_deref(), Some("NaN"));
        assert_eq!(pg_numeric_from_binary(&[0, 1]), None);
    }

    #[test]
    fn test_bits_to_u64() {
        assert_eq!(bits_to_u64(&[1]), 1);
        assert_eq!(bits_to_u64(&[0b0000_0001, 0b0000_0010]), 258);
        assert_eq!(bits_to_u64(&[]), 0);
    }

    #[test]
    fn test_array_mode_survives_duplicate_names() {
        let fields = vec![
            ResultField::new("id", None),
            ResultField::new("id", None),
        ];
        let shaped = shape_fields(fields.clone(), RowMode::Array);
        assert_eq!(shaped[0].id, "c0");
        assert_eq!(shaped[1].id, "c1");
        assert_eq!(shaped[1].name, "id");

        let row = shape_row(&shaped, vec![JsonValue::from(1), JsonValue::from(2)]);
        assert_eq!(row.len(), 2);
        assert_eq!(row["c1"], JsonValue::from(2));

        let object = shape_row(&shape_fields(fields, RowMode::Object), vec![1.into(), 2.into()]);
        assert_eq!(object.len(), 1);
    }

    #[test]
    fn test_encode_binary() {
        assert_eq!(encode_binary(b"hello world"), JsonValue::String("aGVsbG8gd29ybGQ=".into()));
    }

    #[test]
    fn test_cql_collections() {
        use scylla::frame::response::result::CqlValue;
        let list = CqlValue::List(vec![CqlValue::Int(1), CqlValue::Text("a".into())]);
        assert_eq!(cql::to_json(Some(&list)), serde_json::json!([1, "a"]));
        let map = CqlValue::Map(vec![(CqlValue::Int(7), CqlValue::Boolean(true))]);
        assert_eq!(cql::to_json(Some(&map)), serde_json::json!({ "7": true }));
        assert_eq!(cql::to_json(None), JsonValue::Null);
    }
}
