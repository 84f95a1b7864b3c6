//! Query requests, parameters and normalized results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Default query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u32 = 30;

/// Maximum query timeout in seconds.
pub const MAX_QUERY_TIMEOUT_SECS: u32 = 3600;

/// Default page size for `select_top`.
pub const DEFAULT_SELECT_LIMIT: u32 = 100;

/// Default chunk size for streaming cursors.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// A normalized row: column key to JSON value.
pub type Row = Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Arrays and objects
    Json(JsonValue),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Json(_) => "json",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Text form used when a dialect needs the value cast server-side.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(v.to_string()),
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::String(v) => Some(v.clone()),
            Self::Json(v) => Some(v.to_string()),
            Self::Bytes(v) => Some(String::from_utf8_lossy(v).into_owned()),
        }
    }
}

impl From<&JsonValue> for QueryParam {
    fn from(value: &JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            JsonValue::String(s) => Self::String(s.clone()),
            other => Self::Json(other.clone()),
        }
    }
}

impl From<i64> for QueryParam {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for QueryParam {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// How result rows are keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowMode {
    /// Keyed by column name; a later duplicate name overwrites an earlier one.
    #[default]
    Object,
    /// Keyed by position as `c0`, `c1`, ...
    Array,
}

/// Descriptor of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultField {
    /// Key of this column inside each row.
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl ResultField {
    pub fn new(name: impl Into<String>, data_type: Option<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            data_type,
        }
    }

    /// Synthetic positional key used by [`RowMode::Array`].
    pub fn positional_id(index: usize) -> String {
        format!("c{}", index)
    }
}

/// Result of one statement.
///
/// Exactly one of `row_count` / `affected_rows` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub command: String,
    pub fields: Vec<ResultField>,
    pub rows: Vec<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
}

impl QueryResult {
    pub fn with_rows(command: impl Into<String>, fields: Vec<ResultField>, rows: Vec<Row>) -> Self {
        let count = rows.len() as u64;
        Self {
            command: command.into(),
            fields,
            rows,
            row_count: Some(count),
            affected_rows: None,
        }
    }

    pub fn with_affected(command: impl Into<String>, affected_rows: u64) -> Self {
        Self {
            command: command.into(),
            fields: Vec::new(),
            rows: Vec::new(),
            row_count: None,
            affected_rows: Some(affected_rows),
        }
    }
}

/// Knobs for `execute_query`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExecuteOptions {
    #[serde(default)]
    pub row_mode: RowMode,
    /// Falls back to the client's default when absent.
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

impl ExecuteOptions {
    pub fn array_mode() -> Self {
        Self {
            row_mode: RowMode::Array,
            timeout_secs: None,
        }
    }

    pub fn effective_timeout(&self, default_secs: u32) -> u32 {
        self.timeout_secs
            .map(|t| t.min(MAX_QUERY_TIMEOUT_SECS))
            .unwrap_or(default_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

/// Comparison allowed in a structured filter predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "<>", alias = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "NOT LIKE", alias = "not like")]
    NotLike,
    #[serde(rename = "IN", alias = "in")]
    In,
    #[serde(rename = "IS NULL", alias = "is null")]
    IsNull,
    #[serde(rename = "IS NOT NULL", alias = "is not null")]
    IsNotNull,
}

impl FilterOperator {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "<>",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Like => "LIKE",
            Self::NotLike => "NOT LIKE",
            Self::In => "IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterPredicate {
    pub field: String,
    #[serde(rename = "type", alias = "operator")]
    pub operator: FilterOperator,
    /// Ignored by `IS NULL` / `IS NOT NULL`; a JSON array for `IN`.
    #[serde(default = "null_param")]
    pub value: QueryParam,
}

fn null_param() -> QueryParam {
    QueryParam::Null
}

impl FilterPredicate {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: QueryParam) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }
}

/// The three accepted filter forms of `select_top`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectFilter {
    #[default]
    None,
    /// ANDed, always parameterized.
    Predicates(Vec<FilterPredicate>),
    /// Inserted verbatim into the WHERE clause.
    Raw(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectTopRequest {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub offset: u64,
    /// Page size; `None` reads every matching row.
    #[serde(default = "default_select_limit")]
    pub limit: Option<u32>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub filter: SelectFilter,
    /// Projected columns; every column when empty.
    #[serde(default)]
    pub columns: Vec<String>,
}

fn default_select_limit() -> Option<u32> {
    Some(DEFAULT_SELECT_LIMIT)
}

impl SelectTopRequest {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            schema: None,
            offset: 0,
            limit: Some(DEFAULT_SELECT_LIMIT),
            order_by: Vec::new(),
            filter: SelectFilter::None,
            columns: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_page(mut self, offset: u64, limit: u32) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Drop the page size, e.g. to stream a whole table.
    pub fn unbounded(mut self) -> Self {
        self.limit = None;
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_filter(mut self, filter: SelectFilter) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectTopResult {
    pub fields: Vec<ResultField>,
    pub rows: Vec<Row>,
    pub total_records: u64,
}
