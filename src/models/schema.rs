//! Normalized catalog records shared by every dialect.

use serde::{Deserialize, Serialize};

/// Kind of relation returned by the table/view listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
    MaterializedView,
}

impl TableType {
    /// Parse a catalog type string; unknown kinds count as tables.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "view" | "system view" => Self::View,
            "materialized view" | "matview" | "m" => Self::MaterializedView,
            _ => Self::Table,
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => write!(f, "table"),
            Self::View => write!(f, "view"),
            Self::MaterializedView => write!(f, "materialized_view"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
    pub entity_type: TableType,
}

impl TableMetadata {
    pub fn new(schema: Option<String>, name: impl Into<String>, entity_type: TableType) -> Self {
        Self {
            schema,
            name: name.into(),
            entity_type,
        }
    }
}

/// Narrows the table/view/routine listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub schema: Option<String>,
    /// Keep only these names when non-empty.
    #[serde(default)]
    pub only: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl ListFilter {
    pub fn schema(schema: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            ..Self::default()
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        (self.only.is_empty() || self.only.iter().any(|n| n == name))
            && !self.ignore.iter().any(|n| n == name)
    }

    pub fn retain<T>(&self, items: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
        items.into_iter().filter(|item| self.accepts(name(item))).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub table_name: String,
    pub name: String,
    /// Full catalog type (e.g., `varchar(30)`, `bit(1)`, `timestamp without time zone`)
    pub data_type: String,
    pub nullable: bool,
    /// Default expression as the catalog spells it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    /// Catalog ordinal, unchanged (SQLite `cid` is zero-based)
    pub ordinal: u32,
    pub generated: bool,
    pub is_primary_key: bool,
    /// MySQL only (e.g., `auto_increment`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl ColumnMetadata {
    pub fn new(
        table_name: impl Into<String>,
        name: impl Into<String>,
        data_type: impl Into<String>,
        ordinal: u32,
    ) -> Self {
        Self {
            schema: None,
            table_name: table_name.into(),
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            default_value: None,
            ordinal,
            generated: false,
            is_primary_key: false,
            extra: None,
        }
    }

    pub fn with_schema(mut self, schema: Option<String>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_default(mut self, default_value: Option<String>) -> Self {
        self.default_value = default_value;
        self
    }

    pub fn with_generated(mut self, generated: bool) -> Self {
        self.generated = generated;
        self
    }

    pub fn with_primary_key(mut self, is_pk: bool) -> Self {
        self.is_primary_key = is_pk;
        self
    }

    pub fn with_extra(mut self, extra: Option<String>) -> Self {
        self.extra = extra.filter(|e| !e.is_empty());
        self
    }
}

/// Foreign key referential action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignKeyAction {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyAction {
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "CASCADE" => Self::Cascade,
            "SET NULL" => Self::SetNull,
            "SET DEFAULT" => Self::SetDefault,
            "RESTRICT" => Self::Restrict,
            _ => Self::NoAction,
        }
    }
}

impl std::fmt::Display for ForeignKeyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => write!(f, "NO ACTION"),
            Self::Restrict => write!(f, "RESTRICT"),
            Self::Cascade => write!(f, "CASCADE"),
            Self::SetNull => write!(f, "SET NULL"),
            Self::SetDefault => write!(f, "SET DEFAULT"),
        }
    }
}

/// One column pair of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraint_name: Option<String>,
    pub from_table: String,
    pub from_column: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_schema: Option<String>,
    pub to_table: String,
    pub to_column: String,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub primary: bool,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            unique: false,
            primary: false,
        }
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// A primary index is always unique.
    pub fn with_primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        if primary {
            self.unique = true;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKeyColumn {
    pub column_name: String,
    /// 1-based position inside the key
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineType {
    Function,
    Procedure,
}

impl RoutineType {
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("procedure") || s == "p" {
            Self::Procedure
        } else {
            Self::Function
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Function => "FUNCTION",
            Self::Procedure => "PROCEDURE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
    pub routine_type: RoutineType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

/// Live shape of a table, input to the schema change builder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableShape {
    pub columns: Vec<ColumnMetadata>,
    pub keys: Vec<KeyMetadata>,
    pub indexes: Vec<IndexMetadata>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_type_parsing() {
        assert_eq!(TableType::parse("BASE TABLE"), TableType::Table);
        assert_eq!(TableType::parse("VIEW"), TableType::View);
        assert_eq!(TableType::parse("materialized view"), TableType::MaterializedView);
        assert_eq!(TableType::parse("something"), TableType::Table);
    }

    #[test]
    fn test_list_filter() {
        let filter = ListFilter {
            schema: None,
            only: vec![],
            ignore: vec!["secrets".into()],
        };
        assert!(filter.accepts("users"));
        assert!(!filter.accepts("secrets"));

        let only = ListFilter {
            only: vec!["users".into()],
            ..ListFilter::default()
        };
        let kept = only.retain(vec!["users", "roles"], |n| n);
        assert_eq!(kept, vec!["users"]);
    }

    #[test]
    fn test_primary_index_is_unique() {
        let idx = IndexMetadata::new("pk", vec!["id".into()]).with_primary(true);
        assert!(idx.unique);
        assert!(idx.primary);
    }

    #[test]
    fn test_foreign_key_action_parse() {
        assert_eq!(ForeignKeyAction::parse("cascade"), ForeignKeyAction::Cascade);
        assert_eq!(ForeignKeyAction::parse("SET NULL"), ForeignKeyAction::SetNull);
        assert_eq!(ForeignKeyAction::parse("whatever"), ForeignKeyAction::NoAction);
        assert_eq!(ForeignKeyAction::SetDefault.to_string(), "SET DEFAULT");
    }

    #[test]
    fn test_routine_type_parse() {
        assert_eq!(RoutineType::parse("PROCEDURE"), RoutineType::Procedure);
        assert_eq!(RoutineType::parse("f"), RoutineType::Function);
    }
}
