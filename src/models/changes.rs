//! Change bundles and table alterations submitted by callers.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::query::Row;

/// One `column = value` predicate that addresses a row by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub column: String,
    pub value: JsonValue,
}

/// Rows to insert into one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertChange {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub data: Vec<Row>,
}

/// Sets one column of one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChange {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub column: String,
    #[serde(default)]
    pub pk_column: Option<String>,
    #[serde(default)]
    pub primary_key: Option<JsonValue>,
    /// Composite keys; ANDed with `pk_column`/`primary_key` when both are given.
    #[serde(default)]
    pub primary_keys: Vec<KeyValue>,
    pub value: JsonValue,
    /// Caller's view of the column type; the live catalog wins when present.
    #[serde(default)]
    pub column_type: Option<String>,
}

/// Deletes one row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteChange {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub pk_column: Option<String>,
    #[serde(default)]
    pub primary_key: Option<JsonValue>,
    #[serde(default)]
    pub primary_keys: Vec<KeyValue>,
}

fn key_predicates(
    pk_column: &Option<String>,
    primary_key: &Option<JsonValue>,
    primary_keys: &[KeyValue],
) -> Vec<KeyValue> {
    let mut keys = Vec::with_capacity(primary_keys.len() + 1);
    if let (Some(column), Some(value)) = (pk_column, primary_key) {
        keys.push(KeyValue {
            column: column.clone(),
            value: value.clone(),
        });
    }
    keys.extend(primary_keys.iter().cloned());
    keys
}

impl UpdateChange {
    pub fn key_predicates(&self) -> Vec<KeyValue> {
        key_predicates(&self.pk_column, &self.primary_key, &self.primary_keys)
    }
}

impl DeleteChange {
    pub fn key_predicates(&self) -> Vec<KeyValue> {
        key_predicates(&self.pk_column, &self.primary_key, &self.primary_keys)
    }
}

/// Inserts, updates and deletes that commit or roll back together.
///
/// Applied in the fixed order inserts, updates, deletes regardless of how the
/// caller listed them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableChangeBundle {
    #[serde(default)]
    pub inserts: Vec<InsertChange>,
    #[serde(default)]
    pub updates: Vec<UpdateChange>,
    #[serde(default)]
    pub deletes: Vec<DeleteChange>,
}

impl TableChangeBundle {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Distinct `(schema, table)` pairs touched by the bundle.
    pub fn tables(&self) -> Vec<(Option<String>, String)> {
        let mut seen: Vec<(Option<String>, String)> = Vec::new();
        let all = self
            .inserts
            .iter()
            .map(|c| (&c.schema, &c.table))
            .chain(self.updates.iter().map(|c| (&c.schema, &c.table)))
            .chain(self.deletes.iter().map(|c| (&c.schema, &c.table)));
        for (schema, table) in all {
            let key = (schema.clone(), table.clone());
            if !seen.contains(&key) {
                seen.push(key);
            }
        }
        seen
    }
}

/// A single schema alteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Alteration {
    RenameColumn {
        from: String,
        to: String,
    },
    ChangeType {
        column: String,
        data_type: String,
    },
    SetNullable {
        column: String,
        nullable: bool,
    },
    SetDefault {
        column: String,
        /// SQL expression, inserted verbatim
        expression: String,
    },
    DropDefault {
        column: String,
    },
    AddColumn {
        name: String,
        data_type: String,
        #[serde(default = "default_true")]
        nullable: bool,
        #[serde(default)]
        default: Option<String>,
    },
    DropColumn {
        name: String,
    },
    RenameTable {
        to: String,
    },
}

fn default_true() -> bool {
    true
}

impl Alteration {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::RenameColumn { .. } => "rename column",
            Self::ChangeType { .. } => "change column type",
            Self::SetNullable { .. } => "change nullability",
            Self::SetDefault { .. } => "set default",
            Self::DropDefault { .. } => "drop default",
            Self::AddColumn { .. } => "add column",
            Self::DropColumn { .. } => "drop column",
            Self::RenameTable { .. } => "rename table",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlterTableRequest {
    pub table: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub alterations: Vec<Alteration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_bundle_from_camel_case() {
        let bundle: TableChangeBundle = serde_json::from_value(json!({
            "updates": [{ "table": "t", "column": "name", "pkColumn": "id", "primaryKey": 1, "value": "X" }]
        }))
        .unwrap();
        let update = &bundle.updates[0];
        assert_eq!(
            update.key_predicates(),
            vec![KeyValue {
                column: "id".into(),
                value: json!(1)
            }]
        );
        assert!(bundle.inserts.is_empty());
    }

    #[test]
    fn test_composite_keys_are_anded() {
        let delete = DeleteChange {
            table: "order_items".into(),
            schema: None,
            pk_column: None,
            primary_key: None,
            primary_keys: vec![
                KeyValue {
                    column: "order_id".into(),
                    value: json!(1),
                },
                KeyValue {
                    column: "line".into(),
                    value: json!(2),
                },
            ],
        };
        assert_eq!(delete.key_predicates().len(), 2);
    }

    #[test]
    fn test_tables_are_distinct() {
        let bundle: TableChangeBundle = serde_json::from_value(json!({
            "inserts": [{ "table": "a", "data": [] }],
            "deletes": [{ "table": "a", "pkColumn": "id", "primaryKey": 1 }, { "table": "b", "pkColumn": "id", "primaryKey": 2 }]
        }))
        .unwrap();
        assert_eq!(
            bundle.tables(),
            vec![(None, "a".to_string()), (None, "b".to_string())]
        );
    }

    #[test]
    fn test_alteration_tagging() {
        let alt: Alteration =
            serde_json::from_value(json!({ "op": "rename_column", "from": "a", "to": "b" }))
                .unwrap();
        assert_eq!(
            alt,
            Alteration::RenameColumn {
                from: "a".into(),
                to: "b".into()
            }
        );
    }
}
