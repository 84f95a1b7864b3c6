//! Schema change builder.
//!
//! Turns an [`AlterTableRequest`] into ordered DDL for one dialect, using the
//! table's live shape. Table renames always run last so earlier statements
//! can keep addressing the table by its current name. Alterations a dialect
//! cannot perform safely fail before any DDL is produced.

use crate::db::dialect::{SqlDialect, dialect_for};
use crate::error::{DbError, DbResult};
use crate::models::{AlterTableRequest, Alteration, ColumnMetadata, DatabaseType, TableShape};

fn unsupported(alteration: &Alteration, db: DatabaseType) -> DbError {
    DbError::unsupported(format!("alteration '{}'", alteration.describe()), db)
}

fn live_column<'a>(shape: &'a TableShape, table: &str, name: &str) -> DbResult<&'a ColumnMetadata> {
    shape.column(name).ok_or_else(|| {
        DbError::schema(format!("column '{}' not found", name), table.to_string())
    })
}

/// Column an alteration addresses, for existence checks.
fn target_column(alteration: &Alteration) -> Option<&str> {
    match alteration {
        Alteration::RenameColumn { from, .. } => Some(from),
        Alteration::ChangeType { column, .. }
        | Alteration::SetNullable { column, .. }
        | Alteration::SetDefault { column, .. }
        | Alteration::DropDefault { column } => Some(column),
        Alteration::DropColumn { name } => Some(name),
        Alteration::AddColumn { .. } | Alteration::RenameTable { .. } => None,
    }
}

/// Per-dialect DDL strategy.
pub trait SchemaChangeBuilder: Send + Sync {
    fn dialect(&self) -> &'static dyn SqlDialect;

    /// Reject alterations with no safe mechanism on this dialect.
    fn check(&self, alteration: &Alteration, shape: &TableShape) -> DbResult<()>;

    /// DDL for one alteration against the table named `table` (already quoted).
    fn statements(
        &self,
        table: &str,
        request: &AlterTableRequest,
        alteration: &Alteration,
        shape: &TableShape,
    ) -> DbResult<Vec<String>>;

    /// Ordered DDL for the whole request.
    ///
    /// Each alteration is validated against the shape left by the ones before
    /// it, so a column added or renamed earlier in the list can be addressed
    /// by later steps.
    fn build(&self, request: &AlterTableRequest, shape: &TableShape) -> DbResult<Vec<String>> {
        if request.alterations.is_empty() {
            return Ok(Vec::new());
        }
        let table = self
            .dialect()
            .qualify(request.schema.as_deref(), &request.table);
        let (renames, others): (Vec<&Alteration>, Vec<&Alteration>) = request
            .alterations
            .iter()
            .partition(|a| matches!(a, Alteration::RenameTable { .. }));

        // without live columns there is nothing to check against
        let known = !shape.columns.is_empty();
        let mut running = shape.clone();
        let mut ddl = Vec::new();
        for alteration in others.into_iter().chain(renames) {
            self.check(alteration, &running)?;
            if known && let Some(column) = target_column(alteration) {
                live_column(&running, &request.table, column)?;
            }
            ddl.extend(self.statements(&table, request, alteration, &running)?);
            if known {
                simulate(&mut running, &request.table, alteration);
            }
        }
        Ok(ddl)
    }
}

/// Apply `alteration` to an in-memory shape.
fn simulate(shape: &mut TableShape, table: &str, alteration: &Alteration) {
    match alteration {
        Alteration::AddColumn {
            name,
            data_type,
            nullable,
            default,
        } => {
            let ordinal = shape.columns.iter().map(|c| c.ordinal + 1).max().unwrap_or(0);
            let mut added = ColumnMetadata::new(table, name.clone(), data_type.clone(), ordinal)
                .with_nullable(*nullable)
                .with_default(default.clone());
            if default.is_some() {
                added = added.with_extra(Some(EXPRESSION_DEFAULT.to_string()));
            }
            shape.columns.push(added);
        }
        Alteration::RenameColumn { from, to } => {
            for c in shape.columns.iter_mut().filter(|c| &c.name == from) {
                c.name = to.clone();
            }
            for index in &mut shape.indexes {
                for c in index.columns.iter_mut().filter(|c| c.as_str() == from.as_str()) {
                    *c = to.clone();
                }
            }
            for key in shape.keys.iter_mut().filter(|k| &k.from_column == from) {
                key.from_column = to.clone();
            }
        }
        Alteration::ChangeType { column, data_type } => {
            for c in shape.columns.iter_mut().filter(|c| &c.name == column) {
                c.data_type = data_type.clone();
            }
        }
        Alteration::SetNullable { column, nullable } => {
            for c in shape.columns.iter_mut().filter(|c| &c.name == column) {
                c.nullable = *nullable;
            }
        }
        Alteration::SetDefault { column, expression } => {
            for c in shape.columns.iter_mut().filter(|c| &c.name == column) {
                c.default_value = Some(expression.clone());
                c.extra = Some(match c.extra.take() {
                    Some(extra) => format!("{} {}", EXPRESSION_DEFAULT, extra),
                    None => EXPRESSION_DEFAULT.to_string(),
                });
            }
        }
        Alteration::DropDefault { column } => {
            for c in shape.columns.iter_mut().filter(|c| &c.name == column) {
                c.default_value = None;
            }
        }
        Alteration::DropColumn { name } => {
            shape.columns.retain(|c| &c.name != name);
            for index in &mut shape.indexes {
                index.columns.retain(|c| c != name);
            }
            shape.indexes.retain(|i| !i.columns.is_empty());
            shape.keys.retain(|k| &k.from_column != name);
        }
        Alteration::RenameTable { .. } => {}
    }
}

/// Marks a default given as an expression rather than a catalog literal.
const EXPRESSION_DEFAULT: &str = "DEFAULT_GENERATED";

fn column_definition(
    dialect: &dyn SqlDialect,
    name: &str,
    data_type: &str,
    nullable: bool,
    default: Option<&str>,
) -> String {
    let mut def = format!("{} {}", dialect.wrap_identifier(name), data_type);
    if !nullable {
        def.push_str(" NOT NULL");
    }
    if let Some(default) = default {
        def.push_str(" DEFAULT ");
        def.push_str(default);
    }
    def
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSchemaChanges;

impl SchemaChangeBuilder for PostgresSchemaChanges {
    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(DatabaseType::PostgreSQL)
    }

    fn check(&self, _alteration: &Alteration, _shape: &TableShape) -> DbResult<()> {
        Ok(())
    }

    fn statements(
        &self,
        table: &str,
        _request: &AlterTableRequest,
        alteration: &Alteration,
        _shape: &TableShape,
    ) -> DbResult<Vec<String>> {
        let d = self.dialect();
        let sql = match alteration {
            Alteration::RenameColumn { from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                d.wrap_identifier(from),
                d.wrap_identifier(to)
            ),
            Alteration::ChangeType { column, data_type } => {
                let col = d.wrap_identifier(column);
                format!(
                    "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                    table, col, data_type, col, data_type
                )
            }
            Alteration::SetNullable { column, nullable } => format!(
                "ALTER TABLE {} ALTER COLUMN {} {}",
                table,
                d.wrap_identifier(column),
                if *nullable { "DROP NOT NULL" } else { "SET NOT NULL" }
            ),
            Alteration::SetDefault { column, expression } => format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table,
                d.wrap_identifier(column),
                expression
            ),
            Alteration::DropDefault { column } => format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                table,
                d.wrap_identifier(column)
            ),
            Alteration::AddColumn {
                name,
                data_type,
                nullable,
                default,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                table,
                column_definition(d, name, data_type, *nullable, default.as_deref())
            ),
            Alteration::DropColumn { name } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, d.wrap_identifier(name))
            }
            Alteration::RenameTable { to } => {
                format!("ALTER TABLE {} RENAME TO {}", table, d.wrap_identifier(to))
            }
        };
        Ok(vec![sql])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlSchemaChanges;

impl MySqlSchemaChanges {
    /// Default clause as MySQL's catalog reports it.
    fn default_clause(column: &ColumnMetadata) -> Option<String> {
        let raw = column.default_value.as_deref()?;
        if raw.eq_ignore_ascii_case("NULL") {
            return column.nullable.then(|| "NULL".to_string());
        }
        let generated = column
            .extra
            .as_deref()
            .is_some_and(|e| e.to_uppercase().contains("DEFAULT_GENERATED"));
        let upper = raw.to_uppercase();
        if upper.starts_with("CURRENT_TIMESTAMP") || upper == "NOW()" {
            return Some(raw.to_string());
        }
        if generated {
            return Some(format!("({})", raw));
        }
        Some(dialect_for(DatabaseType::MySQL).quote_literal(raw))
    }

    /// Column attributes that must survive a `CHANGE`/`MODIFY`.
    fn kept_extra(column: &ColumnMetadata) -> Option<String> {
        let extra = column.extra.as_deref()?.trim();
        let upper = extra.to_uppercase();
        let kept: Vec<&str> = if upper.contains("AUTO_INCREMENT") {
            vec!["AUTO_INCREMENT"]
        } else if let Some(pos) = upper.find("ON UPDATE") {
            vec![&extra[pos..]]
        } else {
            Vec::new()
        };
        (!kept.is_empty()).then(|| kept.join(" "))
    }

    /// Full definition of `column` with the requested overrides applied.
    fn rebuild(
        column: &ColumnMetadata,
        name: &str,
        data_type: Option<&str>,
        nullable: Option<bool>,
    ) -> String {
        let d = dialect_for(DatabaseType::MySQL);
        let nullable = nullable.unwrap_or(column.nullable);
        let mut def = format!(
            "{} {} {}",
            d.wrap_identifier(name),
            data_type.unwrap_or(&column.data_type),
            if nullable { "NULL" } else { "NOT NULL" }
        );
        if let Some(default) = Self::default_clause(column)
            && (default != "NULL" || nullable)
        {
            def.push_str(" DEFAULT ");
            def.push_str(&default);
        }
        if let Some(extra) = Self::kept_extra(column) {
            def.push(' ');
            def.push_str(&extra);
        }
        def
    }
}

impl SchemaChangeBuilder for MySqlSchemaChanges {
    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(DatabaseType::MySQL)
    }

    fn check(&self, alteration: &Alteration, shape: &TableShape) -> DbResult<()> {
        // CHANGE/MODIFY restate the whole column, so its live definition is required
        let rebuilds = matches!(
            alteration,
            Alteration::RenameColumn { .. }
                | Alteration::ChangeType { .. }
                | Alteration::SetNullable { .. }
        );
        if rebuilds && shape.columns.is_empty() {
            return Err(DbError::schema(
                format!("{} needs the live column definitions", alteration.describe()),
                "",
            ));
        }
        Ok(())
    }

    fn statements(
        &self,
        table: &str,
        request: &AlterTableRequest,
        alteration: &Alteration,
        shape: &TableShape,
    ) -> DbResult<Vec<String>> {
        let d = self.dialect();
        let sql = match alteration {
            Alteration::RenameColumn { from, to } => {
                let column = live_column(shape, &request.table, from)?;
                format!(
                    "ALTER TABLE {} CHANGE COLUMN {} {}",
                    table,
                    d.wrap_identifier(from),
                    Self::rebuild(column, to, None, None)
                )
            }
            Alteration::ChangeType { column, data_type } => {
                let live = live_column(shape, &request.table, column)?;
                format!(
                    "ALTER TABLE {} MODIFY COLUMN {}",
                    table,
                    Self::rebuild(live, column, Some(data_type), None)
                )
            }
            Alteration::SetNullable { column, nullable } => {
                let live = live_column(shape, &request.table, column)?;
                format!(
                    "ALTER TABLE {} MODIFY COLUMN {}",
                    table,
                    Self::rebuild(live, column, None, Some(*nullable))
                )
            }
            Alteration::SetDefault { column, expression } => format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table,
                d.wrap_identifier(column),
                expression
            ),
            Alteration::DropDefault { column } => format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                table,
                d.wrap_identifier(column)
            ),
            Alteration::AddColumn {
                name,
                data_type,
                nullable,
                default,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                table,
                column_definition(d, name, data_type, *nullable, default.as_deref())
            ),
            Alteration::DropColumn { name } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, d.wrap_identifier(name))
            }
            Alteration::RenameTable { to } => {
                let target = d.qualify(request.schema.as_deref(), to);
                format!("RENAME TABLE {} TO {}", table, target)
            }
        };
        Ok(vec![sql])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteSchemaChanges;

impl SchemaChangeBuilder for SqliteSchemaChanges {
    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(DatabaseType::SQLite)
    }

    fn check(&self, alteration: &Alteration, shape: &TableShape) -> DbResult<()> {
        match alteration {
            Alteration::ChangeType { .. }
            | Alteration::SetNullable { .. }
            | Alteration::SetDefault { .. }
            | Alteration::DropDefault { .. } => Err(unsupported(alteration, DatabaseType::SQLite)),
            // SQLite refuses to drop key, unique or referencing columns
            Alteration::DropColumn { name } => {
                let indexed = shape
                    .indexes
                    .iter()
                    .any(|i| (i.primary || i.unique) && i.columns.iter().any(|c| c == name));
                let keyed = shape.keys.iter().any(|k| &k.from_column == name)
                    || shape.column(name).is_some_and(|c| c.is_primary_key);
                if indexed || keyed {
                    return Err(DbError::unsupported(
                        format!("dropping key or unique column '{}'", name),
                        DatabaseType::SQLite,
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn statements(
        &self,
        table: &str,
        _request: &AlterTableRequest,
        alteration: &Alteration,
        _shape: &TableShape,
    ) -> DbResult<Vec<String>> {
        let d = self.dialect();
        let sql = match alteration {
            Alteration::RenameColumn { from, to } => format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                d.wrap_identifier(from),
                d.wrap_identifier(to)
            ),
            Alteration::AddColumn {
                name,
                data_type,
                nullable,
                default,
            } => format!(
                "ALTER TABLE {} ADD COLUMN {}",
                table,
                column_definition(d, name, data_type, *nullable, default.as_deref())
            ),
            Alteration::DropColumn { name } => {
                format!("ALTER TABLE {} DROP COLUMN {}", table, d.wrap_identifier(name))
            }
            Alteration::RenameTable { to } => {
                format!("ALTER TABLE {} RENAME TO {}", table, d.wrap_identifier(to))
            }
            other => return Err(unsupported(other, DatabaseType::SQLite)),
        };
        Ok(vec![sql])
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CqlSchemaChanges;

impl SchemaChangeBuilder for CqlSchemaChanges {
    fn dialect(&self) -> &'static dyn SqlDialect {
        dialect_for(DatabaseType::Cassandra)
    }

    fn check(&self, alteration: &Alteration, _shape: &TableShape) -> DbResult<()> {
        match alteration {
            Alteration::ChangeType { .. }
            | Alteration::SetNullable { .. }
            | Alteration::SetDefault { .. }
            | Alteration::DropDefault { .. }
            | Alteration::RenameTable { .. } => {
                Err(unsupported(alteration, DatabaseType::Cassandra))
            }
            Alteration::AddColumn {
                nullable, default, ..
            } if !*nullable || default.is_some() => Err(DbError::unsupported(
                "NOT NULL or DEFAULT on a new column",
                DatabaseType::Cassandra,
            )),
            _ => Ok(()),
        }
    }

    fn statements(
        &self,
        table: &str,
        _request: &AlterTableRequest,
        alteration: &Alteration,
        _shape: &TableShape,
    ) -> DbResult<Vec<String>> {
        let d = self.dialect();
        let sql = match alteration {
            Alteration::RenameColumn { from, to } => format!(
                "ALTER TABLE {} RENAME {} TO {}",
                table,
                d.wrap_identifier(from),
                d.wrap_identifier(to)
            ),
            Alteration::AddColumn {
                name, data_type, ..
            } => format!("ALTER TABLE {} ADD {} {}", table, d.wrap_identifier(name), data_type),
            Alteration::DropColumn { name } => {
                format!("ALTER TABLE {} DROP {}", table, d.wrap_identifier(name))
            }
            other => return Err(unsupported(other, DatabaseType::Cassandra)),
        };
        Ok(vec![sql])
    }
}

/// Strategy for `db_type`, chosen once per connection.
pub fn builder_for(db_type: DatabaseType) -> &'static dyn SchemaChangeBuilder {
    match db_type {
        DatabaseType::PostgreSQL => &PostgresSchemaChanges,
        DatabaseType::MySQL => &MySqlSchemaChanges,
        DatabaseType::SQLite => &SqliteSchemaChanges,
        DatabaseType::Cassandra => &CqlSchemaChanges,
    }
}
