//! Per-dialect SQL text rules: identifier quoting, placeholders, literals,
//! paging and the capability descriptor.

use crate::models::{Capabilities, DatabaseType};

/// SQL generation rules of one dialect.
pub trait SqlDialect: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Character that delimits quoted identifiers.
    fn quote_char(&self) -> char;

    /// Quote an identifier, doubling embedded quote characters. `*` passes through.
    fn wrap_identifier(&self, name: &str) -> String {
        if name == "*" {
            return name.to_string();
        }
        let q = self.quote_char();
        let doubled: String = [q, q].iter().collect();
        format!("{q}{}{q}", name.replace(q, &doubled))
    }

    /// `schema.table`, each part quoted.
    fn qualify(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(s) if !s.is_empty() => {
                format!("{}.{}", self.wrap_identifier(s), self.wrap_identifier(table))
            }
            _ => self.wrap_identifier(table),
        }
    }

    /// Bind marker for the 1-based parameter `index`.
    fn placeholder(&self, index: usize) -> String;

    /// Bind marker that converts a parameter to `data_type` on the server.
    fn typed_placeholder(&self, index: usize, _data_type: &str) -> String {
        self.placeholder(index)
    }

    /// String literal for statements that cannot carry bind parameters.
    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Paging clause; `None` reads to the end. Empty when nothing applies.
    fn limit_offset_sql(&self, limit: Option<u64>, offset: u64) -> String {
        match (limit, offset) {
            (Some(limit), 0) => format!("LIMIT {}", limit),
            (Some(limit), offset) => format!("LIMIT {} OFFSET {}", limit, offset),
            (None, 0) => String::new(),
            (None, offset) => format!("{} OFFSET {}", self.unbounded_limit(), offset),
        }
    }

    /// LIMIT clause meaning "no limit", for an OFFSET that needs one.
    fn unbounded_limit(&self) -> &'static str {
        "LIMIT -1"
    }

    fn default_schema(&self) -> Option<&'static str> {
        None
    }

    fn capabilities(&self) -> Capabilities;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn unbounded_limit(&self) -> &'static str {
        "LIMIT ALL"
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn typed_placeholder(&self, index: usize, data_type: &str) -> String {
        // Catalog types such as "USER-DEFINED" or "ARRAY" are not castable names
        if data_type.is_empty()
            || data_type.eq_ignore_ascii_case("USER-DEFINED")
            || data_type.eq_ignore_ascii_case("ARRAY")
        {
            return self.placeholder(index);
        }
        format!("CAST(${} AS {})", index, data_type)
    }

    fn default_schema(&self) -> Option<&'static str> {
        Some("public")
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_routines: true,
            partitions: true,
            materialized_views: true,
            schemas: true,
            multi_statement: true,
            transactions: true,
            server_side_cancel: true,
            truncate_cascade: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn unbounded_limit(&self) -> &'static str {
        "LIMIT 18446744073709551615"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_routines: true,
            partitions: true,
            materialized_views: false,
            schemas: false,
            multi_statement: true,
            transactions: true,
            server_side_cancel: true,
            truncate_cascade: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_routines: false,
            partitions: false,
            materialized_views: false,
            schemas: false,
            multi_statement: true,
            transactions: true,
            server_side_cancel: false,
            truncate_cascade: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CqlDialect;

impl SqlDialect for CqlDialect {
    fn db_type(&self) -> DatabaseType {
        DatabaseType::Cassandra
    }

    fn quote_char(&self) -> char {
        '"'
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// CQL has no OFFSET; callers skip rows client-side.
    fn limit_offset_sql(&self, limit: Option<u64>, offset: u64) -> String {
        match limit {
            Some(limit) => format!("LIMIT {}", limit.saturating_add(offset)),
            None => String::new(),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            custom_routines: false,
            partitions: false,
            materialized_views: true,
            schemas: true,
            multi_statement: false,
            transactions: false,
            server_side_cancel: false,
            truncate_cascade: false,
        }
    }
}

/// Rules for `db_type`.
pub fn dialect_for(db_type: DatabaseType) -> &'static dyn SqlDialect {
    match db_type {
        DatabaseType::PostgreSQL => &PostgresDialect,
        DatabaseType::MySQL => &MySqlDialect,
        DatabaseType::SQLite => &SqliteDialect,
        DatabaseType::Cassandra => &CqlDialect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_identifier_passes_star_through() {
        for db in [
            DatabaseType::PostgreSQL,
            DatabaseType::MySQL,
            DatabaseType::SQLite,
            DatabaseType::Cassandra,
        ] {
            assert_eq!(dialect_for(db).wrap_identifier("*"), "*");
        }
    }

    #[test]
    fn test_wrap_identifier_doubles_quotes() {
        assert_eq!(PostgresDialect.wrap_identifier(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(MySqlDialect.wrap_identifier("we`ird"), "`we``ird`");
        assert_eq!(SqliteDialect.wrap_identifier("plain"), "\"plain\"");
        // quotes of other dialects are left alone
        assert_eq!(MySqlDialect.wrap_identifier(r#"a"b"#), r#"`a"b`"#);
    }

    #[test]
    fn test_qualify() {
        assert_eq!(
            PostgresDialect.qualify(Some("public"), "users"),
            r#""public"."users""#
        );
        assert_eq!(MySqlDialect.qualify(None, "users"), "`users`");
        assert_eq!(SqliteDialect.qualify(Some(""), "users"), "\"users\"");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(MySqlDialect.placeholder(3), "?");
        assert_eq!(SqliteDialect.placeholder(3), "?3");
        assert_eq!(
            PostgresDialect.typed_placeholder(1, "bit(4)"),
            "CAST($1 AS bit(4))"
        );
        assert_eq!(PostgresDialect.typed_placeholder(1, "USER-DEFINED"), "$1");
        assert_eq!(MySqlDialect.typed_placeholder(1, "bit(4)"), "?");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(PostgresDialect.quote_literal("o'neil"), "'o''neil'");
        assert_eq!(MySqlDialect.quote_literal(r"a\'b"), r"'a\\''b'");
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(SqliteDialect.limit_offset_sql(Some(10), 0), "LIMIT 10");
        assert_eq!(PostgresDialect.limit_offset_sql(Some(10), 20), "LIMIT 10 OFFSET 20");
        assert_eq!(CqlDialect.limit_offset_sql(Some(10), 20), "LIMIT 30");

        assert_eq!(PostgresDialect.limit_offset_sql(None, 0), "");
        assert_eq!(PostgresDialect.limit_offset_sql(None, 5), "LIMIT ALL OFFSET 5");
        assert_eq!(SqliteDialect.limit_offset_sql(None, 5), "LIMIT -1 OFFSET 5");
        assert_eq!(
            MySqlDialect.limit_offset_sql(None, 5),
            "LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(CqlDialect.limit_offset_sql(None, 5), "");
    }
}
