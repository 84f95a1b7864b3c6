//! Best-effort statement splitting and classification.
//!
//! Uses the `sqlparser` tokenizer only, so dialect extensions that the full
//! parser rejects still classify. Tokenizer failure degrades to one `UNKNOWN`
//! statement covering the whole text.

use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::models::DatabaseType;

pub const UNKNOWN_COMMAND: &str = "UNKNOWN";

/// One statement of a batch with its leading verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedStatement {
    pub text: String,
    /// Upper-case verb, e.g. `SELECT`, `INSERT`, `CREATE`, or `UNKNOWN`.
    pub command: String,
}

fn tokenizer_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
        DatabaseType::Cassandra => Box::new(GenericDialect {}),
    }
}

/// Split `sql` on top-level semicolons and classify each statement.
///
/// Empty and comment-only text yields no statements.
pub fn classify(sql: &str, db_type: DatabaseType) -> Vec<ClassifiedStatement> {
    if sql.trim().is_empty() {
        return Vec::new();
    }

    let dialect = tokenizer_dialect(db_type);
    let tokens = match Tokenizer::new(dialect.as_ref(), sql).tokenize() {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::debug!(error = %e, "Statement tokenization failed, treating batch as one statement");
            return vec![ClassifiedStatement {
                text: sql.trim().to_string(),
                command: UNKNOWN_COMMAND.to_string(),
            }];
        }
    };

    split_statements(&tokens)
        .into_iter()
        .filter(|stmt| stmt.iter().any(is_significant))
        .map(|stmt| ClassifiedStatement {
            text: stmt.iter().map(|t| t.to_string()).collect::<String>().trim().to_string(),
            command: leading_verb(stmt),
        })
        .collect()
}

/// Split on semicolons outside routine and trigger bodies.
fn split_statements(tokens: &[Token]) -> Vec<&[Token]> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut body = BodyDepth::default();
    for (i, token) in tokens.iter().enumerate() {
        if matches!(token, Token::SemiColon) && body.depth == 0 {
            statements.push(&tokens[start..i]);
            start = i + 1;
            body = BodyDepth::default();
            continue;
        }
        if matches!(token, Token::LParen) && body.routine.is_none() && body.leading.is_some() {
            body.routine = Some(false);
        }
        if let Some(word) = word_upper(token) {
            let next = tokens[i + 1..]
                .iter()
                .find(|t| is_significant(t))
                .and_then(word_upper);
            body.observe(&word, next.as_deref());
        }
    }
    statements.push(&tokens[start..]);
    statements
}

/// `BEGIN ... END` nesting inside `CREATE TRIGGER/PROCEDURE/FUNCTION/EVENT`.
#[derive(Debug, Default)]
struct BodyDepth {
    leading: Option<String>,
    /// Decided once the object kind of a CREATE is known.
    routine: Option<bool>,
    depth: u32,
    /// The word after `END` names the block it closes.
    closing: bool,
}

impl BodyDepth {
    fn observe(&mut self, word: &str, next: Option<&str>) {
        if self.leading.is_none() {
            self.leading = Some(word.to_string());
            return;
        }
        let creates = self.leading.as_deref() == Some("CREATE");
        match self.routine {
            None if !creates => self.routine = Some(false),
            None => match word {
                "TRIGGER" | "PROCEDURE" | "FUNCTION" | "EVENT" => self.routine = Some(true),
                "TABLE" | "VIEW" | "INDEX" | "SEQUENCE" | "TYPE" | "SCHEMA" | "DATABASE"
                | "KEYSPACE" | "EXTENSION" | "MATERIALIZED" | "USER" | "ROLE" => {
                    self.routine = Some(false)
                }
                _ => {}
            },
            Some(false) => {}
            Some(true) if self.closing => self.closing = false,
            Some(true) => match word {
                "BEGIN" | "CASE" => self.depth += 1,
                "END" => match next {
                    // MySQL block terminators; their openers are not counted
                    Some("IF" | "LOOP" | "WHILE" | "REPEAT") => self.closing = true,
                    Some("CASE") => {
                        self.depth = self.depth.saturating_sub(1);
                        self.closing = true;
                    }
                    _ => self.depth = self.depth.saturating_sub(1),
                },
                _ => {}
            },
        }
    }
}

fn is_significant(token: &Token) -> bool {
    !matches!(token, Token::Whitespace(_) | Token::EOF)
}

fn word_upper(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.to_uppercase()),
        _ => None,
    }
}

fn leading_verb(stmt: &[Token]) -> String {
    let mut significant = stmt
        .iter()
        .filter(|t| is_significant(t) && !matches!(t, Token::LParen));

    let Some(first) = significant.next().and_then(word_upper) else {
        return UNKNOWN_COMMAND.to_string();
    };
    if first != "WITH" {
        return first;
    }

    // WITH resolves to the first top-level data verb after the CTE list
    let mut depth = 0i32;
    for token in stmt {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            other if depth == 0 => {
                if let Some(word) = word_upper(other) {
                    if matches!(word.as_str(), "SELECT" | "INSERT" | "UPDATE" | "DELETE" | "MERGE") {
                        return word;
                    }
                }
            }
            _ => {}
        }
    }
    UNKNOWN_COMMAND.to_string()
}

/// Whether the driver's change count is meaningful for this verb.
pub fn reports_changes(command: &str) -> bool {
    matches!(
        command,
        "INSERT" | "UPDATE" | "DELETE" | "REPLACE" | "MERGE" | "COPY" | UNKNOWN_COMMAND
    )
}

/// Whether a statement with this verb produces a row set.
pub fn returns_rows(command: &str) -> bool {
    matches!(
        command,
        "SELECT" | "SHOW" | "EXPLAIN" | "DESCRIBE" | "DESC" | "PRAGMA" | "VALUES" | "TABLE"
    )
}
