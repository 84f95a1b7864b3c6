//! Shared setup for the SQLite-backed integration tests.

#![allow(dead_code)]

use db_bridge::config::ServerDefinition;
use db_bridge::db::ConnectionManager;
use db_bridge::models::{ExecuteOptions, ServerConfig};
use db_bridge::{Client, DialectClient};
use tempfile::TempDir;

pub const SCHEMA: &str = r#"
    CREATE TABLE authors (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        country TEXT DEFAULT 'NZ'
    );
    CREATE TABLE books (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        author_id INTEGER NOT NULL REFERENCES authors(id) ON DELETE CASCADE,
        title TEXT NOT NULL UNIQUE,
        pages INTEGER
    );
    CREATE INDEX idx_books_author ON books (author_id);
    CREATE TABLE tags (
        book_id INTEGER NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (book_id, tag)
    );
    CREATE VIEW long_books AS SELECT * FROM books WHERE pages > 300;
    INSERT INTO authors (id, name) VALUES (1, 'Janet Frame'), (2, 'Witi Ihimaera');
    INSERT INTO books (author_id, title, pages) VALUES
        (1, 'Owls Do Cry', 224),
        (1, 'Faces in the Water', 254),
        (2, 'The Whale Rider', 152),
        (2, 'Bulibasha', 336);
"#;

/// A file database on disk; dropped with the returned directory.
pub struct TestDb {
    pub dir: TempDir,
    pub url: String,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("library.db").display());
        Self { dir, url }
    }

    pub fn config(&self, read_only: bool) -> ServerConfig {
        let mut definition = format!("library={}", self.url);
        if read_only {
            definition.push_str("?read_only=true");
        }
        ServerDefinition::parse(&definition)
            .unwrap()
            .into_server_config()
            .unwrap()
    }
}

/// Writable client over a seeded database.
pub async fn seeded() -> (TestDb, ConnectionManager, DialectClient) {
    let db = TestDb::new();
    let manager = ConnectionManager::new();
    let client = manager.connect(db.config(false), None).await.unwrap();
    client
        .execute_query(SCHEMA, &ExecuteOptions::default())
        .await
        .unwrap();
    (db, manager, client)
}
