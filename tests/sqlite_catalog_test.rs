//! Catalog listings and create scripts against a seeded SQLite file.

mod common;

use std::collections::HashSet;

use db_bridge::models::{ForeignKeyAction, ListFilter, TableType};
use db_bridge::Client;

#[tokio::test]
async fn test_tables_and_views_are_listed_separately() {
    let (_db, _manager, client) = common::seeded().await;

    let tables = client.list_tables(&ListFilter::default()).await.unwrap();
    let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["authors", "books", "tags"]);
    assert!(tables.iter().all(|t| t.entity_type == TableType::Table));

    let views = client.list_views(&ListFilter::default()).await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].name, "long_books");
    assert_eq!(views[0].entity_type, TableType::View);

    // sqlite_sequence exists because books uses AUTOINCREMENT
    assert!(!names.contains(&"sqlite_sequence"));
}

#[tokio::test]
async fn test_list_filter_only_and_ignore() {
    let (_db, _manager, client) = common::seeded().await;

    let only = ListFilter {
        only: vec!["books".into(), "tags".into()],
        ignore: vec!["tags".into()],
        ..ListFilter::default()
    };
    let tables = client.list_tables(&only).await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].name, "books");
}

#[tokio::test]
async fn test_columns_of_one_table() {
    let (_db, _manager, client) = common::seeded().await;

    let columns = client.list_table_columns(Some("authors"), None).await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "country"]);

    // pragma cid, zero-based
    let ordinals: Vec<u32> = columns.iter().map(|c| c.ordinal).collect();
    assert_eq!(ordinals, vec![0, 1, 2]);

    assert!(columns[0].is_primary_key);
    assert!(!columns[1].nullable);
    assert!(columns[2].nullable);
    assert_eq!(columns[2].default_value.as_deref(), Some("'NZ'"));
    assert!(columns.iter().all(|c| c.table_name == "authors"));
}

#[tokio::test]
async fn test_columns_of_every_table_have_unique_ordinals() {
    let (_db, _manager, client) = common::seeded().await;

    let columns = client.list_table_columns(None, None).await.unwrap();
    let tables: HashSet<&str> = columns.iter().map(|c| c.table_name.as_str()).collect();
    assert!(tables.contains("authors"));
    assert!(tables.contains("books"));
    assert!(tables.contains("tags"));
    assert!(tables.contains("long_books"));

    let mut seen = HashSet::new();
    for column in &columns {
        assert!(
            seen.insert((column.table_name.clone(), column.ordinal)),
            "duplicate ordinal {} in {}",
            column.ordinal,
            column.table_name
        );
    }
}

#[tokio::test]
async fn test_columns_of_missing_table_is_empty() {
    let (_db, _manager, client) = common::seeded().await;
    let columns = client.list_table_columns(Some("nope"), None).await.unwrap();
    assert!(columns.is_empty());
}

#[tokio::test]
async fn test_rowid_key_gets_synthesized_primary_index() {
    let (_db, _manager, client) = common::seeded().await;

    let indexes = client.list_table_indexes("books", None).await.unwrap();
    let primary = indexes.iter().find(|i| i.primary).unwrap();
    assert_eq!(primary.name, "PRIMARY");
    assert_eq!(primary.columns, vec!["id"]);

    let by_author = indexes
        .iter()
        .find(|i| i.name == "idx_books_author")
        .unwrap();
    assert_eq!(by_author.columns, vec!["author_id"]);
    assert!(!by_author.unique);

    assert!(
        indexes
            .iter()
            .any(|i| i.unique && !i.primary && i.columns == vec!["title"])
    );
}

#[tokio::test]
async fn test_composite_key_uses_its_autoindex() {
    let (_db, _manager, client) = common::seeded().await;

    let indexes = client.list_table_indexes("tags", None).await.unwrap();
    let primary: Vec<_> = indexes.iter().filter(|i| i.primary).collect();
    assert_eq!(primary.len(), 1);
    assert_ne!(primary[0].name, "PRIMARY");
    assert_eq!(primary[0].columns, vec!["book_id", "tag"]);

    let keys = client.get_primary_keys("tags", None).await.unwrap();
    let names: Vec<&str> = keys.iter().map(|k| k.column_name.as_str()).collect();
    assert_eq!(names, vec!["book_id", "tag"]);
    assert_eq!(client.get_primary_key("tags", None).await.unwrap(), None);
    assert_eq!(
        client.get_primary_key("authors", None).await.unwrap().as_deref(),
        Some("id")
    );
}

#[tokio::test]
async fn test_foreign_keys() {
    let (_db, _manager, client) = common::seeded().await;

    let keys = client.get_table_keys("books", None).await.unwrap();
    assert_eq!(keys.len(), 1);
    let key = &keys[0];
    assert_eq!(key.from_table, "books");
    assert_eq!(key.from_column, "author_id");
    assert_eq!(key.to_table, "authors");
    assert_eq!(key.to_column, "id");
    assert_eq!(key.on_delete, ForeignKeyAction::Cascade);
    assert_eq!(key.on_update, ForeignKeyAction::NoAction);

    assert!(client.get_table_keys("authors", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_scripts() {
    let (_db, _manager, client) = common::seeded().await;

    let script = client.get_table_create_script("books", None).await.unwrap();
    assert!(script[0].starts_with("CREATE TABLE books"));
    assert!(script.iter().all(|s| s.ends_with(';')));
    assert!(script.iter().any(|s| s.contains("idx_books_author")));

    let view = client.get_view_create_script("long_books", None).await.unwrap();
    assert_eq!(view.len(), 1);
    assert!(view[0].starts_with("CREATE VIEW long_books"));

    assert!(client.get_table_create_script("missing", None).await.unwrap().is_empty());
    assert!(client.get_view_create_script("books", None).await.unwrap().is_empty());
    assert!(client.get_routine_create_script("anything", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_databases_and_schemas() {
    let (_db, _manager, client) = common::seeded().await;

    let databases = client.list_databases().await.unwrap();
    assert_eq!(databases.first().map(String::as_str), Some("main"));
    assert!(client.list_schemas().await.unwrap().is_empty());
    assert!(client.list_routines(&ListFilter::default()).await.unwrap().is_empty());
}
