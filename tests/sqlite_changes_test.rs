//! Change bundles, alterations and truncation on SQLite.

mod common;

use db_bridge::db::ConnectionManager;
use db_bridge::models::{
    AlterTableRequest, Alteration, DeleteChange, ExecuteOptions, InsertChange, KeyValue,
    ListFilter, Row, TableChangeBundle, UpdateChange,
};
use db_bridge::{Client, DbError};
use serde_json::{Value, json};

fn row(value: Value) -> Row {
    serde_json::from_value(value).unwrap()
}

fn update(table: &str, id: i64, column: &str, value: Value) -> UpdateChange {
    UpdateChange {
        table: table.into(),
        schema: None,
        column: column.into(),
        pk_column: Some("id".into()),
        primary_key: Some(json!(id)),
        primary_keys: Vec::new(),
        value,
        column_type: None,
    }
}

fn delete(table: &str, id: i64) -> DeleteChange {
    DeleteChange {
        table: table.into(),
        schema: None,
        pk_column: Some("id".into()),
        primary_key: Some(json!(id)),
        primary_keys: Vec::new(),
    }
}

async fn count(client: &dyn Client, sql: &str) -> i64 {
    let results = client
        .execute_query(sql, &ExecuteOptions::default())
        .await
        .unwrap();
    results[0].rows[0]
        .values()
        .next()
        .and_then(Value::as_i64)
        .unwrap()
}

#[tokio::test]
async fn test_bundle_applies_and_returns_updated_rows() {
    let (_db, _manager, client) = common::seeded().await;

    let bundle = TableChangeBundle {
        inserts: vec![InsertChange {
            table: "authors".into(),
            schema: None,
            data: vec![row(json!({"id": 3, "name": "Patricia Grace"}))],
        }],
        updates: vec![update("books", 3, "pages", json!(160))],
        deletes: vec![delete("books", 4)],
    };
    let updated = client.apply_changes(&bundle).await.unwrap();

    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["id"], json!(3));
    assert_eq!(updated[0]["pages"], json!(160));
    assert_eq!(updated[0]["title"], json!("The Whale Rider"));

    assert_eq!(count(client.as_client(), "SELECT COUNT(*) FROM authors").await, 3);
    assert_eq!(count(client.as_client(), "SELECT COUNT(*) FROM books").await, 3);
}

#[tokio::test]
async fn test_composite_key_update() {
    let (_db, _manager, client) = common::seeded().await;
    client
        .execute_query(
            "INSERT INTO tags VALUES (1, 'classic'), (1, 'novel')",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let bundle = TableChangeBundle {
        updates: vec![UpdateChange {
            pk_column: None,
            primary_key: None,
            primary_keys: vec![
                KeyValue {
                    column: "book_id".into(),
                    value: json!(1),
                },
                KeyValue {
                    column: "tag".into(),
                    value: json!("novel"),
                },
            ],
            ..update("tags", 0, "tag", json!("fiction"))
        }],
        ..TableChangeBundle::default()
    };
    let updated = client.apply_changes(&bundle).await.unwrap();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0]["tag"], json!("fiction"));
    assert_eq!(
        count(client.as_client(), "SELECT COUNT(*) FROM tags WHERE tag = 'classic'").await,
        1
    );
}

#[tokio::test]
async fn test_failing_bundle_changes_nothing() {
    let (_db, _manager, client) = common::seeded().await;

    let bundle = TableChangeBundle {
        inserts: vec![InsertChange {
            table: "authors".into(),
            schema: None,
            data: vec![row(json!({"id": 9, "name": "Keri Hulme"}))],
        }],
        updates: vec![update("authors", 1, "name", json!("J. Frame"))],
        // no such row
        deletes: vec![delete("books", 404)],
    };
    let err = client.apply_changes(&bundle).await.unwrap_err();
    assert!(matches!(err, DbError::ChangesRolledBack { .. }), "{err:?}");

    assert_eq!(count(client.as_client(), "SELECT COUNT(*) FROM authors").await, 2);
    assert_eq!(
        count(
            client.as_client(),
            "SELECT COUNT(*) FROM authors WHERE name = 'Janet Frame'"
        )
        .await,
        1
    );
}

#[tokio::test]
async fn test_constraint_violation_rolls_back() {
    let (_db, _manager, client) = common::seeded().await;

    let bundle = TableChangeBundle {
        inserts: vec![
            InsertChange {
                table: "authors".into(),
                schema: None,
                data: vec![row(json!({"id": 5, "name": "Albert Wendt"}))],
            },
            InsertChange {
                table: "books".into(),
                schema: None,
                // duplicate title
                data: vec![row(json!({"author_id": 5, "title": "Bulibasha"}))],
            },
        ],
        ..TableChangeBundle::default()
    };
    assert!(client.apply_changes(&bundle).await.is_err());
    assert_eq!(
        count(client.as_client(), "SELECT COUNT(*) FROM authors WHERE id = 5").await,
        0
    );
}

#[tokio::test]
async fn test_empty_bundle_is_a_no_op() {
    let (_db, _manager, client) = common::seeded().await;
    let rows = client
        .apply_changes(&TableChangeBundle::default())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn test_read_only_rejects_writes() {
    let db = common::TestDb::new();
    {
        let manager = ConnectionManager::new();
        let client = manager.connect(db.config(false), None).await.unwrap();
        client
            .execute_query(common::SCHEMA, &ExecuteOptions::default())
            .await
            .unwrap();
        manager.close_all().await;
    }

    let manager = ConnectionManager::new();
    let client = manager.connect(db.config(true), None).await.unwrap();
    assert!(client.info().read_only);

    let bundle = TableChangeBundle {
        deletes: vec![delete("books", 1)],
        ..TableChangeBundle::default()
    };
    let err = client.apply_changes(&bundle).await.unwrap_err();
    assert!(matches!(err, DbError::Permission { .. }), "{err:?}");

    let err = client.truncate_all_tables(None).await.unwrap_err();
    assert!(matches!(err, DbError::Permission { .. }));

    let request = AlterTableRequest {
        table: "books".into(),
        schema: None,
        alterations: vec![Alteration::DropColumn {
            name: "pages".into(),
        }],
    };
    let err = client.alter_table(&request).await.unwrap_err();
    assert!(matches!(err, DbError::Permission { .. }));

    // reads still work
    let tables = client.list_tables(&ListFilter::default()).await.unwrap();
    assert_eq!(tables.len(), 3);
}

#[tokio::test]
async fn test_alter_table() {
    let (_db, _manager, client) = common::seeded().await;

    let request = AlterTableRequest {
        table: "authors".into(),
        schema: None,
        alterations: vec![
            Alteration::AddColumn {
                name: "born".into(),
                data_type: "INTEGER".into(),
                nullable: true,
                default: None,
            },
            Alteration::RenameColumn {
                from: "country".into(),
                to: "nationality".into(),
            },
        ],
    };
    let preview = client.alter_table_sql(&request).await.unwrap();
    assert_eq!(preview.len(), 2);

    let applied = client.alter_table(&request).await.unwrap();
    assert_eq!(applied, preview);

    let columns = client.list_table_columns(Some("authors"), None).await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "nationality", "born"]);

    let drop = AlterTableRequest {
        table: "authors".into(),
        schema: None,
        alterations: vec![Alteration::DropColumn {
            name: "born".into(),
        }],
    };
    client.alter_table(&drop).await.unwrap();
    let columns = client.list_table_columns(Some("authors"), None).await.unwrap();
    assert_eq!(columns.len(), 3);
}

#[tokio::test]
async fn test_unsupported_alteration_runs_nothing() {
    let (_db, _manager, client) = common::seeded().await;

    let request = AlterTableRequest {
        table: "authors".into(),
        schema: None,
        alterations: vec![
            Alteration::AddColumn {
                name: "born".into(),
                data_type: "INTEGER".into(),
                nullable: true,
                default: None,
            },
            Alteration::ChangeType {
                column: "name".into(),
                data_type: "BLOB".into(),
            },
        ],
    };
    let err = client.alter_table(&request).await.unwrap_err();
    assert!(matches!(err, DbError::Unsupported { .. }), "{err:?}");

    let columns = client.list_table_columns(Some("authors"), None).await.unwrap();
    assert!(columns.iter().all(|c| c.name != "born"));
}

#[tokio::test]
async fn test_truncate_all_tables() {
    let (_db, _manager, client) = common::seeded().await;
    client
        .execute_query("PRAGMA foreign_keys = ON", &ExecuteOptions::default())
        .await
        .unwrap();

    client.truncate_all_tables(None).await.unwrap();

    for table in ["authors", "books", "tags"] {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        assert_eq!(count(client.as_client(), &sql).await, 0, "{table}");
    }

    // autoincrement counters start over
    client
        .execute_query(
            "INSERT INTO authors (id, name) VALUES (1, 'A'); \
             INSERT INTO books (author_id, title) VALUES (1, 'B')",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(count(client.as_client(), "SELECT id FROM books").await, 1);

    // enforcement is back on
    let enabled = count(client.as_client(), "PRAGMA foreign_keys").await;
    assert_eq!(enabled, 1);
}
