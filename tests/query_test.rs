//! Query execution, paged reads, streaming and cancellation on SQLite.

mod common;

use std::sync::Arc;
use std::time::Duration;

use db_bridge::models::{
    ExecuteOptions, FilterOperator, FilterPredicate, QueryParam, RowMode, SelectFilter,
    SelectTopRequest, SortDirection,
};
use db_bridge::{Client, DbError};
use rand::Rng;
use serde_json::json;

#[tokio::test]
async fn test_batch_returns_one_result_per_statement() {
    let (_db, _manager, client) = common::seeded().await;

    let results = client
        .execute_query(
            "UPDATE books SET pages = pages + 1 WHERE author_id = 1; \
             SELECT id, title FROM books WHERE author_id = 1 ORDER BY id; \
             DELETE FROM books WHERE id = 999",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].command, "UPDATE");
    assert_eq!(results[0].affected_rows, Some(2));
    assert_eq!(results[0].row_count, None);

    assert_eq!(results[1].command, "SELECT");
    assert_eq!(results[1].row_count, Some(2));
    assert_eq!(results[1].rows[0]["title"], json!("Owls Do Cry"));
    let field_names: Vec<&str> = results[1].fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(field_names, vec!["id", "title"]);

    assert_eq!(results[2].command, "DELETE");
    assert_eq!(results[2].affected_rows, Some(0));
}

#[tokio::test]
async fn test_empty_selects_report_their_columns() {
    let (_db, _manager, client) = common::seeded().await;

    let results = client
        .execute_query(
            "select * from authors where id = -1; select id, title from books where id = -1;",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].row_count, Some(0));
    let names: Vec<&str> = results[0].fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "name", "country"]);
    let names: Vec<&str> = results[1].fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "title"]);
}

#[tokio::test]
async fn test_trigger_and_ddl_in_one_batch() {
    let (_db, _manager, client) = common::seeded().await;

    let results = client
        .execute_query(
            "INSERT INTO tags VALUES (1, 'a'), (1, 'b'), (1, 'c'); \
             CREATE TRIGGER shout AFTER INSERT ON authors BEGIN \
                 UPDATE authors SET name = upper(name) WHERE id = new.id; \
             END; \
             CREATE TABLE scratch (a INT); \
             DROP TABLE scratch; \
             SELECT 1 AS one;",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let commands: Vec<&str> = results.iter().map(|r| r.command.as_str()).collect();
    assert_eq!(commands, vec!["INSERT", "CREATE", "CREATE", "DROP", "SELECT"]);
    let affected: Vec<_> = results[..4].iter().map(|r| r.affected_rows).collect();
    assert_eq!(affected, vec![Some(3), Some(0), Some(0), Some(0)]);
    assert_eq!(results[4].rows[0]["one"], json!(1));

    client
        .execute_query(
            "INSERT INTO authors (id, name) VALUES (7, 'hone tuwhare')",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();
    let results = client
        .execute_query("SELECT name FROM authors WHERE id = 7", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].rows[0]["name"], json!("HONE TUWHARE"));
}

#[tokio::test]
async fn test_blank_text_runs_nothing() {
    let (_db, _manager, client) = common::seeded().await;
    for text in ["", "   ", "-- just a comment\n"] {
        let results = client
            .execute_query(text, &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty(), "{:?} produced results", text);
    }
}

#[tokio::test]
async fn test_array_mode_keeps_duplicate_names() {
    let (_db, _manager, client) = common::seeded().await;

    let options = ExecuteOptions {
        row_mode: RowMode::Array,
        ..ExecuteOptions::default()
    };
    let results = client
        .execute_query("SELECT 1 AS a, 2 AS a", &options)
        .await
        .unwrap();
    let row = &results[0].rows[0];
    assert_eq!(row["c0"], json!(1));
    assert_eq!(row["c1"], json!(2));
    assert_eq!(results[0].fields[1].id, "c1");
    assert_eq!(results[0].fields[1].name, "a");

    let objects = client
        .execute_query("SELECT 1 AS a, 2 AS a", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(objects[0].rows[0].len(), 1);
    assert_eq!(objects[0].rows[0]["a"], json!(2));
}

#[tokio::test]
async fn test_driver_error_surfaces() {
    let (_db, _manager, client) = common::seeded().await;
    let err = client
        .execute_query("SELECT * FROM no_such_table", &ExecuteOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }), "{err:?}");
}

#[tokio::test]
async fn test_select_top_pages_and_counts() {
    let (_db, _manager, client) = common::seeded().await;

    let request = SelectTopRequest::new("books")
        .with_page(1, 2)
        .order_by("id", SortDirection::Asc);
    let page = client.select_top(&request).await.unwrap();
    assert_eq!(page.total_records, 4);
    assert_eq!(page.rows.len(), 2);
    assert_eq!(page.rows[0]["title"], json!("Faces in the Water"));
    assert_eq!(page.rows[1]["title"], json!("The Whale Rider"));

    let filtered = SelectTopRequest::new("books")
        .order_by("pages", SortDirection::Desc)
        .with_filter(SelectFilter::Predicates(vec![FilterPredicate::new(
            "author_id",
            FilterOperator::Eq,
            QueryParam::Int(2),
        )]));
    let page = client.select_top(&filtered).await.unwrap();
    assert_eq!(page.total_records, 2);
    assert_eq!(page.rows[0]["title"], json!("Bulibasha"));
}

#[tokio::test]
async fn test_select_top_empty_page_still_has_fields() {
    let (_db, _manager, client) = common::seeded().await;

    let request = SelectTopRequest::new("books")
        .with_filter(SelectFilter::Raw("pages > 10000".into()));
    let page = client.select_top(&request).await.unwrap();
    assert_eq!(page.total_records, 0);
    assert!(page.rows.is_empty());
    let names: Vec<&str> = page.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["id", "author_id", "title", "pages"]);
}

#[tokio::test]
async fn test_select_top_on_missing_table_fails() {
    let (_db, _manager, client) = common::seeded().await;
    assert!(client.select_top(&SelectTopRequest::new("ghost")).await.is_err());
}

/// Insert `total` rows and read them back through a cursor of `chunk` rows.
async fn stream_counts(total: usize, chunk: usize) -> Vec<usize> {
    let (_db, _manager, client) = common::seeded().await;
    client
        .execute_query(
            "CREATE TABLE numbers (n INTEGER PRIMARY KEY)",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();
    if total > 0 {
        let values: Vec<String> = (1..=total).map(|n| format!("({n})")).collect();
        client
            .execute_query(
                &format!("INSERT INTO numbers (n) VALUES {}", values.join(", ")),
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();
    }

    let mut cursor = client
        .query_stream("SELECT n FROM numbers ORDER BY n", chunk)
        .await
        .unwrap();
    cursor.start();
    let mut sizes = Vec::new();
    let mut expected = 1;
    loop {
        let rows = cursor.read().await.unwrap();
        for row in &rows {
            assert_eq!(row["n"], json!(expected));
            expected += 1;
        }
        sizes.push(rows.len());
        if rows.is_empty() {
            break;
        }
    }
    sizes
}

#[tokio::test]
async fn test_cursor_chunk_arithmetic() {
    let mut rng = rand::thread_rng();
    for _ in 0..5 {
        let total = rng.gen_range(0..60);
        let chunk = rng.gen_range(1..12);
        let sizes = stream_counts(total, chunk).await;

        let full = total / chunk;
        let rest = total % chunk;
        let mut expected = vec![chunk; full];
        if rest > 0 {
            expected.push(rest);
        }
        expected.push(0);
        assert_eq!(sizes, expected, "total={total} chunk={chunk}");
    }
}

#[tokio::test]
async fn test_select_top_stream_applies_filter() {
    let (_db, _manager, client) = common::seeded().await;

    let request = SelectTopRequest::new("books")
        .order_by("id", SortDirection::Asc)
        .with_filter(SelectFilter::Predicates(vec![FilterPredicate::new(
            "author_id",
            FilterOperator::Eq,
            QueryParam::Int(1),
        )]));
    let mut cursor = client.select_top_stream(&request, 10).await.unwrap();
    let rows = cursor.read().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(cursor.read().await.unwrap().is_empty());
    let fields = cursor.fields().unwrap();
    assert_eq!(fields[0].name, "id");
}

#[tokio::test]
async fn test_unbounded_stream_reads_whole_table() {
    let (_db, _manager, client) = common::seeded().await;
    client
        .execute_query(
            "INSERT INTO tags (book_id, tag) \
             WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 250) \
             SELECT 1, 'tag' || x FROM n",
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    async fn drain(cursor: &mut db_bridge::db::StreamingCursor) -> usize {
        let mut total = 0;
        loop {
            let rows = cursor.read().await.unwrap();
            if rows.is_empty() {
                return total;
            }
            total += rows.len();
        }
    }

    let request = SelectTopRequest::new("tags").order_by("tag", SortDirection::Asc);
    let mut paged = client.select_top_stream(&request, 64).await.unwrap();
    assert_eq!(drain(&mut paged).await, 100);

    let mut whole = client
        .select_top_stream(&request.unbounded(), 64)
        .await
        .unwrap();
    assert_eq!(drain(&mut whole).await, 250);
}

#[tokio::test]
async fn test_cancelled_cursor_refuses_reads() {
    let (_db, _manager, client) = common::seeded().await;

    let mut cursor = client.query_stream("SELECT * FROM books", 1).await.unwrap();
    assert_eq!(cursor.read().await.unwrap().len(), 1);
    cursor.cancel().await;
    let err = cursor.read().await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));

    // the connection is usable again afterwards
    let results = client
        .execute_query("SELECT COUNT(*) AS n FROM books", &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(results[0].rows[0]["n"], json!(4));
}

const SLOW_QUERY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c LIMIT 200000000) \
                          SELECT SUM(x) FROM c";

#[tokio::test]
async fn test_cancel_running_query() {
    let (_db, _manager, client) = common::seeded().await;

    let query = Arc::new(client.query(SLOW_QUERY));
    let running = {
        let query = Arc::clone(&query);
        tokio::spawn(async move { query.execute(&ExecuteOptions::default()).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.registry().len(), 1);
    query.cancel().await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("cancel did not stop the query")
        .unwrap();
    assert!(matches!(outcome, Err(DbError::Cancelled { .. })), "{outcome:?}");

    drop(query);
    assert!(client.registry().is_empty());
}

#[tokio::test]
async fn test_cancel_by_id() {
    let (_db, _manager, client) = common::seeded().await;

    let query = Arc::new(client.query(SLOW_QUERY));
    let id = query.id();
    let running = {
        let query = Arc::clone(&query);
        tokio::spawn(async move { query.execute(&ExecuteOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_query(id).await.unwrap();

    let outcome = running.await.unwrap();
    assert!(matches!(outcome, Err(DbError::Cancelled { .. })));

    let err = client.cancel_query(uuid::Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, DbError::InvalidInput { .. }));
}

#[tokio::test]
async fn test_cancel_before_execute() {
    let (_db, _manager, client) = common::seeded().await;

    let query = client.query("SELECT 1");
    query.cancel().await.unwrap();
    let err = query.execute(&ExecuteOptions::default()).await.unwrap_err();
    assert!(matches!(err, DbError::Cancelled { .. }));
}

#[tokio::test]
async fn test_query_timeout() {
    let (_db, _manager, client) = common::seeded().await;

    let options = ExecuteOptions {
        timeout_secs: Some(1),
        ..ExecuteOptions::default()
    };
    let err = client.execute_query(SLOW_QUERY, &options).await.unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }), "{err:?}");
}
