//! Streaming cursors with bounded back-pressure.
//!
//! A producer task runs the query on its own pooled session and pushes rows
//! into a bounded channel whose capacity equals the chunk size; once the
//! channel is full the producer waits for [`StreamingCursor::read`] to drain
//! it.
//!
//! ```text
//! Created --start()--> Reading <--> Waiting --> Exhausted
//!                         \___________________ cancel() --> Cancelled
//! ```

use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DbError, DbResult};
use crate::models::{ResultField, Row};

/// Bound on waiting for a cancelled producer to release its session.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    Created,
    /// Started; rows may be buffered.
    Reading,
    /// A read is waiting on the producer.
    Waiting,
    Exhausted,
    Cancelled,
}

#[derive(Debug)]
pub enum CursorEvent {
    Fields(Vec<ResultField>),
    Row(Row),
}

/// Query body run on the producer task.
pub type Producer = Box<dyn FnOnce(RowSink) -> BoxFuture<'static, ()> + Send>;

/// Producer end of a cursor.
pub struct RowSink {
    tx: mpsc::Sender<DbResult<CursorEvent>>,
    token: CancellationToken,
}

impl RowSink {
    async fn push(&self, event: DbResult<CursorEvent>) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Returns `false` once the cursor is gone or cancelled.
    pub async fn send_fields(&self, fields: Vec<ResultField>) -> bool {
        self.push(Ok(CursorEvent::Fields(fields))).await
    }

    /// Waits while the channel is full. Returns `false` once the cursor is
    /// gone or cancelled.
    pub async fn send_row(&self, row: Row) -> bool {
        self.push(Ok(CursorEvent::Row(row))).await
    }

    /// Hand an error to the next read.
    pub async fn fail(&self, err: DbError) {
        self.push(Err(err)).await;
    }

    /// Resolves when the cursor is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Pull-based reader over a producer task.
pub struct StreamingCursor {
    chunk_size: usize,
    state: CursorState,
    producer: Option<Producer>,
    rx: Option<mpsc::Receiver<DbResult<CursorEvent>>>,
    task: Option<JoinHandle<()>>,
    token: CancellationToken,
    fields: Option<Vec<ResultField>>,
    pending_error: Option<DbError>,
}

impl StreamingCursor {
    /// A chunk size of zero is treated as one.
    pub fn new(chunk_size: usize, producer: Producer) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            state: CursorState::Created,
            producer: Some(producer),
            rx: None,
            task: None,
            token: CancellationToken::new(),
            fields: None,
            pending_error: None,
        }
    }

    /// Spawn the producer. A no-op once started.
    pub fn start(&mut self) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(self.chunk_size);
        let sink = RowSink {
            tx,
            token: self.token.clone(),
        };
        self.task = Some(tokio::spawn(producer(sink)));
        self.rx = Some(rx);
        self.state = CursorState::Reading;
        debug!(chunk_size = self.chunk_size, "Cursor started");
    }

    /// Next chunk of up to `chunk_size` rows.
    ///
    /// A short chunk means the stream ended; after that every read returns an
    /// empty chunk. A producer error is returned by the read that meets it,
    /// or by the next one when rows were already collected.
    pub async fn read(&mut self) -> DbResult<Vec<Row>> {
        match self.state {
            CursorState::Created => self.start(),
            CursorState::Exhausted => return Ok(Vec::new()),
            CursorState::Cancelled => return Err(DbError::cancelled("cursor read")),
            CursorState::Reading | CursorState::Waiting => {}
        }
        if self.token.is_cancelled() {
            self.state = CursorState::Cancelled;
            return Err(DbError::cancelled("cursor read"));
        }
        if let Some(err) = self.pending_error.take() {
            self.state = CursorState::Exhausted;
            return Err(err);
        }
        let Some(rx) = self.rx.as_mut() else {
            self.state = CursorState::Exhausted;
            return Ok(Vec::new());
        };

        let mut rows = Vec::with_capacity(self.chunk_size);
        self.state = CursorState::Waiting;
        while rows.len() < self.chunk_size {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.state = CursorState::Cancelled;
                    return Err(DbError::cancelled("cursor read"));
                }
                event = rx.recv() => event,
            };
            match event {
                Some(Ok(CursorEvent::Fields(fields))) => self.fields = Some(fields),
                Some(Ok(CursorEvent::Row(row))) => rows.push(row),
                Some(Err(err)) if rows.is_empty() => {
                    self.rx = None;
                    self.state = CursorState::Exhausted;
                    return Err(err);
                }
                Some(Err(err)) => {
                    self.pending_error = Some(err);
                    break;
                }
                None => {
                    self.rx = None;
                    self.state = CursorState::Exhausted;
                    return Ok(rows);
                }
            }
        }
        self.state = CursorState::Reading;
        Ok(rows)
    }

    /// Stop the producer and release its session.
    ///
    /// Waits briefly for the producer to hand its connection back, then
    /// aborts it. Later reads fail with `Cancelled`.
    pub async fn cancel(&mut self) {
        self.token.cancel();
        self.state = CursorState::Cancelled;
        self.rx = None;
        self.producer = None;
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(CANCEL_GRACE, task).await.is_err() {
                warn!("Cursor producer did not stop in time, aborting");
                abort.abort();
            }
        }
        debug!("Cursor cancelled");
    }

    /// Column descriptors, known once the first row has been produced.
    pub fn fields(&self) -> Option<&[ResultField]> {
        self.fields.as_deref()
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Token that cancels this cursor, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for StreamingCursor {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for StreamingCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCursor")
            .field("chunk_size", &self.chunk_size)
            .field("state", &self.state)
            .finish()
    }
}

/// Producer that streams a statement on a dedicated connection of an sqlx pool.
///
/// `$bind` attaches the statement's parameters (`bind_mysql`, `bind_postgres`
/// or `bind_sqlite`). The connection is discarded when the stream is
/// abandoned mid-query or the connection was lost.
macro_rules! sql_row_producer {
    ($pool:expr, $statement:expr, $bind:path, $skip:expr) => {{
        let pool = $pool;
        let statement: $crate::db::params::Statement = $statement;
        let mut skip: u64 = $skip;
        let producer: $crate::db::cursor::Producer =
            Box::new(move |sink: $crate::db::cursor::RowSink| {
                Box::pin(async move {
                    use futures_util::TryStreamExt;
                    use sqlx::Executor;
                    use $crate::db::types::NormalizeRow;

                    let mut conn = tokio::select! {
                        biased;
                        _ = sink.cancelled() => return,
                        conn = $crate::db::pool::acquire(&pool) => match conn {
                            Ok(conn) => conn,
                            Err(e) => {
                                sink.fail(e).await;
                                return;
                            }
                        },
                    };

                    let mut discard = false;
                    {
                        let mut stream = if statement.params.is_empty() {
                            (&mut *conn).fetch(statement.sql.as_str())
                        } else {
                            $bind(sqlx::query(&statement.sql), &statement.params).fetch(&mut *conn)
                        };
                        let mut sent_fields = false;
                        loop {
                            let next = tokio::select! {
                                biased;
                                _ = sink.cancelled() => {
                                    discard = true;
                                    break;
                                }
                                next = stream.try_next() => next,
                            };
                            match next {
                                Ok(Some(row)) => {
                                    if !sent_fields {
                                        sent_fields = true;
                                        if !sink.send_fields(row.fields()).await {
                                            discard = true;
                                            break;
                                        }
                                    }
                                    if skip > 0 {
                                        skip -= 1;
                                        continue;
                                    }
                                    if !sink.send_row(row.to_object()).await {
                                        discard = true;
                                        break;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    let err = $crate::error::DbError::from(e);
                                    discard = err.is_connection_lost();
                                    sink.fail(err).await;
                                    break;
                                }
                            }
                        }
                    }
                    $crate::db::pool::release(conn, discard);
                })
            });
        producer
    }};
}

pub(crate) use sql_row_producer;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_producer(total: usize, sent: Arc<AtomicUsize>) -> Producer {
        Box::new(move |sink: RowSink| {
            Box::pin(async move {
                sink.send_fields(vec![ResultField::new("n", None)]).await;
                for n in 0..total {
                    let mut row = Row::new();
                    row.insert("n".into(), json!(n));
                    if !sink.send_row(row).await {
                        return;
                    }
                    sent.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
    }

    #[tokio::test]
    async fn test_chunks_then_one_empty_read() {
        let sent = Arc::new(AtomicUsize::new(0));
        let mut cursor = StreamingCursor::new(4, counting_producer(10, sent));

        let mut sizes = Vec::new();
        loop {
            let chunk = cursor.read().await.unwrap();
            if chunk.is_empty() {
                break;
            }
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(cursor.state(), CursorState::Exhausted);
        assert!(cursor.read().await.unwrap().is_empty());
        assert_eq!(cursor.fields().unwrap()[0].name, "n");
    }

    #[tokio::test]
    async fn test_exact_multiple_needs_one_more_read() {
        let sent = Arc::new(AtomicUsize::new(0));
        let mut cursor = StreamingCursor::new(5, counting_producer(10, sent));
        assert_eq!(cursor.read().await.unwrap().len(), 5);
        assert_eq!(cursor.read().await.unwrap().len(), 5);
        assert!(cursor.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_producer_waits_for_reader() {
        let sent = Arc::new(AtomicUsize::new(0));
        let mut cursor = StreamingCursor::new(3, counting_producer(100, Arc::clone(&sent)));
        cursor.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.load(Ordering::SeqCst) <= 3);

        cursor.read().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sent.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test]
    async fn test_error_after_partial_chunk() {
        let producer: Producer = Box::new(|sink: RowSink| {
            Box::pin(async move {
                let mut row = Row::new();
                row.insert("n".into(), json!(1));
                sink.send_row(row).await;
                sink.fail(DbError::connection_lost("gone")).await;
            })
        });
        let mut cursor = StreamingCursor::new(10, producer);
        assert_eq!(cursor.read().await.unwrap().len(), 1);
        assert!(matches!(
            cursor.read().await,
            Err(DbError::ConnectionLost { .. })
        ));
        assert!(cursor.read().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_producer() {
        let sent = Arc::new(AtomicUsize::new(0));
        let mut cursor = StreamingCursor::new(2, counting_producer(1_000, Arc::clone(&sent)));
        cursor.read().await.unwrap();
        cursor.cancel().await;

        let after_cancel = sent.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sent.load(Ordering::SeqCst), after_cancel);
        assert_eq!(cursor.state(), CursorState::Cancelled);
        assert!(matches!(cursor.read().await, Err(DbError::Cancelled { .. })));
    }
}
