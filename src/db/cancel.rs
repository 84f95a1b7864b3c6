//! Out-of-band query cancellation.
//!
//! Every query started through `Client::query` gets a [`CancelState`] in the
//! client's [`QueryRegistry`]. The dialect records the server session id it
//! runs on (PostgreSQL backend pid, MySQL connection id); `cancel()` kills
//! that session's statement from a different pooled connection. Dialects
//! without a kill command race the running future against the state's
//! cancellation token instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::client::{Client, DialectClient};
use crate::dispatch_client;
use crate::error::{DbError, DbResult};
use crate::models::{ExecuteOptions, QueryResult};

/// Cancellation bookkeeping of one in-flight query.
#[derive(Debug, Default)]
pub struct CancelState {
    session_id: Mutex<Option<i64>>,
    canceling: AtomicBool,
    token: CancellationToken,
}

impl CancelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<i64> {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_session_id(&self, id: i64) {
        *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    pub fn is_canceling(&self) -> bool {
        self.canceling.load(Ordering::Acquire)
    }

    /// Flag the query as cancelled and wake anything waiting on the token.
    pub fn begin_cancel(&self) {
        self.canceling.store(true, Ordering::Release);
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// In-flight queries of one client, keyed by query id.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    queries: Arc<Mutex<HashMap<Uuid, Arc<CancelState>>>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) -> Arc<CancelState> {
        let state = Arc::new(CancelState::new());
        self.lock().insert(id, Arc::clone(&state));
        state
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<CancelState>> {
        self.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &Uuid) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every query, returning their states so the caller can kill them.
    pub fn drain(&self) -> Vec<Arc<CancelState>> {
        self.lock().drain().map(|(_, state)| state).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<CancelState>>> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map the outcome of a query that may have been cancelled.
///
/// While a cancel is in progress, losing the connection or a server-side
/// "query canceled" error both mean the cancel worked.
pub(crate) fn resolve<T>(result: DbResult<T>, canceling: bool) -> DbResult<T> {
    match result {
        Err(e) if canceling && (e.is_connection_lost() || e.is_query_canceled()) => {
            Err(DbError::cancelled("query"))
        }
        other => other,
    }
}

/// A query that can be executed once and cancelled from elsewhere.
///
/// Share it behind an `Arc` to call [`cancel`](Self::cancel) while
/// [`execute`](Self::execute) runs, or cancel by id through the client.
pub struct CancelableQuery {
    id: Uuid,
    text: String,
    client: DialectClient,
    state: Arc<CancelState>,
}

impl CancelableQuery {
    pub(crate) fn new(client: DialectClient, text: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let state = client.registry().register(id);
        Self {
            id,
            text: text.into(),
            client,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub async fn execute(&self, options: &ExecuteOptions) -> DbResult<Vec<QueryResult>> {
        if self.state.is_canceling() {
            return Err(DbError::cancelled("query"));
        }
        debug!(query_id = %self.id, "Executing cancelable query");
        let result = dispatch_client!(&self.client, c => {
            c.run_cancelable(Arc::clone(&self.state), &self.text, options).await
        });
        resolve(result, self.state.is_canceling())
    }

    pub async fn cancel(&self) -> DbResult<()> {
        debug!(query_id = %self.id, "Cancelling query");
        dispatch_client!(&self.client, c => c.kill(&self.state).await)
    }
}

impl Drop for CancelableQuery {
    fn drop(&mut self) {
        self.client.registry().remove(&self.id);
    }
}

impl std::fmt::Debug for CancelableQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelableQuery")
            .field("id", &self.id)
            .field("canceling", &self.state.is_canceling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_maps_only_during_cancel() {
        let lost = || DbError::connection_lost("server closed the connection");
        assert!(matches!(
            resolve::<()>(Err(lost()), true),
            Err(DbError::Cancelled { .. })
        ));
        assert!(matches!(
            resolve::<()>(Err(lost()), false),
            Err(DbError::ConnectionLost { .. })
        ));

        let canceled = DbError::database("canceling statement", Some("57014".into()), "");
        assert!(matches!(
            resolve::<()>(Err(canceled), true),
            Err(DbError::Cancelled { .. })
        ));

        let syntax = DbError::database("syntax error", Some("42601".into()), "");
        assert!(matches!(
            resolve::<()>(Err(syntax), true),
            Err(DbError::Database { .. })
        ));
    }

    #[test]
    fn test_registry_drain() {
        let registry = QueryRegistry::new();
        let a = Uuid::new_v4();
        registry.register(a);
        registry.register(Uuid::new_v4());
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&a).is_some());

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_begin_cancel_trips_token() {
        let state = CancelState::new();
        state.set_session_id(42);
        assert!(!state.token().is_cancelled());
        state.begin_cancel();
        assert!(state.is_canceling());
        assert!(state.token().is_cancelled());
        assert_eq!(state.session_id(), Some(42));
    }
}
