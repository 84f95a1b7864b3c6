//! Connection pools, scoped acquisition and the connection manager.
//!
//! Each dialect keeps its own concrete pool type (`MySqlPool`, `PgPool`,
//! `SqlitePool`, a shared scylla `Session`) so every column type decodes
//! natively. The [`ConnectionManager`] owns one entry per server id; an entry
//! owns the server's SSH tunnel (through [`TunnelManager`]), its
//! per-database pools and the live client handles built on them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use scylla::Session;
use sqlx::pool::PoolConnection;
use sqlx::{Database, MySqlPool, PgPool, Pool, SqlitePool};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::client::DialectClient;
use crate::db::database_pool::{DatabasePoolConfig, DatabasePoolManager, DatabaseTarget};
use crate::db::tunnel::TunnelManager;
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionInfo, DatabaseType, ServerConfig};

/// Database-specific connection pool.
#[derive(Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    SQLite(SqlitePool),
    /// The scylla session pools connections per node internally.
    Cassandra(Arc<Session>),
}

impl DbPool {
    /// Close the connection pool. Sessions close when the last clone drops.
    pub async fn close(&self) {
        match self {
            DbPool::MySql(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
            DbPool::SQLite(pool) => pool.close().await,
            DbPool::Cassandra(_) => {}
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbPool::MySql(_) => DatabaseType::MySQL,
            DbPool::Postgres(_) => DatabaseType::PostgreSQL,
            DbPool::SQLite(_) => DatabaseType::SQLite,
            DbPool::Cassandra(_) => DatabaseType::Cassandra,
        }
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbPool::MySql(pool) => f.debug_tuple("MySql").field(&pool.size()).finish(),
            DbPool::Postgres(pool) => f.debug_tuple("Postgres").field(&pool.size()).finish(),
            DbPool::SQLite(pool) => f.debug_tuple("SQLite").field(&pool.size()).finish(),
            DbPool::Cassandra(_) => f.write_str("Cassandra"),
        }
    }
}

/// Wait for a pooled connection, bounded by the pool's acquire timeout.
pub async fn acquire<DB: Database>(pool: &Pool<DB>) -> DbResult<PoolConnection<DB>> {
    pool.acquire().await.map_err(|e| match e {
        sqlx::Error::PoolTimedOut => DbError::timeout(
            "connection pool acquire",
            u32::try_from(pool.options().get_acquire_timeout().as_secs()).unwrap_or(u32::MAX),
        ),
        other => DbError::from(other),
    })
}

/// Hand a connection back. A discarded connection is closed instead of recycled.
pub fn release<DB: Database>(mut conn: PoolConnection<DB>, discard: bool) {
    if discard {
        warn!("Discarding pooled connection");
        conn.close_on_drop();
    }
    drop(conn);
}

/// Run `f` on a pooled connection.
///
/// The connection goes back to the pool on success, on error and when the
/// returned future is dropped. A connection abandoned mid-statement (lost,
/// timed out or cancelled) is closed, never recycled.
pub async fn with_connection<DB, T, F>(pool: &Pool<DB>, f: F) -> DbResult<T>
where
    DB: Database,
    F: for<'c> FnOnce(&'c mut PoolConnection<DB>) -> BoxFuture<'c, DbResult<T>>,
{
    let mut conn = acquire(pool).await?;
    let result = f(&mut conn).await;
    let discard = matches!(
        &result,
        Err(e) if e.is_connection_lost()
            || matches!(e, DbError::Cancelled { .. } | DbError::Timeout { .. })
    );
    release(conn, discard);
    result
}

enum HandleState {
    Connecting,
    Connected(DialectClient),
}

/// One connected (or connecting) database of a server.
struct DatabaseHandle {
    target: DatabaseTarget,
    state: HandleState,
}

struct ServerEntry {
    config: Arc<ServerConfig>,
    /// Built after the tunnel is up so pools dial the local end.
    pools: Arc<OnceCell<Arc<DatabasePoolManager>>>,
    handles: HashMap<DatabaseTarget, DatabaseHandle>,
}

/// Owns every server's tunnel, pools and client handles.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    servers: Arc<RwLock<HashMap<String, ServerEntry>>>,
    tunnels: TunnelManager,
    query_timeout: Duration,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_query_timeout(Duration::from_secs(crate::config::DEFAULT_QUERY_TIMEOUT_SECS))
    }

    /// Default statement timeout handed to every client this manager creates.
    pub fn with_query_timeout(query_timeout: Duration) -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
            tunnels: TunnelManager::new(),
            query_timeout,
        }
    }

    /// Connect to `database` on `config`'s server (the URL's database when `None`).
    ///
    /// Connecting to an already connected database returns the existing client.
    /// On failure everything this call set up is torn down: the handle, the
    /// pool, and the tunnel and server entry when no other database uses them.
    pub async fn connect(
        &self,
        config: ServerConfig,
        database: Option<&str>,
    ) -> DbResult<DialectClient> {
        config
            .pool_options
            .validate()
            .map_err(DbError::configuration)?;

        let target = if config.db_type == DatabaseType::SQLite {
            DatabaseTarget::Server
        } else {
            DatabaseTarget::from_option(database.or(config.database.as_deref()))?
        };
        let server_id = config.id.clone();

        let (server, pools) = {
            let mut servers = self.servers.write().await;
            let entry = servers
                .entry(server_id.clone())
                .or_insert_with(|| ServerEntry {
                    config: Arc::new(config),
                    pools: Arc::new(OnceCell::new()),
                    handles: HashMap::new(),
                });
            let existing = entry.handles.get(&target).map(|h| match &h.state {
                HandleState::Connected(client) => Ok(client.clone()),
                HandleState::Connecting => Err(DbError::still_connecting(&server_id)),
            });
            if let Some(existing) = existing {
                return existing;
            }
            entry.handles.insert(
                target.clone(),
                DatabaseHandle {
                    target: target.clone(),
                    state: HandleState::Connecting,
                },
            );
            (Arc::clone(&entry.config), Arc::clone(&entry.pools))
        };

        info!(
            server_id = %server_id,
            database = %target,
            dialect = %server.db_type,
            tunneled = server.tunnel.is_some(),
            "Connecting"
        );

        match self.establish(&server, &pools, &target).await {
            Ok(client) => {
                let stored = {
                    let mut servers = self.servers.write().await;
                    match servers
                        .get_mut(&server_id)
                        .and_then(|entry| entry.handles.get_mut(&target))
                    {
                        Some(handle) => {
                            handle.state = HandleState::Connected(client.clone());
                            true
                        }
                        None => false,
                    }
                };
                if !stored {
                    // Disconnected while we were connecting
                    client.disconnect().await;
                    return Err(DbError::connection(
                        format!("Connection '{}' was closed while connecting", server_id),
                        "Connect again",
                    ));
                }
                info!(
                    server_id = %server_id,
                    database = %target,
                    server_version = ?client.server_version(),
                    "Connected"
                );
                Ok(client)
            }
            Err(e) => {
                warn!(server_id = %server_id, database = %target, error = %e, "Connect failed");
                self.detach(&server_id, &target).await;
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        server: &Arc<ServerConfig>,
        pools: &OnceCell<Arc<DatabasePoolManager>>,
        target: &DatabaseTarget,
    ) -> DbResult<DialectClient> {
        let manager = pools
            .get_or_try_init(|| async {
                let tunnel = self.tunnels.ensure(server).await?;
                Ok::<_, DbError>(Arc::new(DatabasePoolManager::new(DatabasePoolConfig {
                    base_connection_string: server.connection_string.clone(),
                    db_type: server.db_type,
                    pool_options: server.pool_options.clone(),
                    read_only: server.read_only,
                    tunnel_port: tunnel.map(|t| t.local_port()),
                })))
            })
            .await?;

        let pool = manager.get_or_create_pool(target).await?;
        DialectClient::connect(
            Arc::clone(server),
            target.database().map(String::from),
            pool,
            self.query_timeout,
        )
        .await
    }

    /// Drop the handle of `target`, disconnecting its client, and release the
    /// server's shared resources when it was the last handle.
    async fn detach(&self, server_id: &str, target: &DatabaseTarget) -> bool {
        let (handle, last, pools) = {
            let mut servers = self.servers.write().await;
            let Some(entry) = servers.get_mut(server_id) else {
                return false;
            };
            let handle = entry.handles.remove(target);
            let pools = Arc::clone(&entry.pools);
            let last = entry.handles.is_empty();
            if last {
                servers.remove(server_id);
            }
            (handle, last, pools)
        };

        let found = handle.is_some();
        if let Some(DatabaseHandle {
            state: HandleState::Connected(client),
            target,
        }) = handle
        {
            debug!(server_id = %server_id, database = %target, "Disconnecting client");
            client.disconnect().await;
        }

        if let Some(manager) = pools.get() {
            if last {
                manager.close_all().await;
            } else {
                manager.remove_pool(target).await;
            }
        }
        if last {
            self.tunnels.close(server_id).await;
            info!(server_id = %server_id, "Server disconnected");
        }
        found
    }

    /// Disconnect one database of a server.
    pub async fn disconnect(&self, server_id: &str, database: Option<&str>) -> DbResult<()> {
        let target = self.resolve_target(server_id, database).await?;
        if self.detach(server_id, &target).await {
            info!(server_id = %server_id, database = %target, "Disconnected");
            Ok(())
        } else {
            Err(DbError::connection_not_found(server_id))
        }
    }

    /// Disconnect every database of a server and close its tunnel.
    pub async fn disconnect_server(&self, server_id: &str) -> DbResult<()> {
        let targets: Vec<DatabaseTarget> = {
            let servers = self.servers.read().await;
            let entry = servers
                .get(server_id)
                .ok_or_else(|| DbError::connection_not_found(server_id))?;
            entry.handles.keys().cloned().collect()
        };
        for target in targets {
            self.detach(server_id, &target).await;
        }
        Ok(())
    }

    /// Drop and re-establish one database connection with the same config.
    pub async fn reconnect(
        &self,
        server_id: &str,
        database: Option<&str>,
    ) -> DbResult<DialectClient> {
        let config = {
            let servers = self.servers.read().await;
            let entry = servers
                .get(server_id)
                .ok_or_else(|| DbError::connection_not_found(server_id))?;
            ServerConfig::clone(&entry.config)
        };
        self.disconnect(server_id, database).await?;
        self.connect(config, database).await
    }

    /// Connected client of `server_id` for `database`.
    pub async fn get_client(
        &self,
        server_id: &str,
        database: Option<&str>,
    ) -> DbResult<DialectClient> {
        let target = self.resolve_target(server_id, database).await?;
        let servers = self.servers.read().await;
        match servers
            .get(server_id)
            .and_then(|entry| entry.handles.get(&target))
            .map(|h| &h.state)
        {
            Some(HandleState::Connected(client)) => Ok(client.clone()),
            Some(HandleState::Connecting) => Err(DbError::still_connecting(server_id)),
            None => Err(DbError::connection_not_found(server_id)),
        }
    }

    /// Every connected database, across servers.
    pub async fn list_connections(&self) -> Vec<ConnectionInfo> {
        let servers = self.servers.read().await;
        servers
            .values()
            .flat_map(|entry| entry.handles.values())
            .filter_map(|handle| match &handle.state {
                HandleState::Connected(client) => Some(client.info()),
                HandleState::Connecting => None,
            })
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.list_connections().await.len()
    }

    /// Disconnect everything.
    pub async fn close_all(&self) {
        let server_ids: Vec<String> = {
            let servers = self.servers.read().await;
            servers.keys().cloned().collect()
        };
        for id in server_ids {
            if let Err(e) = self.disconnect_server(&id).await {
                debug!(server_id = %id, error = %e, "Server already gone");
            }
        }
        info!("All connections closed");
    }

    async fn resolve_target(
        &self,
        server_id: &str,
        database: Option<&str>,
    ) -> DbResult<DatabaseTarget> {
        let servers = self.servers.read().await;
        let entry = servers
            .get(server_id)
            .ok_or_else(|| DbError::connection_not_found(server_id))?;
        if entry.config.db_type == DatabaseType::SQLite {
            return Ok(DatabaseTarget::Server);
        }
        DatabaseTarget::from_option(database.or(entry.config.database.as_deref()))
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("query_timeout", &self.query_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolOptions;

    fn sqlite_server(id: &str, path: &std::path::Path) -> ServerConfig {
        ServerConfig::new(
            id,
            format!("sqlite:{}", path.display()),
            None,
            PoolOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connection_not_found() {
        let manager = ConnectionManager::new();
        let result = manager.get_client("nonexistent", None).await;
        assert!(matches!(result, Err(DbError::ConnectionNotFound { .. })));
        assert!(manager.list_connections().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_reuses_client_and_disconnects() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new();
        let server = sqlite_server("local", &dir.path().join("app.db"));

        manager.connect(server.clone(), None).await.unwrap();
        manager.connect(server, None).await.unwrap();
        assert_eq!(manager.connection_count().await, 1);

        let info = &manager.list_connections().await[0];
        assert_eq!(info.connection_id, "local");
        assert_eq!(info.database_type, DatabaseType::SQLite);
        assert!(!info.tunneled);

        manager.disconnect("local", None).await.unwrap();
        assert_eq!(manager.connection_count().await, 0);
        assert!(manager.servers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConnectionManager::new();
        let server = sqlite_server("broken", &dir.path().join("missing").join("x.db"))
            .read_only(true);

        assert!(manager.connect(server, None).await.is_err());
        assert!(manager.servers.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_with_connection_returns_connection() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        let value: i64 = with_connection(&pool, |conn| {
            Box::pin(async move {
                let v: i64 = sqlx::query_scalar("SELECT 41 + 1")
                    .fetch_one(&mut **conn)
                    .await?;
                Ok(v)
            })
        })
        .await
        .unwrap();
        assert_eq!(value, 42);

        // The single connection is free again
        assert!(acquire(&pool).await.is_ok());
    }
}
