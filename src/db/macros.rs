//! Dispatch macros for the per-dialect enums.
//!
//! Both expand to a plain `match`, so every dialect arm stays visible at the
//! call site's type level with no dynamic dispatch.

/// Match on a `DbPool`, binding the concrete pool of each arm.
///
/// ```ignore
/// impl_db_dispatch!(pool, {
///     MySql(p) => do_mysql(p),
///     Postgres(p) => do_postgres(p),
///     SQLite(p) => do_sqlite(p),
///     Cassandra(s) => do_cql(s),
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($pool:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $pool {
            $(
                $crate::db::pool::DbPool::$variant($p) => $body,
            )+
        }
    };
}

/// Forward an expression to whichever dialect client a `DialectClient` holds.
///
/// ```ignore
/// dispatch_client!(self, c => c.run_cancelable(state, sql, options).await)
/// ```
#[macro_export]
macro_rules! dispatch_client {
    ($client:expr, $c:ident => $body:expr) => {
        match $client {
            $crate::client::DialectClient::Postgres($c) => $body,
            $crate::client::DialectClient::MySql($c) => $body,
            $crate::client::DialectClient::Sqlite($c) => $body,
            $crate::client::DialectClient::Cassandra($c) => $body,
        }
    };
}

pub use dispatch_client;
pub use impl_db_dispatch;

#[cfg(test)]
mod tests {
    use crate::db::pool::DbPool;
    use crate::models::DatabaseType;

    fn dialect_name(pool: &DbPool) -> &'static str {
        impl_db_dispatch!(pool, {
            MySql(_p) => "mysql",
            Postgres(_p) => "postgres",
            SQLite(_p) => "sqlite",
            Cassandra(_s) => "cassandra",
        })
    }

    #[tokio::test]
    async fn test_impl_db_dispatch_picks_variant() {
        let pool = DbPool::SQLite(sqlx::SqlitePool::connect_lazy("sqlite::memory:").unwrap());
        assert_eq!(dialect_name(&pool), "sqlite");
        assert_eq!(pool.db_type(), DatabaseType::SQLite);
    }
}
