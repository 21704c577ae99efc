//! Dialect-neutral database adapter.
//!
//! The adapter owns the live pool for the whole process. It is built
//! once from a resolved [`DbConfig`]; `connect_with_retry` establishes
//! the pool with bounded backoff, and every later query reads whichever
//! handle is current. Reconnecting replaces the handle wholesale, it is
//! never mutated in place.

use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tokio::sync::RwLock;

use crate::config::{DbConfig, ResolvedConfig};
use crate::{Error, Result};

use super::retry::{classify, FailureClass, RetryPolicy};
use super::row::{from_mysql_row, from_pg_row, Row, SqlValue};
use super::Dialect;

const POOL_MAX_CONNECTIONS: u32 = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One pool, tagged by backend
#[derive(Clone)]
enum DialectPool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

/// Result of a mutating statement
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// MySQL surfaces the generated key on the statement result;
    /// Postgres callers use `RETURNING` instead (see `AuditWriter`).
    pub last_insert_id: Option<u64>,
}

/// Outcome of a one-shot connectivity probe
#[derive(Debug, Clone)]
pub struct TestReport {
    pub ok: bool,
    pub error: Option<String>,
}

/// Process-wide database adapter
pub struct DbAdapter {
    config: DbConfig,
    policy: RetryPolicy,
    pool: RwLock<Option<DialectPool>>,
}

impl DbAdapter {
    pub fn new(config: DbConfig) -> Self {
        let policy = RetryPolicy::with_max_attempts(config.max_attempts);
        Self {
            config,
            policy,
            pool: RwLock::new(None),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.config.dialect
    }

    /// Diagnostics view of the target; never includes the password
    pub fn resolved_config(&self) -> ResolvedConfig {
        self.config.resolved()
    }

    pub async fn is_connected(&self) -> bool {
        self.pool.read().await.is_some()
    }

    /// Establish the pool, retrying transient failures with bounded
    /// backoff. Safe to call again once connected (no-op).
    ///
    /// Credential rejections are terminal on the first sighting: the
    /// process stays up in a disconnected state instead of crash-looping
    /// against a broken password.
    pub async fn connect_with_retry(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let mut attempt: u32 = 0;
        loop {
            tracing::info!(
                dialect = %self.config.dialect,
                host = %self.config.host,
                port = self.config.port,
                database = %self.config.database,
                user = %self.config.user,
                tls = self.config.tls,
                "Attempting database connection"
            );
            match self.try_connect().await {
                Ok(pool) => {
                    *self.pool.write().await = Some(pool);
                    tracing::info!(
                        dialect = %self.config.dialect,
                        database = %self.config.database,
                        "Connected to database"
                    );
                    return Ok(());
                }
                Err(err) => match classify(self.config.dialect, &err) {
                    FailureClass::Credential => {
                        tracing::error!(
                            user = %self.config.user,
                            "Database rejected credentials; not retrying. \
                             Fix DB_USER/DB_PASSWORD (or DATABASE_URL) and restart."
                        );
                        return Err(Error::CredentialsRejected {
                            user: self.config.user.clone(),
                        });
                    }
                    FailureClass::Retryable => {
                        let attempts_made = attempt + 1;
                        if attempts_made >= self.policy.max_attempts {
                            tracing::error!(
                                attempts = attempts_made,
                                error = %err,
                                "Connection retries exhausted; operator action required"
                            );
                            return Err(Error::RetriesExhausted {
                                attempts: attempts_made,
                                last: err.to_string(),
                            });
                        }
                        let delay = self.policy.delay_for(attempt);
                        tracing::warn!(
                            error = %err,
                            "Connection failed; retrying in {}s",
                            delay.as_secs()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                },
            }
        }
    }

    async fn try_connect(&self) -> sqlx::Result<DialectPool> {
        let pool = self.build_pool(POOL_MAX_CONNECTIONS).await?;
        // Probe so a pool pointing at a dead server fails here, not on
        // the first real query.
        match &pool {
            DialectPool::MySql(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
            DialectPool::Postgres(p) => {
                sqlx::query("SELECT 1").execute(p).await?;
            }
        }
        Ok(pool)
    }

    async fn build_pool(&self, max_connections: u32) -> sqlx::Result<DialectPool> {
        let cfg = &self.config;
        match cfg.dialect {
            Dialect::MySql => {
                let options = MySqlConnectOptions::new()
                    .host(&cfg.host)
                    .port(cfg.port)
                    .username(&cfg.user)
                    .password(&cfg.password)
                    .database(&cfg.database)
                    .ssl_mode(if cfg.tls {
                        MySqlSslMode::Required
                    } else {
                        MySqlSslMode::Preferred
                    });
                let pool = MySqlPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(options)
                    .await?;
                Ok(DialectPool::MySql(pool))
            }
            Dialect::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&cfg.host)
                    .port(cfg.port)
                    .username(&cfg.user)
                    .password(&cfg.password)
                    .database(&cfg.database)
                    .ssl_mode(if cfg.tls {
                        PgSslMode::Require
                    } else {
                        PgSslMode::Prefer
                    });
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(options)
                    .await?;
                Ok(DialectPool::Postgres(pool))
            }
        }
    }

    fn current_pool(&self, guard: &Option<DialectPool>) -> Result<DialectPool> {
        guard.clone().ok_or(Error::NotConnected)
    }

    /// Run a neutral-SQL query and return normalized rows.
    ///
    /// Query-level errors are returned to the caller as-is; the adapter
    /// never retries individual statements.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        let pool = self.current_pool(&*self.pool.read().await)?;
        tracing::debug!(sql, params = params.len(), "query");
        match pool {
            DialectPool::MySql(p) => {
                let native = Dialect::MySql.rewrite_placeholders(sql, params.len())?;
                let rows = bind_mysql(&native, params).fetch_all(&p).await?;
                Ok(rows.iter().map(from_mysql_row).collect())
            }
            DialectPool::Postgres(p) => {
                let native = Dialect::Postgres.rewrite_placeholders(sql, params.len())?;
                let rows = bind_pg(&native, params).fetch_all(&p).await?;
                Ok(rows.iter().map(from_pg_row).collect())
            }
        }
    }

    /// Run a mutating neutral-SQL statement
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        let pool = self.current_pool(&*self.pool.read().await)?;
        tracing::debug!(sql, params = params.len(), "execute");
        match pool {
            DialectPool::MySql(p) => {
                let native = Dialect::MySql.rewrite_placeholders(sql, params.len())?;
                let done = bind_mysql(&native, params).execute(&p).await?;
                Ok(ExecResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id: Some(done.last_insert_id()),
                })
            }
            DialectPool::Postgres(p) => {
                let native = Dialect::Postgres.rewrite_placeholders(sql, params.len())?;
                let done = bind_pg(&native, params).execute(&p).await?;
                Ok(ExecResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id: None,
                })
            }
        }
    }

    /// Start a transaction for the one multi-statement write path
    pub async fn begin(&self) -> Result<DbTransaction> {
        let pool = self.current_pool(&*self.pool.read().await)?;
        let inner = match pool {
            DialectPool::MySql(p) => TxInner::MySql(p.begin().await?),
            DialectPool::Postgres(p) => TxInner::Postgres(p.begin().await?),
        };
        Ok(DbTransaction { inner })
    }

    /// One ad-hoc connection plus a trivial probe, torn down in every
    /// outcome. Never touches the long-lived pool or its retry state.
    pub async fn test_once(&self) -> TestReport {
        match self.build_pool(1).await {
            Ok(pool) => {
                let probe = match &pool {
                    DialectPool::MySql(p) => {
                        sqlx::query("SELECT 1").execute(p).await.map(|_| ())
                    }
                    DialectPool::Postgres(p) => {
                        sqlx::query("SELECT 1").execute(p).await.map(|_| ())
                    }
                };
                match &pool {
                    DialectPool::MySql(p) => p.close().await,
                    DialectPool::Postgres(p) => p.close().await,
                }
                match probe {
                    Ok(()) => TestReport { ok: true, error: None },
                    Err(err) => TestReport {
                        ok: false,
                        error: Some(err.to_string()),
                    },
                }
            }
            Err(err) => TestReport {
                ok: false,
                error: Some(err.to_string()),
            },
        }
    }
}

enum TxInner {
    MySql(sqlx::Transaction<'static, sqlx::MySql>),
    Postgres(sqlx::Transaction<'static, sqlx::Postgres>),
}

/// An open transaction on the adapter's pool. Dropping without commit
/// rolls back.
pub struct DbTransaction {
    inner: TxInner,
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbTransaction").finish_non_exhaustive()
    }
}

impl DbTransaction {
    pub async fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>> {
        match &mut self.inner {
            TxInner::MySql(tx) => {
                let native = Dialect::MySql.rewrite_placeholders(sql, params.len())?;
                let rows = bind_mysql(&native, params).fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(from_mysql_row).collect())
            }
            TxInner::Postgres(tx) => {
                let native = Dialect::Postgres.rewrite_placeholders(sql, params.len())?;
                let rows = bind_pg(&native, params).fetch_all(&mut **tx).await?;
                Ok(rows.iter().map(from_pg_row).collect())
            }
        }
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<ExecResult> {
        match &mut self.inner {
            TxInner::MySql(tx) => {
                let native = Dialect::MySql.rewrite_placeholders(sql, params.len())?;
                let done = bind_mysql(&native, params).execute(&mut **tx).await?;
                Ok(ExecResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id: Some(done.last_insert_id()),
                })
            }
            TxInner::Postgres(tx) => {
                let native = Dialect::Postgres.rewrite_placeholders(sql, params.len())?;
                let done = bind_pg(&native, params).execute(&mut **tx).await?;
                Ok(ExecResult {
                    rows_affected: done.rows_affected(),
                    last_insert_id: None,
                })
            }
        }
    }

    pub async fn commit(self) -> Result<()> {
        match self.inner {
            TxInner::MySql(tx) => tx.commit().await?,
            TxInner::Postgres(tx) => tx.commit().await?,
        }
        Ok(())
    }

    pub async fn rollback(self) -> Result<()> {
        match self.inner {
            TxInner::MySql(tx) => tx.rollback().await?,
            TxInner::Postgres(tx) => tx.rollback().await?,
        }
        Ok(())
    }
}

fn bind_mysql<'q>(
    sql: &'q str,
    params: &[SqlValue],
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    let mut q = sqlx::query(sql);
    for p in params {
        q = match p {
            SqlValue::Null => q.bind(None::<String>),
            SqlValue::Bool(b) => q.bind(*b),
            SqlValue::Int(i) => q.bind(*i),
            SqlValue::Float(f) => q.bind(*f),
            SqlValue::Text(s) => q.bind(s.clone()),
        };
    }
    q
}

fn bind_pg<'q>(
    sql: &'q str,
    params: &[SqlValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut q = sqlx::query(sql);
    for p in params {
        q = match p {
            SqlValue::Null => q.bind(None::<String>),
            SqlValue::Bool(b) => q.bind(*b),
            SqlValue::Int(i) => q.bind(*i),
            SqlValue::Float(f) => q.bind(*f),
            SqlValue::Text(s) => q.bind(s.clone()),
        };
    }
    q
}
