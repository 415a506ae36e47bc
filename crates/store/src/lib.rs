//! Transactional persistence for all entities.
//!
//! One `Store` serves both engines: the embedded single-file SQLite
//! database and a PostgreSQL server, selected by connection URL. All SQL
//! uses `$n` placeholders, valid in both dialects, and every statement
//! goes through the retry/slow-query instrumentation in this module.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::config::{DatabaseType, UnifiedConfig};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row};
use tracing::{debug, info, warn};

pub mod error;
mod schema;

mod articles;
mod files;
mod folders;
mod health;
mod queue;
mod segments;
mod shares;

pub use error::{QueryErrorKind, Result, StoreError};
pub use files::FileScan;
pub use health::ServerHealthRow;

/// Underlying engine, derived from the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Retry policy for busy/locked errors.
const BUSY_MAX_ATTEMPTS: u32 = 5;
const BUSY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Queries slower than this land in the diagnostic ring buffer.
const SLOW_QUERY_THRESHOLD: Duration = Duration::from_secs(1);
const SLOW_QUERY_RING: usize = 100;

#[derive(Debug, Clone)]
pub struct SlowQuery {
    pub sql: String,
    pub elapsed_ms: u64,
}

/// Dynamically-typed bind argument. The Any driver carries scalars only;
/// binary payloads are stored hex/base64 TEXT.
#[derive(Debug, Clone)]
pub enum Arg {
    Int(i64),
    Real(f64),
    Text(String),
    OptInt(Option<i64>),
    OptText(Option<String>),
}

impl From<i64> for Arg {
    fn from(v: i64) -> Self {
        Arg::Int(v)
    }
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<u64> for Arg {
    fn from(v: u64) -> Self {
        Arg::Int(v as i64)
    }
}

impl From<f64> for Arg {
    fn from(v: f64) -> Self {
        Arg::Real(v)
    }
}

impl From<String> for Arg {
    fn from(v: String) -> Self {
        Arg::Text(v)
    }
}

impl From<&str> for Arg {
    fn from(v: &str) -> Self {
        Arg::Text(v.to_string())
    }
}

impl From<Option<i64>> for Arg {
    fn from(v: Option<i64>) -> Self {
        Arg::OptInt(v)
    }
}

impl From<Option<String>> for Arg {
    fn from(v: Option<String>) -> Self {
        Arg::OptText(v)
    }
}

fn bind_args<'q>(sql: &'q str, args: &'q [Arg]) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(sql);
    for arg in args {
        query = match arg {
            Arg::Int(v) => query.bind(*v),
            Arg::Real(v) => query.bind(*v),
            Arg::Text(v) => query.bind(v.as_str()),
            Arg::OptInt(v) => query.bind(*v),
            Arg::OptText(v) => query.bind(v.as_deref()),
        };
    }
    query
}

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
    slow: Arc<Mutex<VecDeque<SlowQuery>>>,
}

impl Store {
    /// Open the engine selected by configuration and migrate the schema.
    pub async fn open(config: &UnifiedConfig) -> Result<Self> {
        let url = config.database_url();
        let max_connections = match config.database_type {
            DatabaseType::Embedded => 8,
            DatabaseType::Server => 16,
        };
        Self::connect(&url, max_connections).await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let dialect = if url.starts_with("sqlite") {
            Dialect::Sqlite
        } else {
            Dialect::Postgres
        };

        let options = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30));

        let options = if dialect == Dialect::Sqlite {
            // WAL with relaxed sync and a 256 MiB map, applied per
            // connection; busy_timeout keeps writer contention bounded
            // before our own retry loop kicks in.
            options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA synchronous=NORMAL").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA mmap_size=268435456").execute(&mut *conn).await?;
                    sqlx::query("PRAGMA busy_timeout=5000").execute(&mut *conn).await?;
                    Ok(())
                }) as BoxFuture<'_, std::result::Result<(), sqlx::Error>>
            })
        } else {
            options
        };

        let pool = options
            .connect(url)
            .await
            .map_err(|e| error::map_sqlx(e, url))?;

        let store = Self {
            pool,
            dialect,
            slow: Arc::new(Mutex::new(VecDeque::with_capacity(SLOW_QUERY_RING))),
        };
        store.migrate().await?;
        info!(?dialect, "store ready");
        Ok(store)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Create the complete schema if absent; safe to run on every start.
    pub async fn migrate(&self) -> Result<()> {
        for statement in schema::statements(self.dialect) {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(format!("{e}: {}", &statement[..60.min(statement.len())])))?;
        }
        debug!("schema migration complete");
        Ok(())
    }

    /// Snapshot of the slow-query ring, newest last.
    pub fn slow_queries(&self) -> Vec<SlowQuery> {
        self.slow.lock().iter().cloned().collect()
    }

    fn observe(&self, sql: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed >= SLOW_QUERY_THRESHOLD {
            let mut ring = self.slow.lock();
            if ring.len() == SLOW_QUERY_RING {
                ring.pop_front();
            }
            let entry = SlowQuery {
                sql: sql.chars().take(120).collect(),
                elapsed_ms: elapsed.as_millis() as u64,
            };
            warn!(sql = %entry.sql, elapsed_ms = entry.elapsed_ms, "slow query");
            ring.push_back(entry);
        }
    }

    fn is_busy(err: &StoreError) -> bool {
        matches!(
            err,
            StoreError::Query {
                kind: QueryErrorKind::Busy,
                ..
            }
        )
    }

    /// Execute a statement, retrying transient busy/locked errors with
    /// exponential backoff.
    pub(crate) async fn execute(&self, sql: &str, args: &[Arg]) -> Result<u64> {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            match bind_args(sql, args).execute(&self.pool).await {
                Ok(done) => {
                    self.observe(sql, started);
                    return Ok(done.rows_affected());
                }
                Err(e) => {
                    let mapped = error::map_sqlx(e, sql);
                    attempt += 1;
                    if Self::is_busy(&mapped) && attempt < BUSY_MAX_ATTEMPTS {
                        let delay = BUSY_BASE_DELAY * 2u32.pow(attempt - 1);
                        debug!(attempt, ?delay, "retrying busy statement");
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    if Self::is_busy(&mapped) {
                        return Err(StoreError::BusyExhausted { attempts: attempt });
                    }
                    return Err(mapped);
                }
            }
        }
    }

    pub(crate) async fn fetch_all(&self, sql: &str, args: &[Arg]) -> Result<Vec<AnyRow>> {
        let started = Instant::now();
        let rows = bind_args(sql, args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| error::map_sqlx(e, sql))?;
        self.observe(sql, started);
        Ok(rows)
    }

    pub(crate) async fn fetch_optional(&self, sql: &str, args: &[Arg]) -> Result<Option<AnyRow>> {
        let started = Instant::now();
        let row = bind_args(sql, args)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| error::map_sqlx(e, sql))?;
        self.observe(sql, started);
        Ok(row)
    }

    pub(crate) async fn fetch_scalar_i64(&self, sql: &str, args: &[Arg]) -> Result<i64> {
        let row = self
            .fetch_optional(sql, args)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "scalar",
                key: String::new(),
            })?;
        row.try_get::<i64, _>(0).map_err(|e| error::map_sqlx(e, sql))
    }

    /// Begin an explicit transaction. Nested scopes are savepoints.
    pub async fn begin(&self) -> Result<StoreTx> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| error::map_sqlx(e, "BEGIN"))?;
        Ok(StoreTx { tx, depth: 0 })
    }

    /// Checkpoint the WAL so a file-copy backup sees a complete database.
    /// No-op on the server engine.
    pub async fn checkpoint(&self) -> Result<()> {
        if self.dialect == Dialect::Sqlite {
            self.execute("PRAGMA wal_checkpoint(TRUNCATE)", &[]).await?;
        }
        Ok(())
    }
}

pub struct StoreTx {
    tx: sqlx::Transaction<'static, Any>,
    depth: u32,
}

impl StoreTx {
    pub async fn execute(&mut self, sql: &str, args: &[Arg]) -> Result<u64> {
        bind_args(sql, args)
            .execute(&mut *self.tx)
            .await
            .map(|done| done.rows_affected())
            .map_err(|e| error::map_sqlx(e, sql))
    }

    /// Open a named savepoint; pair with [`release`] or [`rollback_to`].
    pub async fn savepoint(&mut self) -> Result<String> {
        self.depth += 1;
        let name = format!("sp_{}", self.depth);
        let sql = format!("SAVEPOINT {name}");
        self.execute(&sql, &[]).await?;
        Ok(name)
    }

    pub async fn release(&mut self, name: &str) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {name}");
        self.execute(&sql, &[]).await?;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    pub async fn rollback_to(&mut self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO SAVEPOINT {name}");
        self.execute(&sql, &[]).await?;
        self.depth = self.depth.saturating_sub(1);
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| error::map_sqlx(e, "COMMIT"))
    }

    pub async fn rollback(self) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| error::map_sqlx(e, "ROLLBACK"))
    }
}

// Row decoding helpers shared by the entity modules.

pub(crate) fn col_i64(row: &AnyRow, name: &str) -> Result<i64> {
    row.try_get::<i64, _>(name)
        .map_err(|e| StoreError::CorruptRow {
            entity: "row",
            reason: format!("{name}: {e}"),
        })
}

pub(crate) fn col_opt_i64(row: &AnyRow, name: &str) -> Result<Option<i64>> {
    row.try_get::<Option<i64>, _>(name)
        .map_err(|e| StoreError::CorruptRow {
            entity: "row",
            reason: format!("{name}: {e}"),
        })
}

pub(crate) fn col_f64(row: &AnyRow, name: &str) -> Result<f64> {
    row.try_get::<f64, _>(name)
        .map_err(|e| StoreError::CorruptRow {
            entity: "row",
            reason: format!("{name}: {e}"),
        })
}

pub(crate) fn col_text(row: &AnyRow, name: &str) -> Result<String> {
    row.try_get::<String, _>(name)
        .map_err(|e| StoreError::CorruptRow {
            entity: "row",
            reason: format!("{name}: {e}"),
        })
}

pub(crate) fn col_opt_text(row: &AnyRow, name: &str) -> Result<Option<String>> {
    row.try_get::<Option<String>, _>(name)
        .map_err(|e| StoreError::CorruptRow {
            entity: "row",
            reason: format!("{name}: {e}"),
        })
}

/// Rows-per-chunk for multi-row inserts, kept under SQLite's default
/// bind-variable ceiling.
pub(crate) fn insert_chunk_rows(columns: usize) -> usize {
    (900 / columns).max(1)
}
