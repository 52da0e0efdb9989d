//! SQLite-backed metrics store using sqlx.

use std::{str::FromStr, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqliteConnection, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    },
    tracing::{debug, info},
};

use crate::{
    Error, Result,
    backend::{Lifecycle, MetricsBackend},
    model::{MetricKind, MetricUpdate, MetricValue, MetricsSnapshot},
    retry::{ErrorClass, RetryError, RetryPolicy, Sleep, TokioSleep, retry},
};

/// Run the storage migrations against `pool`.
pub async fn run_migrations(pool: &SqlitePool) -> std::result::Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// SQLite primary result codes worth retrying: BUSY and LOCKED.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Whether a database error code names a condition that may clear on its own.
///
/// SQLite reports extended result codes as decimal strings; servers speaking
/// SQLSTATE report serialization failures, deadlocks and connection loss.
fn is_transient_code(code: &str) -> bool {
    if is_transient_sqlstate(code) {
        return true;
    }
    code.parse::<i64>()
        .is_ok_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

/// Serialization failure, deadlock, or any connection exception (class 08).
fn is_transient_sqlstate(code: &str) -> bool {
    code.len() == 5 && (matches!(code, "40001" | "40P01") || code.starts_with("08"))
}

fn classify(error: &sqlx::Error) -> ErrorClass {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => ErrorClass::Transient,
        sqlx::Error::Database(db) if db.code().is_some_and(|c| is_transient_code(&c)) => {
            ErrorClass::Transient
        },
        _ => ErrorClass::Terminal,
    }
}

/// Failure of one attempt, before it is mapped onto [`Error`].
#[derive(Debug, thiserror::Error)]
enum Failure {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error("counter {0} overflows")]
    Overflow(String),

    #[error("item {index} ({name}): {source}")]
    Item {
        index: usize,
        name: String,
        #[source]
        source: Box<Failure>,
    },
}

impl Failure {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Sql(e) => classify(e),
            Self::Overflow(_) => ErrorClass::Terminal,
            Self::Item { source, .. } => source.class(),
        }
    }

    /// `attempts` is set when the retry policy ran out on a transient error.
    fn into_error(self, attempts: Option<u32>) -> Error {
        match self {
            Self::Sql(sqlx::Error::PoolClosed) => Error::BackendClosed,
            Self::Sql(source) => match attempts {
                Some(attempts) => Error::TransientStorage { attempts, source },
                None => Error::TerminalStorage { source },
            },
            Self::Overflow(name) => {
                Error::invalid_value(MetricKind::Counter, format!("{name} overflows"))
            },
            Self::Item {
                index,
                name,
                source,
            } => Error::batch_item(index, name, source.into_error(attempts)),
        }
    }
}

impl From<RetryError<Failure>> for Error {
    fn from(err: RetryError<Failure>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => source.into_error(Some(attempts)),
            RetryError::Terminal(source) => source.into_error(None),
        }
    }
}

fn is_in_memory(dsn: &str) -> bool {
    dsn.contains(":memory:") || dsn.contains("mode=memory")
}

/// Relational backend. Every operation runs in its own transaction on a
/// pooled connection; transient failures are retried per [`RetryPolicy`].
pub struct SqliteBackend {
    pool: SqlitePool,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleep>,
    lifecycle: Lifecycle,
}

impl SqliteBackend {
    /// Connect to `dsn` and create the schema if needed.
    ///
    /// The connect and migration step is itself retried per `policy`.
    pub async fn connect(dsn: &str, policy: RetryPolicy) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .map_err(|source| Error::TerminalStorage { source })?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        // A private in-memory database lives only as long as its connection.
        let pool_options = if is_in_memory(dsn) {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .acquire_timeout(Duration::from_secs(5));

        let pool = retry(&policy, &TokioSleep, Failure::class, || async {
            let pool = pool_options.clone().connect_with(options.clone()).await?;
            run_migrations(&pool).await?;
            Ok::<_, Failure>(pool)
        })
        .await?;

        info!("connected to metrics database");
        Ok(Self::with_pool(pool, policy))
    }

    /// Use an existing pool. [`run_migrations`] must already have run.
    pub fn with_pool(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            sleeper: Arc::new(TokioSleep),
            lifecycle: Lifecycle::default(),
        }
    }

    #[must_use]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn upsert_once(&self, update: &MetricUpdate) -> std::result::Result<MetricValue, Failure> {
        let mut tx = self.pool.begin().await?;
        let stored = write_update(&mut tx, update).await?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn upsert_batch_once(&self, updates: &[MetricUpdate]) -> std::result::Result<(), Failure> {
        let mut tx = self.pool.begin().await?;
        for (index, update) in updates.iter().enumerate() {
            write_update(&mut tx, update)
                .await
                .map_err(|source| Failure::Item {
                    index,
                    name: update.name.clone(),
                    source: Box::new(source),
                })?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn write_update(
    conn: &mut SqliteConnection,
    update: &MetricUpdate,
) -> std::result::Result<MetricValue, Failure> {
    match update.value {
        MetricValue::Counter(delta) => {
            let row = sqlx::query(
                "INSERT INTO metrics (name, kind, delta) VALUES (?, 'counter', ?)
                 ON CONFLICT(name, kind) DO UPDATE SET delta = metrics.delta + excluded.delta
                 RETURNING delta, typeof(delta) AS storage",
            )
            .bind(&update.name)
            .bind(delta)
            .fetch_one(&mut *conn)
            .await?;
            // SQLite turns an overflowing integer sum into a REAL.
            let storage: String = row.try_get("storage")?;
            if storage != "integer" {
                return Err(Failure::Overflow(update.name.clone()));
            }
            Ok(MetricValue::Counter(row.try_get("delta")?))
        },
        MetricValue::Gauge(value) => {
            sqlx::query(
                "INSERT INTO metrics (name, kind, value) VALUES (?, 'gauge', ?)
                 ON CONFLICT(name, kind) DO UPDATE SET value = excluded.value",
            )
            .bind(&update.name)
            .bind(value)
            .execute(&mut *conn)
            .await?;
            Ok(MetricValue::Gauge(value))
        },
    }
}

fn row_value(kind: MetricKind, row: &SqliteRow) -> std::result::Result<Option<MetricValue>, sqlx::Error> {
    Ok(match kind {
        MetricKind::Counter => row.try_get::<Option<i64>, _>("delta")?.map(MetricValue::Counter),
        MetricKind::Gauge => row.try_get::<Option<f64>, _>("value")?.map(MetricValue::Gauge),
    })
}

#[async_trait]
impl MetricsBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn upsert(&self, update: MetricUpdate) -> Result<MetricValue> {
        let _open = self.lifecycle.enter().await?;
        let stored = retry(&self.policy, self.sleeper.as_ref(), Failure::class, || {
            self.upsert_once(&update)
        })
        .await?;
        debug!(name = %update.name, kind = %update.kind(), value = %stored, "metric updated");
        Ok(stored)
    }

    async fn upsert_batch(&self, updates: Vec<MetricUpdate>) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        retry(&self.policy, self.sleeper.as_ref(), Failure::class, || {
            self.upsert_batch_once(&updates)
        })
        .await?;
        debug!(count = updates.len(), "metric batch committed");
        Ok(())
    }

    async fn get(&self, name: &str, kind: MetricKind) -> Result<Option<MetricValue>> {
        let _open = self.lifecycle.enter().await?;
        let row = retry(&self.policy, self.sleeper.as_ref(), Failure::class, || async {
            let row = sqlx::query("SELECT delta, value FROM metrics WHERE name = ? AND kind = ?")
                .bind(name)
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;
            Ok::<_, Failure>(row)
        })
        .await?;

        match row {
            Some(row) => row_value(kind, &row).map_err(|source| Error::TerminalStorage { source }),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Result<MetricsSnapshot> {
        let _open = self.lifecycle.enter().await?;
        let rows = retry(&self.policy, self.sleeper.as_ref(), Failure::class, || async {
            let rows = sqlx::query("SELECT name, kind, delta, value FROM metrics ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok::<_, Failure>(rows)
        })
        .await?;

        let mut snapshot = MetricsSnapshot::default();
        for row in rows {
            let name: String = row
                .try_get("name")
                .map_err(|source| Error::TerminalStorage { source })?;
            let kind: MetricKind = row
                .try_get::<String, _>("kind")
                .map_err(|source| Error::TerminalStorage { source })?
                .parse()?;
            if let Some(value) =
                row_value(kind, &row).map_err(|source| Error::TerminalStorage { source })?
            {
                snapshot.set(name, value);
            }
        }
        Ok(snapshot)
    }

    async fn health_check(&self) -> Result<()> {
        let _open = self.lifecycle.enter().await?;
        retry(&self.policy, self.sleeper.as_ref(), Failure::class, || async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok::<_, Failure>(())
        })
        .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.close().await {
            self.pool.close().await;
            info!("metrics database closed");
        }
        Ok(())
    }
}
