use anyhow::Result;
use rusqlite::Connection;

/// Synchronous database handle for short-lived CLI commands.
pub struct Database {
    pub conn: Connection,
}

/// Async database wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open a database at `path`, set PRAGMAs (WAL, busy_timeout) and run
    /// the idempotent schema, all on the background thread.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;
        conn.call(|conn| -> std::result::Result<(), rusqlite::Error> {
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("AsyncDb::open: {e}"))?;

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records latency and error metrics for the
    /// named operation. Measures full wall-clock time, including queueing
    /// on the dedicated SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "portfolio_store_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "portfolio_store_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("portfolio_store_errors_total", "op" => op).increment(1);
            }
        }

        res
    }
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

// Amounts and prices are stored as TEXT so Decimal values round-trip
// exactly; REAL columns would re-introduce float drift into valuations.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS token_cache (
    account TEXT NOT NULL,             -- lowercased account address
    chain TEXT NOT NULL,
    token_id TEXT NOT NULL,            -- lowercased contract address or native id
    symbol TEXT,
    name TEXT,
    decimals INTEGER,
    amount TEXT NOT NULL,
    price TEXT,
    is_core INTEGER NOT NULL DEFAULT 0,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(account, chain, token_id)
);

CREATE TABLE IF NOT EXISTS customized_tokens (
    account TEXT NOT NULL,
    chain TEXT NOT NULL,
    token_id TEXT NOT NULL,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(account, chain, token_id)
);

CREATE TABLE IF NOT EXISTS blocked_tokens (
    account TEXT NOT NULL,
    chain TEXT NOT NULL,
    token_id TEXT NOT NULL,
    added_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(account, chain, token_id)
);

CREATE INDEX IF NOT EXISTS idx_token_cache_account ON token_cache(account);
CREATE INDEX IF NOT EXISTS idx_customized_tokens_account ON customized_tokens(account);
CREATE INDEX IF NOT EXISTS idx_blocked_tokens_account ON blocked_tokens(account);
"#;
