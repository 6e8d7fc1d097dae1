// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The store handle and its dedicated connection thread.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{StoreError, StoreResult};
use crate::schema;

/// Commands queued to the connection thread.
type StoreTask = Box<dyn FnOnce(&mut Connection) + Send>;

/// Transaction contention retries.
const TXN_ATTEMPTS: u32 = 3;
/// Base delay between contention retries (doubles per attempt).
const TXN_RETRY_BASE: Duration = Duration::from_millis(50);

/// Open-time configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// SQLite busy handler timeout.
    pub busy_timeout: Duration,
    /// WAL size ceiling enforced by [`StagingStore::health_check`].
    pub wal_size_limit_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            wal_size_limit_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Cloneable async handle to the staging store.
#[derive(Clone)]
pub struct StagingStore {
    tx: mpsc::Sender<StoreTask>,
    path: Option<PathBuf>,
    wal_size_limit_bytes: u64,
}

impl StagingStore {
    /// Open (or create) a file-backed store, apply pragmas and schema.
    pub async fn open(path: impl AsRef<Path>, config: StoreConfig) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self::start(Some(path.clone()), config.clone()).await?;
        info!(path = %path.display(), "Staging store opened");
        Ok(store)
    }

    /// Open an in-memory store (tests, local development).
    pub async fn open_in_memory() -> StoreResult<Self> {
        Self::start(None, StoreConfig::default()).await
    }

    async fn start(path: Option<PathBuf>, config: StoreConfig) -> StoreResult<Self> {
        let (tx, mut rx) = mpsc::channel::<StoreTask>(256);
        let (ready_tx, ready_rx) = oneshot::channel::<StoreResult<()>>();

        let thread_path = path.clone();
        std::thread::Builder::new()
            .name("codegraph-store".to_string())
            .spawn(move || {
                let open_result = (|| -> StoreResult<Connection> {
                    let conn = match &thread_path {
                        Some(p) => Connection::open(p)?,
                        None => {
                            warn!("Staging store in memory - DATA WILL BE LOST on restart");
                            Connection::open_in_memory()?
                        }
                    };
                    if thread_path.is_some() {
                        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
                    }
                    conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
                    conn.busy_timeout(config.busy_timeout)?;
                    schema::apply(&conn)?;
                    Ok(conn)
                })();

                let mut conn = match open_result {
                    Ok(conn) => {
                        let _ = ready_tx.send(Ok(()));
                        conn
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Process tasks serially until every handle is dropped.
                while let Some(task) = rx.blocking_recv() {
                    task(&mut conn);
                }
                debug!("Staging store thread exiting");
            })
            .map_err(|e| StoreError::Sqlite(format!("failed to spawn store thread: {e}")))?;

        ready_rx.await.map_err(|_| StoreError::Closed)??;
        Ok(Self {
            tx,
            path,
            wal_size_limit_bytes: config.wal_size_limit_bytes,
        })
    }

    /// Run `f` on the connection thread and await its result.
    pub async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: StoreTask = Box::new(move |conn| {
            let result = f(conn);
            if tx.send(result).is_err() {
                debug!("Store result dropped (caller went away)");
            }
        });
        self.tx.send(task).await.map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Run `f` inside a transaction, retrying on contention with exponential
    /// backoff (up to three attempts). `f` may run more than once and must
    /// not have side effects outside the transaction.
    pub async fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: Fn(&rusqlite::Transaction<'_>) -> StoreResult<T> + Send + 'static,
    {
        self.with_conn(move |conn| {
            let mut attempt = 0;
            loop {
                let result = (|| {
                    let tx = conn.transaction()?;
                    let value = f(&tx)?;
                    tx.commit()?;
                    Ok(value)
                })();
                match result {
                    Err(StoreError::Busy(reason)) if attempt + 1 < TXN_ATTEMPTS => {
                        let delay = TXN_RETRY_BASE * 2u32.pow(attempt);
                        warn!(attempt = attempt + 1, reason = %reason, delay_ms = delay.as_millis() as u64, "Transaction contention; retrying");
                        std::thread::sleep(delay);
                        attempt += 1;
                    }
                    other => return other,
                }
            }
        })
        .await
    }

    /// `SELECT 1` plus a WAL-size ceiling check.
    pub async fn health_check(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await?;

        if let Some(path) = &self.path {
            let wal_path = PathBuf::from(format!("{}-wal", path.display()));
            if let Ok(meta) = std::fs::metadata(&wal_path) {
                if meta.len() > self.wal_size_limit_bytes {
                    return Err(StoreError::Sqlite(format!(
                        "WAL size {} exceeds ceiling {}",
                        meta.len(),
                        self.wal_size_limit_bytes
                    )));
                }
            }
        }
        Ok(())
    }

    /// Passive WAL checkpoint.
    pub async fn checkpoint(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            // wal_checkpoint is a reading pragma: it returns (busy, log, checkpointed).
            conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    /// Refresh query-planner statistics.
    pub async fn analyze(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("ANALYZE")?;
            Ok(())
        })
        .await
    }

    /// Reclaim free pages. Expensive; scheduled far less often than analyze.
    pub async fn vacuum(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch("VACUUM")?;
            Ok(())
        })
        .await
    }

    /// Periodic maintenance: checkpoint + analyze every interval, vacuum
    /// every twelfth pass, until `shutdown` flips to true.
    pub async fn run_maintenance(
        &self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut passes: u64 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    passes += 1;
                    if let Err(e) = self.checkpoint().await {
                        warn!(error = %e, "WAL checkpoint failed");
                    }
                    if let Err(e) = self.analyze().await {
                        warn!(error = %e, "ANALYZE failed");
                    }
                    if passes % 12 == 0 {
                        if let Err(e) = self.vacuum().await {
                            warn!(error = %e, "VACUUM failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
