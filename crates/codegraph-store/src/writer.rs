// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Batched writer.
//!
//! Coalesces writes across the process: rows accumulate until `batch_size`
//! or `flush_interval`, whichever comes first, then flush under a single
//! transaction. A failed flush retries up to `max_retries` with a delay,
//! then surfaces (rows are dropped with an error log and counted, never
//! silently lost in the stats).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use prometheus::{Counter, Histogram, HistogramOpts};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use codegraph::metrics_constants::{METRIC_WRITER_FLUSHES_TOTAL, METRIC_WRITER_FLUSH_ROWS_COUNT};
use codegraph::models::{NewOutboxEvent, Poi, SourceFile};

use crate::errors::{StoreError, StoreResult};
use crate::queries;
use crate::sqlite::StagingStore;

static WRITER_FLUSHES: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(METRIC_WRITER_FLUSHES_TOTAL, "Total batched-writer flushes")
});
static WRITER_FLUSH_ROWS: LazyLock<Histogram> = LazyLock::new(|| {
    codegraph::metrics_utils::histogram(HistogramOpts::new(
        METRIC_WRITER_FLUSH_ROWS_COUNT,
        "Rows written per batched-writer flush",
    ))
});

/// One write submitted to the batched writer.
#[derive(Debug, Clone)]
pub enum WriteCommand {
    Files(Vec<SourceFile>),
    Pois(Vec<Poi>),
    OutboxEvents(Vec<NewOutboxEvent>),
}

/// Writer tuning, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Point-in-time writer stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub file_rows: u64,
    pub poi_rows: u64,
    pub outbox_rows: u64,
    pub flushes: u64,
    pub failed_flushes: u64,
}

#[derive(Default)]
struct StatsInner {
    file_rows: AtomicU64,
    poi_rows: AtomicU64,
    outbox_rows: AtomicU64,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
}

enum Msg {
    Write(WriteCommand),
    Flush(oneshot::Sender<StoreResult<()>>),
}

/// Cloneable handle to the batched writer task.
#[derive(Clone)]
pub struct BatchWriter {
    tx: mpsc::Sender<Msg>,
    stats: Arc<StatsInner>,
}

impl BatchWriter {
    /// Spawn the writer task against `store`.
    #[must_use]
    pub fn spawn(store: StagingStore, config: BatchWriterConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let stats = Arc::new(StatsInner::default());
        tokio::spawn(writer_loop(store, config, rx, Arc::clone(&stats)));
        Self { tx, stats }
    }

    /// Queue rows for the next flush.
    pub async fn submit(&self, command: WriteCommand) -> StoreResult<()> {
        self.tx
            .send(Msg::Write(command))
            .await
            .map_err(|_| StoreError::Closed)
    }

    /// Flush now and wait for the commit.
    pub async fn flush(&self) -> StoreResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Msg::Flush(tx))
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// Writer stats snapshot.
    #[must_use]
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            file_rows: self.stats.file_rows.load(Ordering::Relaxed),
            poi_rows: self.stats.poi_rows.load(Ordering::Relaxed),
            outbox_rows: self.stats.outbox_rows.load(Ordering::Relaxed),
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            failed_flushes: self.stats.failed_flushes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Buffers {
    files: Vec<SourceFile>,
    pois: Vec<Poi>,
    outbox: Vec<NewOutboxEvent>,
}

impl Buffers {
    fn rows(&self) -> usize {
        self.files.len() + self.pois.len() + self.outbox.len()
    }

    fn push(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Files(rows) => self.files.extend(rows),
            WriteCommand::Pois(rows) => self.pois.extend(rows),
            WriteCommand::OutboxEvents(rows) => self.outbox.extend(rows),
        }
    }
}

async fn writer_loop(
    store: StagingStore,
    config: BatchWriterConfig,
    mut rx: mpsc::Receiver<Msg>,
    stats: Arc<StatsInner>,
) {
    let mut buffers = Buffers::default();
    // The deadline is pinned when the buffer first becomes non-empty, so a
    // steady trickle of writes cannot postpone the interval flush forever.
    let mut deadline: Option<tokio::time::Instant> = None;
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                if let Err(e) = flush(&store, &config, &mut buffers, &stats).await {
                    warn!(error = %e, "Interval flush failed");
                }
                deadline = None;
                continue;
            }
        };
        match msg {
            Some(Msg::Write(command)) => {
                buffers.push(command);
                if buffers.rows() >= config.batch_size {
                    if let Err(e) = flush(&store, &config, &mut buffers, &stats).await {
                        warn!(error = %e, "Size-triggered flush failed");
                    }
                    deadline = None;
                } else if deadline.is_none() {
                    deadline = Some(tokio::time::Instant::now() + config.flush_interval);
                }
            }
            Some(Msg::Flush(done)) => {
                let result = flush(&store, &config, &mut buffers, &stats).await;
                deadline = None;
                let _ = done.send(result);
            }
            None => {
                // All handles dropped: final flush, then exit.
                if let Err(e) = flush(&store, &config, &mut buffers, &stats).await {
                    error!(error = %e, "Final flush failed; buffered rows lost");
                }
                debug!("Batched writer exiting");
                return;
            }
        }
    }
}

async fn flush(
    store: &StagingStore,
    config: &BatchWriterConfig,
    buffers: &mut Buffers,
    stats: &Arc<StatsInner>,
) -> StoreResult<()> {
    if buffers.rows() == 0 {
        return Ok(());
    }
    let taken = std::mem::take(buffers);
    let rows = taken.rows();
    let files = Arc::new(taken.files);
    let pois = Arc::new(taken.pois);
    let outbox = Arc::new(taken.outbox);

    let mut attempt = 0;
    loop {
        let files = Arc::clone(&files);
        let pois = Arc::clone(&pois);
        let outbox = Arc::clone(&outbox);
        let files_len = files.len();
        let pois_len = pois.len();
        let outbox_len = outbox.len();
        let result = store
            .transaction(move |tx| {
                for file in files.iter() {
                    queries::runs::ensure(tx, &file.run_id)?;
                    queries::files::upsert_discovered(tx, file)?;
                }
                for event in outbox.iter() {
                    queries::runs::ensure(tx, &event.run_id)?;
                }
                for poi in pois.iter() {
                    queries::runs::ensure(tx, &poi.run_id)?;
                }
                queries::pois::insert_batch(tx, &pois)?;
                queries::outbox::insert_batch(tx, &outbox)?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => {
                stats.file_rows.fetch_add(files_len as u64, Ordering::Relaxed);
                stats.poi_rows.fetch_add(pois_len as u64, Ordering::Relaxed);
                stats.outbox_rows.fetch_add(outbox_len as u64, Ordering::Relaxed);
                stats.flushes.fetch_add(1, Ordering::Relaxed);
                WRITER_FLUSHES.inc();
                WRITER_FLUSH_ROWS.observe(rows as f64);
                return Ok(());
            }
            Err(e) if attempt + 1 < config.max_retries => {
                attempt += 1;
                warn!(attempt, error = %e, "Batched flush failed; retrying");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => {
                stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                error!(rows, error = %e, "Batched flush failed after retries; rows dropped");
                return Err(e);
            }
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph::models::{EventPayload, PoiType};

    fn source_file(path: &str) -> SourceFile {
        SourceFile::discovered(path, "h", "run-1")
    }

    fn poi(name: &str) -> Poi {
        Poi::from_classifier("a.js", name, PoiType::FunctionDefinition, 1, 2, false, "run-1")
    }

    fn event() -> NewOutboxEvent {
        NewOutboxEvent::new(EventPayload::FileAnalysisFinding {
            run_id: "run-1".to_string(),
            file_path: "a.js".to_string(),
            pois: vec![],
            relationships: vec![],
        })
    }

    #[tokio::test]
    async fn test_explicit_flush_commits_everything() {
        let store = StagingStore::open_in_memory().await.unwrap();
        let writer = BatchWriter::spawn(store.clone(), BatchWriterConfig::default());

        writer.submit(WriteCommand::Files(vec![source_file("a.js")])).await.unwrap();
        writer.submit(WriteCommand::Pois(vec![poi("f1"), poi("f2")])).await.unwrap();
        writer.submit(WriteCommand::OutboxEvents(vec![event()])).await.unwrap();
        writer.flush().await.unwrap();

        let (files, pois_count, outbox_count): (i64, i64, i64) = store
            .with_conn(|conn| {
                Ok((
                    conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM pois", [], |r| r.get(0))?,
                    conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?,
                ))
            })
            .await
            .unwrap();
        assert_eq!((files, pois_count, outbox_count), (1, 2, 1));

        let stats = writer.stats();
        assert_eq!(stats.poi_rows, 2);
        assert!(stats.flushes >= 1);
    }

    #[tokio::test]
    async fn test_size_trigger_flushes_without_explicit_flush() {
        let store = StagingStore::open_in_memory().await.unwrap();
        let writer = BatchWriter::spawn(
            store.clone(),
            BatchWriterConfig {
                batch_size: 2,
                flush_interval: Duration::from_secs(3600),
                ..BatchWriterConfig::default()
            },
        );

        writer.submit(WriteCommand::Pois(vec![poi("f1"), poi("f2")])).await.unwrap();
        // Give the writer task a beat to commit.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM pois", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_interval_trigger_flushes() {
        let store = StagingStore::open_in_memory().await.unwrap();
        let writer = BatchWriter::spawn(
            store.clone(),
            BatchWriterConfig {
                batch_size: 1_000,
                flush_interval: Duration::from_millis(50),
                ..BatchWriterConfig::default()
            },
        );

        writer.submit(WriteCommand::Pois(vec![poi("f1")])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM pois", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_duplicate_pois_do_not_double_insert() {
        let store = StagingStore::open_in_memory().await.unwrap();
        let writer = BatchWriter::spawn(store.clone(), BatchWriterConfig::default());

        writer.submit(WriteCommand::Pois(vec![poi("f1")])).await.unwrap();
        writer.flush().await.unwrap();
        writer.submit(WriteCommand::Pois(vec![poi("f1")])).await.unwrap();
        writer.flush().await.unwrap();

        let count: i64 = store
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM pois", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
