// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! File batcher + analysis worker.
//!
//! Small files accumulate in a per-run pending batch and ship as one
//! classifier call; large files take the single-file path with middle
//! truncation. A malformed batch response falls back to per-file
//! processing - no file is ever silently dropped: every reserved job ends
//! in a finding event (possibly with empty POIs) or a permanent failure
//! with the file marked failed.
//!
//! Batched jobs are held un-acked (the runtime sees [`HandlerOutcome::Deferred`])
//! until their batch flushes, so a crash before the flush redelivers them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::Counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use codegraph::metrics_constants::{
    METRIC_BATCH_FALLBACKS_TOTAL, METRIC_FILES_BATCHED_TOTAL, METRIC_FILES_INDIVIDUAL_TOTAL,
};
use codegraph::models::{
    DirectoryAggregationJob, EventPayload, FileAnalysisJob, FileStatus, NewOutboxEvent, Poi,
    PoiType, RelationshipCandidate, SourceFile,
};
use codegraph::{hashing, queues, JobError};
use codegraph_broker::{Job, JobOptions, QueueBroker};
use codegraph_classifier::{
    truncate, BatchFile, Classifier, ClassifierError, SingleFileResponse,
};
use codegraph_store::{BatchWriter, StagingStore, WriteCommand};

use crate::runtime::{HandlerOutcome, JobHandler};

static FILES_BATCHED: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(
        METRIC_FILES_BATCHED_TOTAL,
        "Total files analyzed through a batched classifier call",
    )
});
static FILES_INDIVIDUAL: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(
        METRIC_FILES_INDIVIDUAL_TOTAL,
        "Total files analyzed through the single-file path",
    )
});
static BATCH_FALLBACKS: LazyLock<Counter> = LazyLock::new(|| {
    codegraph::metrics_utils::counter(
        METRIC_BATCH_FALLBACKS_TOTAL,
        "Total batches that fell back to per-file processing",
    )
});

/// Batching thresholds, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct FileAnalysisConfig {
    /// Files at or below this size (bytes) are batch-eligible.
    pub small_file_threshold: u64,
    pub max_files_per_batch: usize,
    pub max_batch_chars: usize,
    pub max_input_chars: usize,
    /// Pending-batch flusher cadence.
    pub flush_interval: Duration,
    /// Root the job file paths are resolved against.
    pub source_root: PathBuf,
}

impl Default for FileAnalysisConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 10 * 1024,
            max_files_per_batch: 20,
            max_batch_chars: 60_000,
            max_input_chars: truncate::MAX_INPUT_CHARS,
            flush_interval: Duration::from_secs(4),
            source_root: PathBuf::from("."),
        }
    }
}

/// Batched-vs-individual counters (surfaced through the health payload).
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct FileAnalysisStats {
    pub batched: u64,
    pub individual: u64,
    pub batch_fallbacks: u64,
}

#[derive(Default)]
struct StatsInner {
    batched: AtomicU64,
    individual: AtomicU64,
    batch_fallbacks: AtomicU64,
}

struct PendingEntry {
    file: BatchFile,
    job: Job,
}

#[derive(Default)]
struct PendingBatch {
    entries: Vec<PendingEntry>,
    total_chars: usize,
}

/// The `file-analysis` consumer.
pub struct FileAnalysisWorker {
    classifier: Arc<dyn Classifier>,
    store: StagingStore,
    writer: BatchWriter,
    broker: Arc<dyn QueueBroker>,
    config: FileAnalysisConfig,
    /// Pending batches keyed by run id.
    pending: Mutex<HashMap<String, PendingBatch>>,
    stats: Arc<StatsInner>,
}

impl FileAnalysisWorker {
    #[must_use]
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: StagingStore,
        writer: BatchWriter,
        broker: Arc<dyn QueueBroker>,
        config: FileAnalysisConfig,
    ) -> Self {
        Self {
            classifier,
            store,
            writer,
            broker,
            config,
            pending: Mutex::new(HashMap::new()),
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Stats snapshot.
    #[must_use]
    pub fn stats(&self) -> FileAnalysisStats {
        FileAnalysisStats {
            batched: self.stats.batched.load(Ordering::Relaxed),
            individual: self.stats.individual.load(Ordering::Relaxed),
            batch_fallbacks: self.stats.batch_fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Periodically drain pending batches until shutdown, then drain once
    /// more so no deferred job is stranded.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.flush_interval) => {
                    self.drain_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.drain_all().await;
                        return;
                    }
                }
            }
        }
    }

    /// Drain every run's pending batch.
    pub async fn drain_all(&self) {
        let run_ids: Vec<String> = self.pending.lock().keys().cloned().collect();
        for run_id in run_ids {
            self.drain_run(&run_id).await;
        }
    }

    async fn drain_run(&self, run_id: &str) {
        let batch = match self.pending.lock().remove(run_id) {
            Some(batch) if !batch.entries.is_empty() => batch,
            _ => return,
        };
        self.process_batch(run_id, batch).await;
    }

    async fn process_batch(&self, run_id: &str, batch: PendingBatch) {
        let files: Vec<BatchFile> = batch.entries.iter().map(|e| e.file.clone()).collect();
        debug!(run_id, files = files.len(), "Draining pending batch");

        match self.classifier.analyze_batch(&files).await {
            Ok(response) => {
                let mut by_path: HashMap<String, SingleFileResponse> = response
                    .files
                    .into_iter()
                    .map(|f| {
                        (
                            f.file_path,
                            SingleFileResponse {
                                pois: f.pois,
                                relationships: f.relationships,
                            },
                        )
                    })
                    .collect();
                for entry in batch.entries {
                    match by_path.remove(&entry.file.file_path) {
                        Some(result) => {
                            self.finish_entry(run_id, entry, result).await;
                            self.stats.batched.fetch_add(1, Ordering::Relaxed);
                            FILES_BATCHED.inc();
                        }
                        // The response validated but omitted this file:
                        // process it individually rather than dropping it.
                        None => self.fallback_entry(run_id, entry).await,
                    }
                }
            }
            Err(e) if e.is_retriable() => {
                // Transient: hand every member back to the broker's backoff.
                warn!(run_id, error = %e, "Batch classifier call failed transiently");
                for entry in batch.entries {
                    if let Err(fail_err) = self
                        .broker
                        .fail(&entry.job, &e.to_string(), true, None)
                        .await
                    {
                        warn!(job_id = %entry.job.id, error = %fail_err, "Failed to return batch member");
                    }
                }
            }
            Err(e) => {
                // Malformed (or otherwise terminal) batch response: the
                // entire batch falls back to per-file processing.
                info!(run_id, error = %e, "Batch response invalid; falling back to per-file");
                self.stats.batch_fallbacks.fetch_add(1, Ordering::Relaxed);
                BATCH_FALLBACKS.inc();
                for entry in batch.entries {
                    self.fallback_entry(run_id, entry).await;
                }
            }
        }
    }

    /// Emit the finding for a batch member and settle its deferred job.
    async fn finish_entry(&self, run_id: &str, entry: PendingEntry, result: SingleFileResponse) {
        let path = entry.file.file_path.clone();
        match self.emit_finding(run_id, &path, result).await {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&entry.job).await {
                    warn!(job_id = %entry.job.id, error = %e, "Ack of batched job failed");
                }
            }
            Err(e) => {
                let retriable = e.is_retriable();
                if let Err(fail_err) = self
                    .broker
                    .fail(&entry.job, e.reason(), retriable, None)
                    .await
                {
                    warn!(job_id = %entry.job.id, error = %fail_err, "Fail of batched job failed");
                }
            }
        }
    }

    /// Per-file fallback for one batch member.
    async fn fallback_entry(&self, run_id: &str, entry: PendingEntry) {
        let path = entry.file.file_path.clone();
        let result = self.process_single(run_id, &path, &entry.file.content).await;
        self.stats.individual.fetch_add(1, Ordering::Relaxed);
        FILES_INDIVIDUAL.inc();
        match result {
            Ok(()) => {
                if let Err(e) = self.broker.ack(&entry.job).await {
                    warn!(job_id = %entry.job.id, error = %e, "Ack of fallback job failed");
                }
            }
            Err(e) => {
                let retriable = e.is_retriable();
                if let Err(fail_err) = self
                    .broker
                    .fail(&entry.job, e.reason(), retriable, None)
                    .await
                {
                    warn!(job_id = %entry.job.id, error = %fail_err, "Fail of fallback job failed");
                }
            }
        }
    }

    /// Single-file classifier path: truncate, call, emit.
    async fn process_single(
        &self,
        run_id: &str,
        file_path: &str,
        content: &str,
    ) -> Result<(), JobError> {
        let truncated = truncate::truncate_middle(content, self.config.max_input_chars);
        match self.classifier.analyze_file(file_path, &truncated).await {
            Ok(response) => self.emit_finding(run_id, file_path, response).await,
            Err(e) if e.is_retriable() => Err(JobError::retriable(e.to_string())),
            Err(e) => {
                self.mark_file_failed(run_id, file_path, &e).await;
                Err(JobError::permanent(format!(
                    "classifier rejected {file_path}: {e}"
                )))
            }
        }
    }

    /// Persist the finding event and finish the file's bookkeeping.
    async fn emit_finding(
        &self,
        run_id: &str,
        file_path: &str,
        response: SingleFileResponse,
    ) -> Result<(), JobError> {
        let pois: Vec<Poi> = response
            .pois
            .into_iter()
            .map(|spec| {
                Poi::from_classifier(
                    file_path,
                    spec.name,
                    PoiType::parse(&spec.poi_type),
                    spec.start_line,
                    if spec.end_line == 0 { spec.start_line } else { spec.end_line },
                    spec.is_exported,
                    run_id,
                )
            })
            .collect();
        let relationships: Vec<RelationshipCandidate> = response
            .relationships
            .into_iter()
            .map(|spec| RelationshipCandidate {
                source: spec.source,
                target: spec.target,
                rel_type: spec.rel_type,
                file_path: file_path.to_string(),
                confidence: spec.confidence,
                reason: spec.reason,
            })
            .collect();

        let event = NewOutboxEvent::new(EventPayload::FileAnalysisFinding {
            run_id: run_id.to_string(),
            file_path: file_path.to_string(),
            pois,
            relationships,
        });
        self.writer
            .submit(WriteCommand::OutboxEvents(vec![event]))
            .await
            .map_err(|e| JobError::retriable(format!("writer unavailable: {e}")))?;

        let run = run_id.to_string();
        let path = file_path.to_string();
        let status_result = self
            .store
            .with_conn(move |conn| {
                codegraph_store::queries::files::set_status(conn, &run, &path, FileStatus::Processed)
            })
            .await;
        match status_result {
            Ok(()) => {}
            // A terminal row from an earlier attempt: the finding event is
            // written, which is what matters; leave the status alone.
            Err(codegraph_store::StoreError::Constraint(reason)) => {
                warn!(file_path, reason = %reason, "File already terminal; keeping its status");
            }
            Err(e) => {
                return Err(JobError::retriable(format!("file status update failed: {e}")));
            }
        }

        self.notify_directory(run_id, file_path).await;
        Ok(())
    }

    async fn mark_file_failed(&self, run_id: &str, file_path: &str, error: &ClassifierError) {
        let run = run_id.to_string();
        let path = file_path.to_string();
        let result = self
            .store
            .with_conn(move |conn| {
                codegraph_store::queries::files::set_status(conn, &run, &path, FileStatus::Failed)
            })
            .await;
        if let Err(e) = result {
            warn!(file_path, error = %e, "Could not mark file failed");
        } else {
            warn!(file_path, classifier_error = %error, "File marked failed");
        }
    }

    /// Notify downstream aggregation that a file in this directory finished.
    async fn notify_directory(&self, run_id: &str, file_path: &str) {
        let directory = std::path::Path::new(file_path)
            .parent()
            .map(|p| p.display().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let job = DirectoryAggregationJob {
            directory: directory.clone(),
            run_id: run_id.to_string(),
        };
        let payload = match serde_json::to_value(&job) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Directory aggregation payload failed to serialize");
                return;
            }
        };
        // One notification per (run, directory, file); duplicates collapse.
        let opts = JobOptions::with_idempotency_key(hashing::sha256_hex(
            format!("dir-agg:{run_id}:{file_path}").as_bytes(),
        ));
        if let Err(e) = self
            .broker
            .enqueue(queues::DIRECTORY_AGGREGATION, payload, opts)
            .await
        {
            warn!(directory, error = %e, "Directory aggregation enqueue failed");
        }
    }

    /// Register the file row (idempotent) so status transitions have a target.
    async fn ensure_file_row(&self, run_id: &str, file_path: &str, content: &str) -> Result<(), JobError> {
        let file = SourceFile::discovered(
            file_path,
            hashing::sha256_hex(content.as_bytes()),
            run_id,
        );
        self.writer
            .submit(WriteCommand::Files(vec![file]))
            .await
            .map_err(|e| JobError::retriable(format!("writer unavailable: {e}")))?;
        // The status transition below reads this row; make it visible now.
        self.writer
            .flush()
            .await
            .map_err(|e| JobError::retriable(format!("writer flush failed: {e}")))
    }
}

#[async_trait]
impl JobHandler for FileAnalysisWorker {
    fn worker_type(&self) -> &'static str {
        queues::FILE_ANALYSIS
    }

    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, JobError> {
        let analysis: FileAnalysisJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::permanent(format!("invalid file-analysis payload: {e}")))?;

        let absolute = self.config.source_root.join(&analysis.file_path);
        let bytes = match tokio::fs::read(&absolute).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JobError::permanent(format!(
                    "source file missing: {}",
                    absolute.display()
                )));
            }
            Err(e) => {
                return Err(JobError::retriable(format!(
                    "read failed for {}: {e}",
                    absolute.display()
                )));
            }
        };
        let content = String::from_utf8_lossy(&bytes).into_owned();

        self.ensure_file_row(&analysis.run_id, &analysis.file_path, &content)
            .await?;

        let batchable = bytes.len() as u64 <= self.config.small_file_threshold;
        if batchable {
            let drain_now = {
                let mut pending = self.pending.lock();
                let batch = pending.entry(analysis.run_id.clone()).or_default();
                // Char budget: an entry that would overflow the batch makes
                // the batch ship first; the entry starts the next one.
                if batch.total_chars + content.len() > self.config.max_batch_chars
                    && !batch.entries.is_empty()
                {
                    // Move the full batch out; re-insert the newcomer after.
                    let full = std::mem::take(batch);
                    batch.total_chars = content.len();
                    batch.entries.push(PendingEntry {
                        file: BatchFile {
                            file_path: analysis.file_path.clone(),
                            content,
                        },
                        job: job.clone(),
                    });
                    Some(full)
                } else {
                    batch.total_chars += content.len();
                    batch.entries.push(PendingEntry {
                        file: BatchFile {
                            file_path: analysis.file_path.clone(),
                            content,
                        },
                        job: job.clone(),
                    });
                    if batch.entries.len() >= self.config.max_files_per_batch {
                        Some(std::mem::take(batch))
                    } else {
                        None
                    }
                }
            };
            if let Some(full) = drain_now {
                self.drain_batch(&analysis.run_id, full).await;
            }
            return Ok(HandlerOutcome::Deferred);
        }

        // Large file: single-file path, counted as individual processing.
        let result = self
            .process_single(&analysis.run_id, &analysis.file_path, &content)
            .await;
        self.stats.individual.fetch_add(1, Ordering::Relaxed);
        FILES_INDIVIDUAL.inc();
        result.map(|()| HandlerOutcome::Done)
    }
}

impl FileAnalysisWorker {
    /// Drain one already-removed batch (size-triggered path).
    async fn drain_batch(&self, run_id: &str, batch: PendingBatch) {
        self.process_batch(run_id, batch).await;
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use codegraph_broker::InMemoryBroker;
    use codegraph_classifier::{BatchFileResult, BatchResponse, MockClassifier, PoiSpec};
    use codegraph_store::BatchWriterConfig;

    struct Fixture {
        worker: Arc<FileAnalysisWorker>,
        mock: Arc<MockClassifier>,
        broker: Arc<InMemoryBroker>,
        store: StagingStore,
        _dir: tempfile::TempDir,
    }

    async fn fixture(config_overrides: impl FnOnce(&mut FileAnalysisConfig)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = StagingStore::open_in_memory().await.unwrap();
        let writer = BatchWriter::spawn(store.clone(), BatchWriterConfig::default());
        let broker = Arc::new(InMemoryBroker::new());
        let mock = Arc::new(MockClassifier::new());
        let mut config = FileAnalysisConfig {
            source_root: dir.path().to_path_buf(),
            ..FileAnalysisConfig::default()
        };
        config_overrides(&mut config);
        let worker = Arc::new(FileAnalysisWorker::new(
            Arc::clone(&mock) as Arc<dyn Classifier>,
            store.clone(),
            writer,
            Arc::clone(&broker) as Arc<dyn QueueBroker>,
            config,
        ));
        Fixture {
            worker,
            mock,
            broker,
            store,
            _dir: dir,
        }
    }

    fn write_file(fixture: &Fixture, name: &str, content: &str) {
        std::fs::write(fixture._dir.path().join(name), content).unwrap();
    }

    async fn reserve_job(fixture: &Fixture, name: &str) -> Job {
        let analysis = FileAnalysisJob::new(name, "run-1");
        fixture
            .broker
            .enqueue(
                queues::FILE_ANALYSIS,
                serde_json::to_value(&analysis).unwrap(),
                JobOptions::default(),
            )
            .await
            .unwrap();
        fixture
            .broker
            .reserve(queues::FILE_ANALYSIS, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap()
    }

    fn single_response(name: &str) -> SingleFileResponse {
        SingleFileResponse {
            pois: vec![PoiSpec {
                name: name.to_string(),
                poi_type: "FunctionDefinition".to_string(),
                start_line: 1,
                end_line: 3,
                is_exported: true,
            }],
            relationships: vec![],
        }
    }

    #[tokio::test]
    async fn test_large_file_takes_single_path() {
        let fixture = fixture(|c| c.small_file_threshold = 8).await;
        write_file(&fixture, "big.js", "function createUser() { return 1; }");
        fixture
            .mock
            .script_single("big.js", Ok(single_response("createUser")));

        let job = reserve_job(&fixture, "big.js").await;
        let outcome = fixture.worker.handle(&job).await.unwrap();
        assert_eq!(outcome, HandlerOutcome::Done);
        assert_eq!(fixture.mock.single_calls(), 1);
        assert_eq!(fixture.worker.stats().individual, 1);

        // Finding event written; file marked processed.
        let (pending, _, _) = fixture
            .store
            .with_conn(|c| codegraph_store::queries::outbox::counts_by_status(c, "run-1"))
            .await
            .unwrap();
        assert_eq!(pending, 1);
        let file = fixture
            .store
            .with_conn(|c| codegraph_store::queries::files::get(c, "run-1", "big.js"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::Processed);

        // Directory aggregation notified.
        let counts = fixture.broker.counts(queues::DIRECTORY_AGGREGATION).await.unwrap();
        assert_eq!(counts.waiting, 1);
    }

    #[tokio::test]
    async fn test_small_files_batch_and_drain_at_capacity() {
        let fixture = fixture(|c| c.max_files_per_batch = 2).await;
        write_file(&fixture, "a.js", "function a() {}");
        write_file(&fixture, "b.js", "function b() {}");
        fixture.mock.script_batch(Ok(BatchResponse {
            files: vec![
                BatchFileResult {
                    file_path: "a.js".to_string(),
                    pois: single_response("a").pois,
                    relationships: vec![],
                },
                BatchFileResult {
                    file_path: "b.js".to_string(),
                    pois: single_response("b").pois,
                    relationships: vec![],
                },
            ],
        }));

        let job_a = reserve_job(&fixture, "a.js").await;
        assert_eq!(fixture.worker.handle(&job_a).await.unwrap(), HandlerOutcome::Deferred);
        assert_eq!(fixture.mock.batch_calls(), 0);

        // Second file reaches capacity and triggers the drain inline.
        let job_b = reserve_job(&fixture, "b.js").await;
        assert_eq!(fixture.worker.handle(&job_b).await.unwrap(), HandlerOutcome::Deferred);
        assert_eq!(fixture.mock.batch_calls(), 1);
        assert_eq!(fixture.worker.stats().batched, 2);

        // Both deferred jobs were acked by the worker.
        let counts = fixture.broker.counts(queues::FILE_ANALYSIS).await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 2);
    }

    #[tokio::test]
    async fn test_malformed_batch_falls_back_per_file() {
        // The canonical scenario: two small files batched, classifier
        // returns invalid output, both are reprocessed individually and
        // both counters increment.
        let fixture = fixture(|c| c.max_files_per_batch = 2).await;
        write_file(&fixture, "a.js", "function a() {}");
        write_file(&fixture, "b.js", "function b() {}");
        fixture.mock.script_batch(Err(ClassifierError::MalformedResponse(
            "invalid JSON".to_string(),
        )));
        fixture.mock.script_single("a.js", Ok(single_response("a")));
        fixture.mock.script_single("b.js", Ok(single_response("b")));

        let job_a = reserve_job(&fixture, "a.js").await;
        fixture.worker.handle(&job_a).await.unwrap();
        let job_b = reserve_job(&fixture, "b.js").await;
        fixture.worker.handle(&job_b).await.unwrap();

        let stats = fixture.worker.stats();
        assert_eq!(stats.batch_fallbacks, 1);
        assert_eq!(stats.individual, 2);
        assert_eq!(fixture.mock.single_calls(), 2);

        // Both files produced finding events; neither was dropped.
        let (pending, _, _) = fixture
            .store
            .with_conn(|c| codegraph_store::queries::outbox::counts_by_status(c, "run-1"))
            .await
            .unwrap();
        assert_eq!(pending, 2);
        let counts = fixture.broker.counts(queues::FILE_ANALYSIS).await.unwrap();
        assert_eq!(counts.completed, 2);
    }

    #[tokio::test]
    async fn test_flusher_drains_partial_batches() {
        let fixture = fixture(|c| {
            c.max_files_per_batch = 10;
            c.flush_interval = Duration::from_millis(50);
        })
        .await;
        write_file(&fixture, "a.js", "function a() {}");
        fixture.mock.script_batch(Ok(BatchResponse {
            files: vec![BatchFileResult {
                file_path: "a.js".to_string(),
                pois: vec![],
                relationships: vec![],
            }],
        }));

        let job = reserve_job(&fixture, "a.js").await;
        assert_eq!(fixture.worker.handle(&job).await.unwrap(), HandlerOutcome::Deferred);

        let (tx, rx) = tokio::sync::watch::channel(false);
        let flusher = tokio::spawn(Arc::clone(&fixture.worker).run_flusher(rx));
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        flusher.await.unwrap();

        assert_eq!(fixture.mock.batch_calls(), 1);
        let counts = fixture.broker.counts(queues::FILE_ANALYSIS).await.unwrap();
        assert_eq!(counts.completed, 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_permanent() {
        let fixture = fixture(|_| {}).await;
        let job = reserve_job(&fixture, "ghost.js").await;
        let err = fixture.worker.handle(&job).await.unwrap_err();
        assert!(!err.is_retriable());
        assert!(err.reason().contains("ghost.js"));
    }

    #[tokio::test]
    async fn test_terminal_classifier_failure_marks_file_failed() {
        let fixture = fixture(|c| c.small_file_threshold = 1).await;
        write_file(&fixture, "bad.js", "function bad() {}");
        fixture.mock.script_single(
            "bad.js",
            Err(ClassifierError::Http {
                status: 400,
                body: "bad prompt".to_string(),
            }),
        );

        let job = reserve_job(&fixture, "bad.js").await;
        let err = fixture.worker.handle(&job).await.unwrap_err();
        assert!(!err.is_retriable());

        let file = fixture
            .store
            .with_conn(|c| codegraph_store::queries::files::get(c, "run-1", "bad.js"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(file.status, FileStatus::Failed);
    }
}
