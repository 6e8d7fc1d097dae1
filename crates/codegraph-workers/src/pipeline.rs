// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Pipeline wiring.
//!
//! Builds every service once at startup and passes them explicitly - no
//! module-level mutable state. Spawns: N consumer tasks per queue (N from
//! the per-stage concurrency config), the single outbox polling task, the
//! pending-batch flusher, the queue cleanup manager, store maintenance,
//! the adaptive scaler, and the health endpoint.
//!
//! Shutdown: flip the watch channel, stop reserving, give in-flight jobs
//! the grace period, then abort what remains (the broker's stale sweep
//! re-queues those jobs).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use codegraph::{queues, PipelineConfig};
use codegraph_broker::{CleanupConfig, CleanupManager, QueueBroker};
use codegraph_classifier::Classifier;
use codegraph_graph::GraphStore;
use codegraph_outbox::{OutboxPublisher, OutboxPublisherConfig, PublisherStats};
use codegraph_pool::{
    AdaptiveScaler, HealthRegistry, HealthSnapshot, ProcProbe, ResourceProbe, ScalingConfig,
    WorkerLimits, WorkerPool,
};
use codegraph_store::{BatchWriter, StagingStore, WriterStats};

use crate::file_analysis::{FileAnalysisConfig, FileAnalysisStats, FileAnalysisWorker};
use crate::graph_ingestion::GraphIngestionWorker;
use crate::reconciliation::{ReconciliationConfig, ReconciliationWorker};
use crate::relationship_resolution::RelationshipResolutionWorker;
use crate::runtime::{run_consumer, JobHandler};
use crate::triangulation::{TriangulationConfig, TriangulationWorker};
use crate::validation::ValidationWorker;

/// Everything the pipeline needs, constructed once at startup.
pub struct PipelineServices {
    pub config: PipelineConfig,
    pub store: StagingStore,
    pub writer: BatchWriter,
    pub broker: Arc<dyn QueueBroker>,
    pub pool: Arc<WorkerPool>,
    pub classifier: Arc<dyn Classifier>,
    pub graph: Arc<dyn GraphStore>,
    pub health: Arc<HealthRegistry>,
    /// Root the file-analysis jobs resolve paths against.
    pub source_root: std::path::PathBuf,
}

/// Register every pipeline queue with the worker pool. Queues without a
/// shipped consumer (directory aggregation/resolution, global resolution)
/// are registered too so admin tooling and cleanup treat them uniformly.
pub fn register_workers(pool: &WorkerPool, config: &PipelineConfig) {
    for queue in queues::ALL_QUEUES {
        pool.register_worker(
            queue,
            WorkerLimits {
                max_concurrency: config.concurrency_for(queue),
                min_concurrency: 1,
                rate_limit_requests: 100,
                rate_limit_window: Duration::from_secs(1),
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(30),
            },
        );
    }
}

/// Dependencies tracked by the health registry.
const DEP_STAGING_STORE: &str = "staging-store";
const DEP_QUEUE_BROKER: &str = "queue-broker";
const DEP_GRAPH_STORE: &str = "graph-store";
const DEP_CLASSIFIER: &str = "classifier";
const DEP_WORKER_POOL: &str = "worker-pool";

/// The health endpoint payload.
#[derive(Serialize)]
struct HealthPayload {
    #[serde(flatten)]
    snapshot: HealthSnapshot,
    file_analysis: FileAnalysisStats,
    outbox: PublisherStats,
    writer: WriterStats2,
}

/// Serializable mirror of [`WriterStats`].
#[derive(Serialize)]
struct WriterStats2 {
    file_rows: u64,
    poi_rows: u64,
    outbox_rows: u64,
    flushes: u64,
    failed_flushes: u64,
}

impl From<WriterStats> for WriterStats2 {
    fn from(stats: WriterStats) -> Self {
        Self {
            file_rows: stats.file_rows,
            poi_rows: stats.poi_rows,
            outbox_rows: stats.outbox_rows,
            flushes: stats.flushes,
            failed_flushes: stats.failed_flushes,
        }
    }
}

struct HealthState {
    health: Arc<HealthRegistry>,
    file_analysis: Arc<FileAnalysisWorker>,
    publisher: Arc<OutboxPublisher>,
    writer: BatchWriter,
}

async fn healthz(State(state): State<Arc<HealthState>>) -> Json<HealthPayload> {
    Json(HealthPayload {
        snapshot: state.health.snapshot(),
        file_analysis: state.file_analysis.stats(),
        outbox: state.publisher.stats(),
        writer: state.writer.stats().into(),
    })
}

/// A running pipeline.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    pub file_analysis: Arc<FileAnalysisWorker>,
    pub publisher: Arc<OutboxPublisher>,
}

impl Pipeline {
    /// Wire and spawn everything.
    pub async fn start(services: PipelineServices) -> codegraph::Result<Self> {
        let PipelineServices {
            config,
            store,
            writer,
            broker,
            pool,
            classifier,
            graph,
            health,
            source_root,
        } = services;

        register_workers(&pool, &config);
        for dep in [
            DEP_STAGING_STORE,
            DEP_QUEUE_BROKER,
            DEP_GRAPH_STORE,
            DEP_CLASSIFIER,
            DEP_WORKER_POOL,
        ] {
            health.register(dep, 3);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Workers.
        let file_analysis = Arc::new(FileAnalysisWorker::new(
            Arc::clone(&classifier),
            store.clone(),
            writer.clone(),
            Arc::clone(&broker),
            FileAnalysisConfig {
                small_file_threshold: config.small_file_threshold,
                max_files_per_batch: config.max_files_per_batch,
                max_batch_chars: config.max_batch_chars,
                max_input_chars: config.max_input_chars,
                flush_interval: config.batch_flush_interval,
                source_root,
            },
        ));
        let resolution = Arc::new(RelationshipResolutionWorker::new(
            store.clone(),
            Arc::clone(&broker),
            codegraph::scoring::ConfidenceScorer::new(codegraph::scoring::ScorerConfig {
                escalation_threshold: config.escalation_threshold,
                ..codegraph::scoring::ScorerConfig::default()
            }),
        ));
        let triangulation = Arc::new(TriangulationWorker::new(
            Arc::clone(&classifier),
            store.clone(),
            Arc::clone(&broker),
            TriangulationConfig {
                mode: config.triangulation_mode,
                max_parallel_agents: config.max_parallel_agents,
                agent_timeout: config.agent_timeout,
                session_timeout: config.session_timeout,
                accept_threshold: config.consensus_accept,
                reject_threshold: config.consensus_reject,
                agreement_min: config.agreement_min,
            },
        ));
        let validation = Arc::new(ValidationWorker::new(store.clone(), Arc::clone(&broker)));
        let reconciliation = Arc::new(ReconciliationWorker::new(
            store.clone(),
            Arc::clone(&broker),
            ReconciliationConfig {
                accept_threshold: config.escalation_threshold,
            },
        ));
        let ingestion = Arc::new(GraphIngestionWorker::new(store.clone(), Arc::clone(&graph)));

        let handlers: Vec<Arc<dyn JobHandler>> = vec![
            Arc::clone(&file_analysis) as Arc<dyn JobHandler>,
            resolution,
            triangulation,
            validation,
            reconciliation,
            ingestion,
        ];
        for handler in handlers {
            let consumers = config.concurrency_for(handler.worker_type());
            for _ in 0..consumers {
                tasks.push(tokio::spawn(run_consumer(
                    Arc::clone(&broker),
                    Arc::clone(&pool),
                    Arc::clone(&handler),
                    shutdown_rx.clone(),
                )));
            }
        }

        // The single outbox polling task.
        let publisher = Arc::new(OutboxPublisher::new(
            store.clone(),
            Arc::clone(&broker),
            OutboxPublisherConfig {
                poll_interval: config.outbox_polling_interval,
                batch_size: config.outbox_batch_size,
                super_batch_size: config.outbox_super_batch_size,
                max_resolution_attempts: config.max_resolution_attempts,
                ..OutboxPublisherConfig::default()
            },
        ));
        {
            let publisher = Arc::clone(&publisher);
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { publisher.run(shutdown).await }));
        }

        // Pending-batch flusher.
        tasks.push(tokio::spawn(
            Arc::clone(&file_analysis).run_flusher(shutdown_rx.clone()),
        ));

        // Queue cleanup (runs under the pool like any worker type in spirit:
        // its passes are cheap and bounded, so it gets no dedicated slot).
        let cleanup = CleanupManager::new(
            Arc::clone(&broker),
            CleanupConfig {
                max_job_age: config.max_job_age,
                max_stale_age: config.max_stale_age,
                interval: Duration::from_secs(60),
            },
        );
        {
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move { cleanup.run(shutdown).await }));
        }

        // Store maintenance (WAL checkpoint + ANALYZE).
        {
            let store = store.clone();
            let shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                store.run_maintenance(Duration::from_secs(300), shutdown).await;
            }));
        }

        // Adaptive scaling.
        let probe: Arc<dyn ResourceProbe> = Arc::new(ProcProbe::new(2 * 1024 * 1024 * 1024));
        let scaler = AdaptiveScaler::new(Arc::clone(&pool), probe, ScalingConfig::default());
        tasks.push(tokio::spawn(scaler.run(shutdown_rx.clone())));

        // Dependency health probes.
        {
            let store = store.clone();
            let broker = Arc::clone(&broker);
            let graph = Arc::clone(&graph);
            let health = Arc::clone(&health);
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(15)) => {
                            match store.health_check().await {
                                Ok(()) => health.record_success(DEP_STAGING_STORE),
                                Err(e) => health.record_failure(DEP_STAGING_STORE, &e.to_string()),
                            }
                            match broker.counts(queues::FILE_ANALYSIS).await {
                                Ok(_) => health.record_success(DEP_QUEUE_BROKER),
                                Err(e) => health.record_failure(DEP_QUEUE_BROKER, &e.to_string()),
                            }
                            match graph.health_check().await {
                                Ok(()) => health.record_success(DEP_GRAPH_STORE),
                                Err(e) => health.record_failure(DEP_GRAPH_STORE, &e.to_string()),
                            }
                            // The classifier has no cheap probe; its health is
                            // inferred from worker outcomes, which feed the
                            // same registry through the consumers.
                            health.record_success(DEP_WORKER_POOL);
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        // Health endpoint.
        if config.health_port != 0 {
            let state = Arc::new(HealthState {
                health: Arc::clone(&health),
                file_analysis: Arc::clone(&file_analysis),
                publisher: Arc::clone(&publisher),
                writer: writer.clone(),
            });
            let app = Router::new().route("/healthz", get(healthz)).with_state(state);
            let port = config.health_port;
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let listener =
                    match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            warn!(port, error = %e, "Health endpoint bind failed");
                            return;
                        }
                    };
                info!(port, "Health endpoint listening");
                let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                    loop {
                        if shutdown.changed().await.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                });
                if let Err(e) = server.await {
                    warn!(error = %e, "Health endpoint exited with error");
                }
            }));
        }

        // The classifier dependency starts healthy until proven otherwise.
        health.record_success(DEP_CLASSIFIER);

        info!(
            global_concurrency = pool.global_cap(),
            queues = queues::ALL_QUEUES.len(),
            "Pipeline started"
        );
        Ok(Self {
            shutdown_tx,
            tasks,
            file_analysis,
            publisher,
        })
    }

    /// Graceful shutdown: stop reserving, wait up to `grace` for in-flight
    /// jobs, then abort the rest. Returns true if everything drained.
    pub async fn shutdown(self, grace: Duration) -> bool {
        info!(grace_ms = grace.as_millis() as u64, "Pipeline shutting down");
        let _ = self.shutdown_tx.send(true);

        let mut tasks = self.tasks;
        let drain = futures::future::join_all(tasks.iter_mut());
        match tokio::time::timeout(grace, drain).await {
            Ok(_) => {
                info!("Pipeline drained cleanly");
                true
            }
            Err(_) => {
                // Abandoned jobs stay active; the broker's stale sweep will
                // re-queue them for another process.
                warn!("Grace period elapsed; aborting remaining tasks");
                for task in &tasks {
                    task.abort();
                }
                false
            }
        }
    }
}
