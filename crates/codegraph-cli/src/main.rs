// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The `codegraph` binary.
//!
//! Subcommands: `run` (the full pipeline), `seed` (enqueue a source tree
//! for analysis), `health`, and `queues` (counts / clean / drain /
//! dead-letters).
//!
//! Exit codes: 0 success, 1 validation failure, 2 fatal dependency
//! failure, 3 graceful-shutdown timeout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use codegraph::models::{new_run_id, FileAnalysisJob, SourceFile};
use codegraph::{queues, PipelineConfig};
use codegraph_broker::{
    CleanupConfig, CleanupManager, InMemoryBroker, JobOptions, JobState, QueueBroker, RedisBroker,
};
use codegraph_classifier::{Classifier, HttpClassifier, HttpClassifierConfig, MockClassifier};
use codegraph_graph::{GraphStore, InMemoryGraphStore, Neo4jConfig, Neo4jGraphStore};
use codegraph_pool::{HealthRegistry, WorkerPool};
use codegraph_store::{queries, BatchWriter, BatchWriterConfig, StagingStore, StoreConfig};
use codegraph_workers::pipeline::{Pipeline, PipelineServices};

const EXIT_VALIDATION: u8 = 1;
const EXIT_DEPENDENCY: u8 = 2;
const EXIT_SHUTDOWN_TIMEOUT: u8 = 3;

/// Source-file extensions seeded by default.
const DEFAULT_EXTENSIONS: &str = "js,jsx,ts,tsx,py,rb,go,rs,java,cs,php,c,cc,cpp,h,hpp";

#[derive(Parser)]
#[command(name = "codegraph", about = "CodeGraph analysis pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline until interrupted.
    Run {
        /// Root directory the file-analysis jobs resolve paths against.
        #[arg(long, default_value = ".")]
        source_root: PathBuf,
        /// Use a process-local broker instead of Redis (single-process runs).
        #[arg(long)]
        local_broker: bool,
        /// Use the scripted mock classifier (offline smoke runs).
        #[arg(long)]
        mock_classifier: bool,
    },
    /// Walk a source tree and enqueue file-analysis jobs for a new run.
    Seed {
        /// Directory to walk.
        source_root: PathBuf,
        /// Run id to tag records with (generated when omitted).
        #[arg(long)]
        run_id: Option<String>,
        /// Comma-separated extension allowlist.
        #[arg(long, default_value = DEFAULT_EXTENSIONS)]
        extensions: String,
    },
    /// Check dependency health.
    Health,
    /// Queue administration.
    Queues {
        #[command(subcommand)]
        command: QueueCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Per-state job counts for every registered queue.
    Counts,
    /// Remove terminal jobs older than the given age.
    Clean {
        #[arg(long, default_value_t = 24 * 60 * 60 * 1000)]
        age_ms: u64,
        /// completed | failed
        #[arg(long, default_value = "completed")]
        state: String,
    },
    /// Emergency drain of every queue. Destructive.
    Drain {
        /// Must be the literal confirmation token.
        #[arg(long)]
        confirm: String,
    },
    /// Show recent dead-letter records for a queue.
    DeadLetters {
        queue: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Command::Run {
            source_root,
            local_broker,
            mock_classifier,
        } => run_pipeline(config, source_root, local_broker, mock_classifier).await,
        Command::Seed {
            source_root,
            run_id,
            extensions,
        } => seed(config, source_root, run_id, &extensions).await,
        Command::Health => health(config).await,
        Command::Queues { command } => queues_admin(config, command).await,
    }
}

async fn connect_broker(config: &PipelineConfig) -> Result<Arc<dyn QueueBroker>, ExitCode> {
    match RedisBroker::connect(&config.redis_url).await {
        Ok(broker) => Ok(Arc::new(broker)),
        Err(e) => {
            error!(redis_url = %config.redis_url, error = %e, "Queue broker unreachable");
            Err(ExitCode::from(EXIT_DEPENDENCY))
        }
    }
}

async fn open_store(config: &PipelineConfig) -> Result<StagingStore, ExitCode> {
    let store_config = StoreConfig {
        wal_size_limit_bytes: config.wal_size_limit_bytes,
        ..StoreConfig::default()
    };
    match StagingStore::open(&config.sqlite_path, store_config).await {
        Ok(store) => Ok(store),
        Err(e) => {
            error!(path = %config.sqlite_path, error = %e, "Staging store unavailable");
            Err(ExitCode::from(EXIT_DEPENDENCY))
        }
    }
}

async fn run_pipeline(
    config: PipelineConfig,
    source_root: PathBuf,
    local_broker: bool,
    mock_classifier: bool,
) -> ExitCode {
    let broker: Arc<dyn QueueBroker> = if local_broker {
        warn!("Using the in-process broker; jobs do not survive a restart");
        Arc::new(InMemoryBroker::new())
    } else {
        match connect_broker(&config).await {
            Ok(broker) => broker,
            Err(code) => return code,
        }
    };

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    let classifier: Arc<dyn Classifier> = if mock_classifier {
        warn!("Using the mock classifier; analysis results will be empty");
        Arc::new(MockClassifier::new())
    } else {
        let Some(api_url) = config.classifier_api_url.clone() else {
            error!("CLASSIFIER_API_URL is required (or pass --mock-classifier)");
            return ExitCode::from(EXIT_DEPENDENCY);
        };
        match HttpClassifier::new(HttpClassifierConfig {
            api_url,
            api_key: config.classifier_api_key.clone(),
            model: config.classifier_model.clone(),
            timeout: config.llm_timeout,
            max_retries: config.llm_max_retries,
            retry_delay: config.llm_retry_delay,
            max_concurrency: config.llm_max_concurrency,
            rate_limit_per_sec: config.api_rate_limit,
        }) {
            Ok(classifier) => Arc::new(classifier),
            Err(e) => {
                error!(error = %e, "Classifier client construction failed");
                return ExitCode::from(EXIT_DEPENDENCY);
            }
        }
    };

    let graph: Arc<dyn GraphStore> = match &config.neo4j_uri {
        Some(uri) => {
            let neo4j = Neo4jGraphStore::connect(&Neo4jConfig {
                uri: uri.clone(),
                user: config.neo4j_user.clone(),
                password: config.neo4j_password.clone(),
            })
            .await;
            match neo4j {
                Ok(graph) => Arc::new(graph),
                Err(e) => {
                    error!(uri = %uri, error = %e, "Graph store unreachable");
                    return ExitCode::from(EXIT_DEPENDENCY);
                }
            }
        }
        None => {
            warn!("NEO4J_URI unset; ingesting into an in-memory graph store");
            Arc::new(InMemoryGraphStore::new())
        }
    };

    let writer = BatchWriter::spawn(
        store.clone(),
        BatchWriterConfig {
            batch_size: config.db_batch_size,
            flush_interval: config.db_flush_interval,
            ..BatchWriterConfig::default()
        },
    );
    let pool = Arc::new(WorkerPool::new(config.total_worker_concurrency));
    let grace = config.shutdown_grace;

    let services = PipelineServices {
        config,
        store,
        writer,
        broker,
        pool,
        classifier,
        graph,
        health: Arc::new(HealthRegistry::new()),
        source_root,
    };
    let pipeline = match Pipeline::start(services).await {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!(error = %e, "Pipeline failed to start");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
    };

    info!("Pipeline running; Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Signal handler failed");
    }

    if pipeline.shutdown(grace).await {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_SHUTDOWN_TIMEOUT)
    }
}

async fn seed(
    config: PipelineConfig,
    source_root: PathBuf,
    run_id: Option<String>,
    extensions: &str,
) -> ExitCode {
    if !source_root.is_dir() {
        error!(path = %source_root.display(), "Source root is not a directory");
        return ExitCode::from(EXIT_VALIDATION);
    }
    let allowed: Vec<String> = extensions
        .split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    if allowed.is_empty() {
        error!("Extension allowlist is empty");
        return ExitCode::from(EXIT_VALIDATION);
    }

    let broker = match connect_broker(&config).await {
        Ok(broker) => broker,
        Err(code) => return code,
    };
    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(code) => return code,
    };

    let run_id = run_id.unwrap_or_else(new_run_id);
    let mut enqueued = 0u64;
    for entry in walkdir::WalkDir::new(&source_root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let matches_ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
            .is_some_and(|ext| allowed.contains(&ext));
        if !matches_ext {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&source_root) else {
            continue;
        };
        let file_path = relative.display().to_string();

        let hash = match std::fs::read(entry.path()) {
            Ok(bytes) => {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(&bytes);
                hex::encode(hasher.finalize())
            }
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                continue;
            }
        };

        let run = run_id.clone();
        let path_for_row = file_path.clone();
        let row = SourceFile::discovered(path_for_row, hash, run);
        if let Err(e) = store
            .transaction(move |tx| {
                queries::runs::ensure(tx, &row.run_id)?;
                queries::files::upsert_discovered(tx, &row)?;
                Ok(())
            })
            .await
        {
            error!(error = %e, "File row write failed");
            return ExitCode::from(EXIT_DEPENDENCY);
        }

        let job = FileAnalysisJob::new(&file_path, &run_id);
        let payload = match serde_json::to_value(&job) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Job payload serialization failed");
                return ExitCode::from(EXIT_VALIDATION);
            }
        };
        if let Err(e) = broker
            .enqueue(queues::FILE_ANALYSIS, payload, JobOptions::default())
            .await
        {
            error!(error = %e, "Enqueue failed");
            return ExitCode::from(EXIT_DEPENDENCY);
        }
        enqueued += 1;
    }

    info!(run_id = %run_id, files = enqueued, "Run seeded");
    println!("{run_id}");
    ExitCode::SUCCESS
}

async fn health(config: PipelineConfig) -> ExitCode {
    let mut healthy = true;

    match open_store(&config).await {
        Ok(store) => match store.health_check().await {
            Ok(()) => println!("staging-store: ok"),
            Err(e) => {
                println!("staging-store: FAILED ({e})");
                healthy = false;
            }
        },
        Err(_) => {
            println!("staging-store: FAILED (unavailable)");
            healthy = false;
        }
    }

    match RedisBroker::connect(&config.redis_url).await {
        Ok(broker) => match broker.counts(queues::FILE_ANALYSIS).await {
            Ok(_) => println!("queue-broker: ok"),
            Err(e) => {
                println!("queue-broker: FAILED ({e})");
                healthy = false;
            }
        },
        Err(e) => {
            println!("queue-broker: FAILED ({e})");
            healthy = false;
        }
    }

    match &config.neo4j_uri {
        Some(uri) => {
            let result = Neo4jGraphStore::connect(&Neo4jConfig {
                uri: uri.clone(),
                user: config.neo4j_user.clone(),
                password: config.neo4j_password.clone(),
            })
            .await;
            match result {
                Ok(graph) => match graph.health_check().await {
                    Ok(()) => println!("graph-store: ok"),
                    Err(e) => {
                        println!("graph-store: FAILED ({e})");
                        healthy = false;
                    }
                },
                Err(e) => {
                    println!("graph-store: FAILED ({e})");
                    healthy = false;
                }
            }
        }
        None => println!("graph-store: skipped (NEO4J_URI unset)"),
    }

    if healthy {
        println!("overall: healthy");
        ExitCode::SUCCESS
    } else {
        println!("overall: UNHEALTHY");
        ExitCode::from(EXIT_VALIDATION)
    }
}

async fn queues_admin(config: PipelineConfig, command: QueueCommand) -> ExitCode {
    let broker = match connect_broker(&config).await {
        Ok(broker) => broker,
        Err(code) => return code,
    };

    match command {
        QueueCommand::Counts => {
            println!(
                "{:<28} {:>8} {:>8} {:>10} {:>8} {:>8} {:>7}",
                "queue", "waiting", "active", "completed", "failed", "delayed", "paused"
            );
            for queue in queues::ALL_QUEUES {
                match broker.counts(queue).await {
                    Ok(counts) => println!(
                        "{:<28} {:>8} {:>8} {:>10} {:>8} {:>8} {:>7}",
                        queue,
                        counts.waiting,
                        counts.active,
                        counts.completed,
                        counts.failed,
                        counts.delayed,
                        counts.paused
                    ),
                    Err(e) => {
                        error!(queue, error = %e, "Counts failed");
                        return ExitCode::from(EXIT_DEPENDENCY);
                    }
                }
            }
            ExitCode::SUCCESS
        }
        QueueCommand::Clean { age_ms, state } => {
            let state = match state.as_str() {
                "completed" => JobState::Completed,
                "failed" => JobState::Failed,
                other => {
                    error!(state = other, "Clean accepts 'completed' or 'failed'");
                    return ExitCode::from(EXIT_VALIDATION);
                }
            };
            let mut removed = 0;
            for queue in queues::ALL_QUEUES {
                match broker.clean(queue, Duration::from_millis(age_ms), state).await {
                    Ok(n) => removed += n,
                    Err(e) => {
                        error!(queue, error = %e, "Clean failed");
                        return ExitCode::from(EXIT_DEPENDENCY);
                    }
                }
            }
            println!("removed {removed} jobs");
            ExitCode::SUCCESS
        }
        QueueCommand::Drain { confirm } => {
            let manager = CleanupManager::new(broker, CleanupConfig::default());
            match manager.emergency_drain(&confirm).await {
                Ok(removed) => {
                    println!("drained {removed} jobs");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Drain refused");
                    ExitCode::from(EXIT_VALIDATION)
                }
            }
        }
        QueueCommand::DeadLetters { queue, limit } => {
            if !queues::is_registered(&queue) {
                error!(queue, "Unknown queue");
                return ExitCode::from(EXIT_VALIDATION);
            }
            match broker.dead_letters(&queue, limit).await {
                Ok(records) => {
                    for record in records {
                        println!(
                            "{} [{}] attempts={} {}",
                            record.timestamp, record.error_type, record.attempts_made, record.error
                        );
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, "Dead-letter read failed");
                    ExitCode::from(EXIT_DEPENDENCY)
                }
            }
        }
    }
}
