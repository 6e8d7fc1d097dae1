// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! HTTPS classifier client.
//!
//! Wraps an OpenAI-compatible chat endpoint with: a per-process concurrency
//! cap, a global token bucket (`API_RATE_LIMIT`), request timeouts, and
//! retry with exponential backoff + jitter. 429 and 5xx are retriable;
//! other 4xx are terminal. The client never holds a database transaction -
//! callers persist results after the call returns.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use codegraph::metrics_constants::{
    METRIC_CLASSIFIER_FAILURES_TOTAL, METRIC_CLASSIFIER_LATENCY_MS,
    METRIC_CLASSIFIER_REQUESTS_TOTAL, METRIC_CLASSIFIER_RETRIES_TOTAL,
};
use codegraph_pool::TokenBucket;

use crate::response::{self, BatchResponse, RoleAssessment, SingleFileResponse};
use crate::{prompts, truncate, BatchFile, Classifier, ClassifierError, RoleRequest};

static REQUESTS: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_CLASSIFIER_REQUESTS_TOTAL, "Total classifier requests"),
        &["kind"],
    )
});
static RETRIES: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(METRIC_CLASSIFIER_RETRIES_TOTAL, "Total classifier request retries"),
        &["kind"],
    )
});
static FAILURES: LazyLock<CounterVec> = LazyLock::new(|| {
    codegraph::metrics_utils::counter_vec(
        Opts::new(
            METRIC_CLASSIFIER_FAILURES_TOTAL,
            "Total classifier failures after all retries",
        ),
        &["kind"],
    )
});
static LATENCY: LazyLock<HistogramVec> = LazyLock::new(|| {
    codegraph::metrics_utils::histogram_vec(
        HistogramOpts::new(
            METRIC_CLASSIFIER_LATENCY_MS,
            "Classifier round-trip latency in milliseconds",
        ),
        &["kind"],
    )
});

/// Client configuration, usually sourced from [`codegraph::PipelineConfig`].
#[derive(Debug, Clone)]
pub struct HttpClassifierConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_concurrency: usize,
    /// Global request rate in requests per second.
    pub rate_limit_per_sec: f64,
}

impl Default for HttpClassifierConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.deepseek.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "deepseek-chat".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_concurrency: 4,
            rate_limit_per_sec: 25.0,
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

/// OpenAI-compatible HTTP classifier.
pub struct HttpClassifier {
    http: reqwest::Client,
    config: HttpClassifierConfig,
    semaphore: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
}

impl HttpClassifier {
    /// Build a client. Fails on an invalid timeout/TLS stack, not on a
    /// missing key - auth errors surface per request.
    pub fn new(config: HttpClassifierConfig) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClassifierError::Terminal(format!("HTTP client build failed: {e}")))?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            bucket: Mutex::new(TokenBucket::per_second(config.rate_limit_per_sec)),
            http,
            config,
        })
    }

    /// Wait for a global rate-limit token.
    async fn wait_for_token(&self) {
        loop {
            let wait = match self.bucket.lock().try_acquire() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base = (self.config.retry_delay.as_millis() as u64).saturating_mul(exp);
        let capped = base.min(30_000);
        let jitter = (capped as f64 * 0.25 * rand::random::<f64>()) as u64;
        Duration::from_millis(capped + jitter)
    }

    async fn call_once(&self, prompt: &str) -> Result<String, ClassifierError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0,
        });
        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout
                } else {
                    ClassifierError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ClassifierError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::MalformedResponse(format!("chat envelope: {e}")))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ClassifierError::MalformedResponse("empty choices".to_string()))
    }

    /// One managed generation: concurrency cap, rate limit, retries.
    async fn generate(&self, kind: &'static str, prompt: &str) -> Result<String, ClassifierError> {
        #[allow(clippy::expect_used)] // semaphore lives as long as self
        let _permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("classifier semaphore closed");

        REQUESTS.with_label_values(&[kind]).inc();
        let started = Instant::now();
        let mut attempt = 0;
        let result = loop {
            self.wait_for_token().await;
            match self.call_once(prompt).await {
                Ok(text) => break Ok(text),
                Err(e) if e.is_retriable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    attempt += 1;
                    RETRIES.with_label_values(&[kind]).inc();
                    warn!(
                        kind,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Classifier request failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        LATENCY.with_label_values(&[kind]).observe(latency_ms);
        if result.is_err() {
            FAILURES.with_label_values(&[kind]).inc();
        } else {
            debug!(kind, latency_ms = latency_ms as u64, "Classifier request complete");
        }
        result
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn analyze_file(
        &self,
        file_path: &str,
        content: &str,
    ) -> Result<SingleFileResponse, ClassifierError> {
        let content = truncate::truncate_middle(content, truncate::MAX_INPUT_CHARS);
        let prompt = prompts::single_file(file_path, &content);
        let text = self.generate("single", &prompt).await?;
        response::parse_single(&text)
    }

    async fn analyze_batch(&self, files: &[BatchFile]) -> Result<BatchResponse, ClassifierError> {
        let prompt = prompts::batch(files);
        let text = self.generate("batch", &prompt).await?;
        let expected: Vec<String> = files.iter().map(|f| f.file_path.clone()).collect();
        response::parse_batch(&text, &expected)
    }

    async fn assess_role(&self, request: &RoleRequest) -> Result<RoleAssessment, ClassifierError> {
        let prompt = prompts::role(request);
        let text = self.generate("role", &prompt).await?;
        response::parse_role(&text)
    }
}
