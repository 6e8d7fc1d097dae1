// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Redis-backed queue implementation.
//!
//! Layout per queue (prefix `cg:{queue}`):
//!
//! - `:waiting` - list of job ids (LPUSH / RPOP; priority jobs jump the line)
//! - `:active` - list of job ids currently reserved
//! - `:delayed` - sorted set of job ids, scored by ready-at epoch millis
//! - `:jobs` - hash of job id -> immutable job JSON (payload + options)
//! - `:meta` - hash of `attempts:{id}` / `reserved:{id}` / `error:{id}`
//! - `:completed` / `:failed` - sorted sets scored by finish time
//! - `:dead` - list of dead-letter record JSON
//! - `:paused` - pause flag
//! - `:dedupe:{key}` - idempotency sentinels (SET NX with TTL)
//!
//! Mutable per-delivery state lives in `:meta`, not inside the job JSON, so
//! Lua never has to round-trip JSON through `cjson`. State transitions that
//! must be atomic (reserve, fail) run as Lua scripts; everything else uses
//! plain commands or atomic pipelines.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::broker::{
    BrokerError, BrokerResult, EnqueueOutcome, FailOutcome, JobState, QueueBroker, QueueCounts,
};
use crate::dead_letter::DeadLetterRecord;
use crate::job::{Job, JobOptions};

/// Reserve poll granularity while waiting for work.
const RESERVE_POLL: Duration = Duration::from_millis(100);
/// TTL for idempotency sentinels.
const DEDUPE_TTL_SECS: u64 = 24 * 60 * 60;
/// Dead letters retained per queue.
const MAX_DEAD_LETTERS: isize = 10_000;

/// Atomically promote due delayed jobs, then move one waiting job to active.
/// Returns `{job_json, attempts_made}` or false when nothing is available.
const RESERVE_SCRIPT: &str = r#"
    local waiting = KEYS[1]
    local active = KEYS[2]
    local delayed = KEYS[3]
    local jobs = KEYS[4]
    local meta = KEYS[5]
    local now_ms = tonumber(ARGV[1])
    local now_iso = ARGV[2]

    local due = redis.call('ZRANGEBYSCORE', delayed, '-inf', now_ms)
    for _, id in ipairs(due) do
        redis.call('ZREM', delayed, id)
        redis.call('LPUSH', waiting, id)
    end

    local id = redis.call('RPOP', waiting)
    if not id then
        return false
    end

    local raw = redis.call('HGET', jobs, id)
    if not raw then
        -- Orphaned id (job record cleaned underneath); drop it.
        return false
    end

    local attempts = redis.call('HINCRBY', meta, 'attempts:' .. id, 1)
    redis.call('HSET', meta, 'reserved:' .. id, now_iso)
    redis.call('LPUSH', active, id)
    return { raw, attempts }
"#;

/// Atomically remove a job from active and either schedule a retry or move
/// it to the dead-letter list. Returns 1 when retried, 0 when dead-lettered.
const FAIL_SCRIPT: &str = r#"
    local active = KEYS[1]
    local delayed = KEYS[2]
    local failed = KEYS[3]
    local dead = KEYS[4]
    local jobs = KEYS[5]
    local meta = KEYS[6]
    local id = ARGV[1]
    local err = ARGV[2]
    local retry_at = tonumber(ARGV[3])
    local dead_record = ARGV[4]
    local now_ms = tonumber(ARGV[5])
    local remove_on_fail = ARGV[6]
    local max_dead = tonumber(ARGV[7])

    redis.call('LREM', active, 1, id)
    redis.call('HSET', meta, 'error:' .. id, err)
    redis.call('HDEL', meta, 'reserved:' .. id)

    if retry_at >= 0 then
        redis.call('ZADD', delayed, retry_at, id)
        return 1
    end

    redis.call('LPUSH', dead, dead_record)
    redis.call('LTRIM', dead, 0, max_dead - 1)
    if remove_on_fail == '1' then
        redis.call('HDEL', jobs, id)
        redis.call('HDEL', meta, 'attempts:' .. id, 'error:' .. id)
    else
        redis.call('ZADD', failed, now_ms, id)
    end
    return 0
"#;

fn map_err(e: redis::RedisError) -> BrokerError {
    if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
        BrokerError::Connection(e.to_string())
    } else {
        BrokerError::Backend(e.to_string())
    }
}

fn encode_job(job: &Job) -> BrokerResult<String> {
    serde_json::to_string(job).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn decode_job(raw: &str) -> BrokerResult<Job> {
    serde_json::from_str(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
}

/// Redis-backed [`QueueBroker`].
pub struct RedisBroker {
    conn: ConnectionManager,
    reserve_script: redis::Script,
    fail_script: redis::Script,
}

impl RedisBroker {
    /// Connect to Redis. Fails fast when the broker is unreachable - a
    /// missing queue backend at startup is a fatal dependency error.
    pub async fn connect(redis_url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(redis_url).map_err(map_err)?;
        let conn = ConnectionManager::new(client).await.map_err(map_err)?;
        Ok(Self {
            conn,
            reserve_script: redis::Script::new(RESERVE_SCRIPT),
            fail_script: redis::Script::new(FAIL_SCRIPT),
        })
    }

    fn key(queue: &str, suffix: &str) -> String {
        format!("cg:{queue}:{suffix}")
    }

    async fn load_job(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> BrokerResult<Option<Job>> {
        let raw: Option<String> = conn
            .hget(Self::key(queue, "jobs"), id)
            .await
            .map_err(map_err)?;
        let Some(raw) = raw else { return Ok(None) };
        let mut job = decode_job(&raw)?;

        let meta_key = Self::key(queue, "meta");
        let (attempts, reserved, error): (Option<u32>, Option<String>, Option<String>) =
            redis::pipe()
                .hget(&meta_key, format!("attempts:{id}"))
                .hget(&meta_key, format!("reserved:{id}"))
                .hget(&meta_key, format!("error:{id}"))
                .query_async(conn)
                .await
                .map_err(map_err)?;
        job.attempts_made = attempts.unwrap_or(0);
        job.reserved_at = reserved
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        job.last_error = error;
        Ok(Some(job))
    }
}

#[async_trait]
impl QueueBroker for RedisBroker {
    async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> BrokerResult<EnqueueOutcome> {
        let mut conn = self.conn.clone();

        if let Some(key) = &opts.idempotency_key {
            let dedupe_key = Self::key(queue, &format!("dedupe:{key}"));
            let set: Option<String> = redis::cmd("SET")
                .arg(&dedupe_key)
                .arg("1")
                .arg("NX")
                .arg("EX")
                .arg(DEDUPE_TTL_SECS)
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
            if set.is_none() {
                debug!(queue, idempotency_key = %key, "Duplicate enqueue rejected");
                return Ok(EnqueueOutcome::Duplicate);
            }
        }

        let delay_ms = opts.delay_ms;
        let priority = opts.priority;
        let job = Job::new(queue, payload, opts);
        let id = job.id.clone();
        let raw = encode_job(&job)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(Self::key(queue, "jobs"), &id, &raw).ignore();
        match delay_ms {
            Some(ms) if ms > 0 => {
                let ready_at = Utc::now().timestamp_millis() + ms as i64;
                pipe.zadd(Self::key(queue, "delayed"), &id, ready_at).ignore();
            }
            _ => {
                // LPUSH + RPOP gives FIFO; priority jobs enter at the pop end.
                if priority > 0 {
                    pipe.rpush(Self::key(queue, "waiting"), &id).ignore();
                } else {
                    pipe.lpush(Self::key(queue, "waiting"), &id).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await.map_err(map_err)?;
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn reserve(&self, queue: &str, wait: Duration) -> BrokerResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let paused_key = Self::key(queue, "paused");
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let paused: bool = conn.exists(&paused_key).await.map_err(map_err)?;
            if !paused {
                let now = Utc::now();
                let reserved: Option<(String, u32)> = self
                    .reserve_script
                    .key(Self::key(queue, "waiting"))
                    .key(Self::key(queue, "active"))
                    .key(Self::key(queue, "delayed"))
                    .key(Self::key(queue, "jobs"))
                    .key(Self::key(queue, "meta"))
                    .arg(now.timestamp_millis())
                    .arg(now.to_rfc3339())
                    .invoke_async(&mut conn)
                    .await
                    .map_err(map_err)?;
                if let Some((raw, attempts)) = reserved {
                    let mut job = decode_job(&raw)?;
                    job.attempts_made = attempts;
                    job.reserved_at = Some(now);
                    return Ok(Some(job));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESERVE_POLL.min(wait)).await;
        }
    }

    async fn ack(&self, job: &Job) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let meta_key = Self::key(&job.queue, "meta");
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.lrem(Self::key(&job.queue, "active"), 1, &job.id).ignore();
        pipe.hdel(&meta_key, format!("reserved:{}", job.id)).ignore();
        if job.opts.remove_on_complete {
            pipe.hdel(Self::key(&job.queue, "jobs"), &job.id).ignore();
            pipe.hdel(&meta_key, format!("attempts:{}", job.id)).ignore();
            pipe.hdel(&meta_key, format!("error:{}", job.id)).ignore();
        } else {
            pipe.zadd(
                Self::key(&job.queue, "completed"),
                &job.id,
                Utc::now().timestamp_millis(),
            )
            .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(map_err)
    }

    async fn fail(
        &self,
        job: &Job,
        error: &str,
        retriable: bool,
        delay_override: Option<Duration>,
    ) -> BrokerResult<FailOutcome> {
        let mut conn = self.conn.clone();

        let retry = retriable && job.has_attempts_remaining();
        let (retry_at, delay) = if retry {
            let delay = delay_override.unwrap_or_else(|| {
                job.opts
                    .backoff
                    .delay_for_attempt(job.attempts_made.saturating_sub(1))
            });
            (
                Utc::now().timestamp_millis() + delay.as_millis() as i64,
                delay,
            )
        } else {
            (-1, Duration::ZERO)
        };

        let error_type = if retriable { "attempts_exhausted" } else { "permanent" };
        let mut for_record = job.clone();
        for_record.last_error = Some(error.to_string());
        let dead_record = DeadLetterRecord::from_job(&for_record, error, error_type);
        let dead_json = serde_json::to_string(&dead_record)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let retried: i32 = self
            .fail_script
            .key(Self::key(&job.queue, "active"))
            .key(Self::key(&job.queue, "delayed"))
            .key(Self::key(&job.queue, "failed"))
            .key(Self::key(&job.queue, "dead"))
            .key(Self::key(&job.queue, "jobs"))
            .key(Self::key(&job.queue, "meta"))
            .arg(&job.id)
            .arg(error)
            .arg(retry_at)
            .arg(dead_json)
            .arg(Utc::now().timestamp_millis())
            .arg(if job.opts.remove_on_fail { "1" } else { "0" })
            .arg(MAX_DEAD_LETTERS)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        if retried == 1 {
            Ok(FailOutcome::Retried { delay })
        } else {
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                error_type,
                "Job dead-lettered"
            );
            Ok(FailOutcome::DeadLettered)
        }
    }

    async fn counts(&self, queue: &str) -> BrokerResult<QueueCounts> {
        let mut conn = self.conn.clone();
        let (waiting, active, completed, failed, delayed, paused): (u64, u64, u64, u64, u64, bool) =
            redis::pipe()
                .llen(Self::key(queue, "waiting"))
                .llen(Self::key(queue, "active"))
                .zcard(Self::key(queue, "completed"))
                .zcard(Self::key(queue, "failed"))
                .zcard(Self::key(queue, "delayed"))
                .exists(Self::key(queue, "paused"))
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
        Ok(QueueCounts {
            waiting,
            active,
            completed,
            failed,
            delayed,
            paused,
        })
    }

    async fn drain(&self, queue: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let total: u64 = conn
            .hlen(Self::key(queue, "jobs"))
            .await
            .map_err(map_err)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for suffix in ["waiting", "active", "delayed", "completed", "failed", "jobs", "meta"] {
            pipe.del(Self::key(queue, suffix)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(map_err)?;
        Ok(total)
    }

    async fn clean(&self, queue: &str, older_than: Duration, state: JobState) -> BrokerResult<u64> {
        let suffix = match state {
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            // Waiting/active jobs are not age-cleaned here; stuck active jobs
            // go through the cleanup manager's stale sweep instead.
            JobState::Waiting | JobState::Active | JobState::Paused => return Ok(0),
        };
        let mut conn = self.conn.clone();
        let set_key = Self::key(queue, suffix);
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;

        let ids: Vec<String> = conn
            .zrangebyscore(&set_key, i64::MIN, cutoff)
            .await
            .map_err(map_err)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let meta_key = Self::key(queue, "meta");
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &ids {
            pipe.zrem(&set_key, id).ignore();
            pipe.hdel(Self::key(queue, "jobs"), id).ignore();
            pipe.hdel(&meta_key, format!("attempts:{id}")).ignore();
            pipe.hdel(&meta_key, format!("error:{id}")).ignore();
        }
        pipe.query_async::<()>(&mut conn).await.map_err(map_err)?;
        Ok(ids.len() as u64)
    }

    async fn pause(&self, queue: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::key(queue, "paused"), "1")
            .await
            .map_err(map_err)
    }

    async fn resume(&self, queue: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(queue, "paused"))
            .await
            .map_err(map_err)
    }

    async fn dead_letters(&self, queue: &str, limit: usize) -> BrokerResult<Vec<DeadLetterRecord>> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(Self::key(queue, "dead"), 0, limit as isize - 1)
            .await
            .map_err(map_err)?;
        let mut records = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str(&item) {
                Ok(record) => records.push(record),
                Err(e) => warn!(queue, error = %e, "Skipping undecodable dead-letter record"),
            }
        }
        Ok(records)
    }

    async fn stale_active(&self, queue: &str, older_than: Duration) -> BrokerResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .lrange(Self::key(queue, "active"), 0, -1)
            .await
            .map_err(map_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than.as_millis() as i64);
        let mut stale = Vec::new();
        for id in ids {
            if let Some(job) = self.load_job(&mut conn, queue, &id).await? {
                if job.reserved_at.is_some_and(|at| at < cutoff) {
                    stale.push(job);
                }
            }
        }
        Ok(stale)
    }
}
