#![forbid(unsafe_code)]

//! Multi-dimensional token-bucket rate limiting for the coordination core.
//!
//! Every send is checked against four independent quotas — the sending
//! agent, the message type, the message's priority, and a global ceiling —
//! in that order. A deny on any dimension leaves every bucket untouched:
//! tokens are only deducted once all four checks pass.

use std::collections::HashMap;

use agentcore_errors::CoreError;
use agentcore_types::{AgentId, MessageType, Priority};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Which quota rejected a request, surfaced in the error details and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitDimension {
    Agent,
    MessageType,
    Priority,
    Global,
}

impl std::fmt::Display for RateLimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RateLimitDimension::Agent => "agent",
            RateLimitDimension::MessageType => "message_type",
            RateLimitDimension::Priority => "priority",
            RateLimitDimension::Global => "global",
        };
        f.write_str(s)
    }
}

/// A single quota: `capacity` tokens, replenished continuously at
/// `refill_rate` tokens/second, capped at `capacity`.
///
/// Replenishment is driven by `tokio::time::Instant`, a monotonic clock that
/// respects `tokio::time::pause`/`advance` under `#[tokio::test]`, rather
/// than wall-clock time — so tests can fast-forward a quota window without
/// an equivalent real sleep.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: f64,
    pub refill_rate: f64,
    tokens: f64,
    #[serde(skip)]
    last_replenished: Option<Instant>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_replenished: None,
        }
    }

    /// Quota from a `limit` per `window_secs`, e.g. `per_window(100, 60.0)`.
    pub fn per_window(limit: u64, window_secs: f64) -> Self {
        Self::new(limit as f64, limit as f64 / window_secs)
    }

    /// Replenishes tokens based on elapsed time. When the elapsed time would
    /// add less than one whole token, `last_replenished` is left untouched
    /// so the fractional progress carries over to the next call instead of
    /// resetting the clock.
    fn replenish(&mut self, now: Instant) {
        let last = match self.last_replenished {
            Some(t) => t,
            None => {
                self.last_replenished = Some(now);
                return;
            }
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let tokens_to_add = elapsed * self.refill_rate;
        if tokens_to_add >= 1.0 {
            self.tokens = (self.tokens + tokens_to_add.floor()).min(self.capacity);
            self.last_replenished = Some(now);
        }
    }

    fn available(&self) -> bool {
        self.tokens >= 1.0
    }

    fn consume(&mut self) {
        self.tokens -= 1.0;
    }

    fn retry_after_secs(&self) -> u64 {
        if self.refill_rate <= 0.0 {
            return u64::MAX;
        }
        let deficit = 1.0 - self.tokens;
        (deficit / self.refill_rate).ceil().max(1.0) as u64
    }
}

/// A quota's tunable shape: a token ceiling and the window (in seconds) it
/// replenishes over. Mirrors `rate_limiting.py`'s `(max_tokens, interval)`
/// pair stored per dimension/key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketSpec {
    pub max_tokens: u64,
    pub window_secs: f64,
}

impl BucketSpec {
    pub fn new(max_tokens: u64, window_secs: f64) -> Self {
        Self {
            max_tokens,
            window_secs,
        }
    }

    fn bucket(self) -> TokenBucket {
        TokenBucket::per_window(self.max_tokens, self.window_secs)
    }
}

/// Static configuration for all four quota dimensions. Defaults mirror the
/// original per-minute budgets: 100 messages/min per agent, 1000/min
/// globally, per-message-type budgets tuned to each type's expected
/// traffic, and per-priority budgets that let HIGH-priority traffic starve
/// less under load.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Shared agent-wide quota — matches upstream, where the `AGENT`
    /// dimension is always looked up under a single `"default"` entry
    /// regardless of which agent is sending, not one bucket per agent id.
    pub agent: BucketSpec,
    pub global: BucketSpec,
    pub message_type_limits: HashMap<MessageType, BucketSpec>,
    pub default_message_type_limit: BucketSpec,
    pub priority_limits: HashMap<Priority, BucketSpec>,
    pub default_priority_limit: BucketSpec,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut message_type_limits = HashMap::new();
        message_type_limits.insert(MessageType::Direct, BucketSpec::new(50, WINDOW_SECS));
        message_type_limits.insert(MessageType::Broadcast, BucketSpec::new(10, WINDOW_SECS));
        message_type_limits.insert(MessageType::TaskRequest, BucketSpec::new(20, WINDOW_SECS));
        message_type_limits.insert(MessageType::TaskResponse, BucketSpec::new(20, WINDOW_SECS));
        message_type_limits.insert(MessageType::StatusUpdate, BucketSpec::new(30, WINDOW_SECS));
        message_type_limits.insert(MessageType::Error, BucketSpec::new(20, WINDOW_SECS));
        message_type_limits.insert(MessageType::System, BucketSpec::new(10, WINDOW_SECS));

        let mut priority_limits = HashMap::new();
        priority_limits.insert(Priority::High, BucketSpec::new(50, WINDOW_SECS));
        priority_limits.insert(Priority::Medium, BucketSpec::new(100, WINDOW_SECS));
        priority_limits.insert(Priority::Low, BucketSpec::new(200, WINDOW_SECS));

        Self {
            agent: BucketSpec::new(100, WINDOW_SECS),
            global: BucketSpec::new(1000, WINDOW_SECS),
            message_type_limits,
            default_message_type_limit: BucketSpec::new(50, WINDOW_SECS),
            priority_limits,
            default_priority_limit: BucketSpec::new(100, WINDOW_SECS),
        }
    }
}

impl RateLimitConfig {
    fn message_type_limit(&self, message_type: MessageType) -> BucketSpec {
        self.message_type_limits
            .get(&message_type)
            .copied()
            .unwrap_or(self.default_message_type_limit)
    }

    fn priority_limit(&self, priority: Priority) -> BucketSpec {
        self.priority_limits
            .get(&priority)
            .copied()
            .unwrap_or(self.default_priority_limit)
    }
}

fn parse_message_type(key: Option<&str>) -> Result<MessageType, CoreError> {
    let key = key.ok_or_else(|| CoreError::validation("the message_type dimension requires a key"))?;
    serde_json::from_value(serde_json::Value::String(key.to_string()))
        .map_err(|_| CoreError::validation(format!("unknown message type '{key}'")))
}

fn parse_priority(key: Option<&str>) -> Result<Priority, CoreError> {
    let key = key.ok_or_else(|| CoreError::validation("the priority dimension requires a key"))?;
    serde_json::from_value(serde_json::Value::String(key.to_string()))
        .map_err(|_| CoreError::validation(format!("unknown priority '{key}'")))
}

struct State {
    agent_buckets: HashMap<AgentId, TokenBucket>,
    message_type_buckets: HashMap<MessageType, TokenBucket>,
    priority_buckets: HashMap<Priority, TokenBucket>,
    global_bucket: TokenBucket,
}

/// Enforces the four independent quotas behind a single lock. A single
/// lock (rather than one per dimension) keeps the peek-then-consume check
/// atomic without needing lock ordering across buckets.
pub struct RateLimiter {
    config: Mutex<RateLimitConfig>,
    state: Mutex<State>,
}

const WINDOW_SECS: f64 = 60.0;

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let global_bucket = config.global.bucket();
        Self {
            config: Mutex::new(config),
            state: Mutex::new(State {
                agent_buckets: HashMap::new(),
                message_type_buckets: HashMap::new(),
                priority_buckets: HashMap::new(),
                global_bucket,
            }),
        }
    }

    /// Checks all four dimensions and, only if every one currently has
    /// capacity, deducts one token from each. Returns the dimension that
    /// denied the request (with a `retry_after` hint) on failure.
    pub async fn check(
        &self,
        agent_id: &AgentId,
        message_type: MessageType,
        priority: Priority,
    ) -> Result<(), CoreError> {
        let now = Instant::now();
        let config = self.config.lock().await;
        let mut state = self.state.lock().await;

        let agent_spec = config.agent;
        let message_type_spec = config.message_type_limit(message_type);
        let priority_spec = config.priority_limit(priority);

        let agent_bucket = state
            .agent_buckets
            .entry(agent_id.clone())
            .or_insert_with(|| agent_spec.bucket());
        agent_bucket.replenish(now);

        let message_type_bucket = state
            .message_type_buckets
            .entry(message_type)
            .or_insert_with(|| message_type_spec.bucket());
        message_type_bucket.replenish(now);

        let priority_bucket = state
            .priority_buckets
            .entry(priority)
            .or_insert_with(|| priority_spec.bucket());
        priority_bucket.replenish(now);

        state.global_bucket.replenish(now);

        let checks = [
            (RateLimitDimension::Agent, &state.agent_buckets[agent_id]),
            (
                RateLimitDimension::MessageType,
                &state.message_type_buckets[&message_type],
            ),
            (
                RateLimitDimension::Priority,
                &state.priority_buckets[&priority],
            ),
            (RateLimitDimension::Global, &state.global_bucket),
        ];

        for (dimension, bucket) in checks {
            if !bucket.available() {
                let retry_after = bucket.retry_after_secs();
                tracing::warn!(
                    agent = %agent_id,
                    dimension = %dimension,
                    retry_after,
                    "rate limit exceeded"
                );
                return Err(CoreError::rate_limited(
                    format!("rate limit exceeded on dimension '{dimension}'"),
                    retry_after,
                )
                .with_detail("dimension", dimension.to_string()));
            }
        }

        state.agent_buckets.get_mut(agent_id).unwrap().consume();
        state
            .message_type_buckets
            .get_mut(&message_type)
            .unwrap()
            .consume();
        state
            .priority_buckets
            .get_mut(&priority)
            .unwrap()
            .consume();
        state.global_bucket.consume();

        Ok(())
    }

    /// Admin surface: current configuration snapshot.
    pub async fn get_rate_limits(&self) -> RateLimitConfig {
        self.config.lock().await.clone()
    }

    /// Admin surface: reconfigures one dimension's quota. `key` selects
    /// which bucket within the dimension — a `MessageType`/`Priority`'s
    /// wire name for those two dimensions, ignored for `Agent`/`Global`,
    /// which each enforce a single shared quota (matching
    /// `rate_limiting.py`'s `RateLimitType.AGENT`/`GLOBAL` tables, which are
    /// always read under a `"default"` entry regardless of the caller's
    /// key). `Global` resizes its single live bucket immediately since
    /// exactly one exists; `Agent`/`MessageType`/`Priority` are keyed maps
    /// of per-key buckets, so the new quota applies to that key's bucket
    /// the next time it is replenished or first created.
    pub async fn update_rate_limit(
        &self,
        dimension: RateLimitDimension,
        key: Option<&str>,
        max_tokens: u64,
        window_secs: f64,
    ) -> Result<(), CoreError> {
        if max_tokens < 1 {
            return Err(CoreError::validation("max_tokens must be at least 1"));
        }
        if window_secs < 1.0 {
            return Err(CoreError::validation("interval must be at least 1 second"));
        }
        let spec = BucketSpec::new(max_tokens, window_secs);

        let mut config = self.config.lock().await;
        match dimension {
            RateLimitDimension::Global => {
                config.global = spec;
                drop(config);
                self.state.lock().await.global_bucket = spec.bucket();
            }
            RateLimitDimension::Agent => {
                config.agent = spec;
            }
            RateLimitDimension::MessageType => {
                let message_type = parse_message_type(key)?;
                config.message_type_limits.insert(message_type, spec);
            }
            RateLimitDimension::Priority => {
                let priority = parse_priority(key)?;
                config.priority_limits.insert(priority, spec);
            }
        }
        Ok(())
    }
}
