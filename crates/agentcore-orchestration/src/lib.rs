#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **agentcore-orchestration** – the coordination core's single flat façade.
//!
//! Everything an API handler needs sits behind [`Core`]: send/receive a
//! message, register an agent, distribute a task, adjust rate limits, or
//! reset a breaker. `Core` is the only layer in this workspace that accepts
//! bearer tokens from a caller — every subsystem beneath it (the broker,
//! the rate limiter, the distributor) either receives an already-scoped
//! call or forwards the token straight to the communication manager, which
//! owns the authorization check colocated with the send/receive it guards.
//!
//! ## Architecture
//!
//! - **[`Core`]**: owns one instance each of the broker, rate limiter,
//!   breaker registry, communication manager, and task distributor, and
//!   exposes their operations as flat async methods.
//! - **[`CoreConfig`]**: construction-time tunables — rate-limit quotas,
//!   breaker thresholds, and the TTL sweeper's cadence.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use agentcore_orchestration::{Core, CoreConfig};
//! use agentcore_auth::hs256::JwtHs256Validator;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let validator = Arc::new(JwtHs256Validator::new("dev-secret"));
//! let core = Core::new(validator, CoreConfig::default()).await;
//! core.shutdown().await;
//! # }
//! ```
//!
//! ## Security
//!
//! - Every send/receive/callback-registration call accepts an optional
//!   bearer token; when present it must carry the right scope and name the
//!   operation's own agent as its subject.
//! - Admin operations (`update_rate_limit`, `reset_all_breakers`) are not
//!   gated here — callers are expected to enforce the `admin` scope at the
//!   API-handler layer before reaching `Core`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agentcore_auth::TokenValidator;
use agentcore_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use agentcore_bus::{DeliveryCallback, MessageBroker};
use agentcore_comm::{Capabilities, CommunicationManager};
use agentcore_distributor::{DistributeParams, DistributionResult, TaskDistributor};
use agentcore_errors::CoreError;
use agentcore_ratelimit::{RateLimitConfig, RateLimitDimension, RateLimiter};
use agentcore_types::{AgentId, Message};

/// Construction-time configuration for [`Core`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Quotas for the rate limiter's four dimensions.
    pub rate_limit: RateLimitConfig,
    /// Thresholds for the shared `"agent_communication"` circuit breaker.
    pub breaker: CircuitBreakerConfig,
    /// Cadence of the message broker's background TTL sweeper.
    pub ttl_sweep_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            ttl_sweep_interval: Duration::from_secs(60),
        }
    }
}

/// The coordination core: one broker, one rate limiter, one breaker
/// registry, one communication manager, and one task distributor, wired
/// together and exposed as a flat set of async operations.
pub struct Core<V: TokenValidator> {
    broker: Arc<MessageBroker>,
    rate_limiter: Arc<RateLimiter>,
    breaker_registry: Arc<CircuitBreakerRegistry>,
    comm: Arc<CommunicationManager<V>>,
    distributor: Arc<TaskDistributor<V>>,
}

impl<V: TokenValidator> Core<V> {
    /// Builds every subsystem singleton and starts the broker's background
    /// TTL sweeper.
    pub async fn new(token_validator: Arc<V>, config: CoreConfig) -> Self {
        let broker = Arc::new(MessageBroker::new());
        broker.spawn_ttl_sweeper(config.ttl_sweep_interval);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let breaker_registry = Arc::new(CircuitBreakerRegistry::new());
        // `agent_communication`'s config is pinned at first use; later
        // callers of `get_or_create` with a different config still get
        // this same instance.
        breaker_registry
            .get_or_create(
                agentcore_comm::AGENT_COMMUNICATION_BREAKER,
                config.breaker,
            )
            .await;

        let comm = Arc::new(
            CommunicationManager::new(
                broker.clone(),
                rate_limiter.clone(),
                &breaker_registry,
                token_validator,
            )
            .await,
        );
        let distributor = Arc::new(TaskDistributor::new(comm.clone()));

        Self {
            broker,
            rate_limiter,
            breaker_registry,
            comm,
            distributor,
        }
    }

    /// Registers an agent with the communication manager (capabilities
    /// cache, broker queue) and, when `task_capabilities` is given, with
    /// the task distributor as a distribution candidate.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        communication_capabilities: Capabilities,
        task_capabilities: Option<(HashSet<String>, i64)>,
    ) {
        self.comm
            .register_agent(agent_id.clone(), communication_capabilities)
            .await;
        if let Some((capabilities, priority_rank)) = task_capabilities {
            self.distributor
                .register_agent(agent_id, capabilities, priority_rank)
                .await;
        }
    }

    /// Removes an agent from the task distributor's candidate pool. The
    /// communication manager has no matching unregister — its capability
    /// cache and the broker's queue are keyed by agent id for the process
    /// lifetime, per the shared-resource policy.
    pub async fn unregister_task_candidate(&self, agent_id: &AgentId) {
        self.distributor.unregister_agent(agent_id).await;
    }

    /// Updates an agent's online/load status as tracked by the task
    /// distributor.
    pub async fn update_agent_status(
        &self,
        agent_id: &AgentId,
        online: bool,
        current_load: Option<u64>,
    ) {
        self.distributor
            .update_agent_status(agent_id, online, current_load)
            .await;
    }

    /// Sends a message through the communication manager.
    pub async fn send_message(
        &self,
        message: Message,
        auth_token: Option<&str>,
    ) -> Result<String, CoreError> {
        self.comm.send(message, auth_token).await
    }

    /// Pulls queued messages for an agent through the communication
    /// manager.
    pub async fn get_messages(
        &self,
        agent_id: &AgentId,
        mark_delivered: bool,
        auth_token: Option<&str>,
    ) -> Result<Vec<Message>, CoreError> {
        self.comm.get_messages(agent_id, mark_delivered, auth_token).await
    }

    /// Registers a push-delivery callback for an agent.
    pub async fn register_delivery_callback(
        &self,
        agent_id: &AgentId,
        callback: DeliveryCallback,
        auth_token: Option<&str>,
    ) -> Result<(), CoreError> {
        self.comm.register_callback(agent_id, callback, auth_token).await
    }

    /// Distributes a task through the task distributor.
    pub async fn distribute_task(
        &self,
        params: DistributeParams,
    ) -> Result<DistributionResult, CoreError> {
        self.distributor.distribute(params).await
    }

    /// Records a task's completion/failure, decrementing the executing
    /// agent's load.
    pub async fn handle_task_response(&self, task_id: &str, agent_id: &AgentId, status: &str) {
        self.distributor.handle_response(task_id, agent_id, status).await;
    }

    /// Admin surface: current rate-limit configuration.
    pub async fn get_rate_limits(&self) -> RateLimitConfig {
        self.rate_limiter.get_rate_limits().await
    }

    /// Admin surface: reconfigures one rate-limit dimension's quota. `key`
    /// selects the bucket within `MessageType`/`Priority`; it is ignored
    /// for `Agent`/`Global`, which enforce a single shared quota.
    pub async fn update_rate_limit(
        &self,
        dimension: RateLimitDimension,
        key: Option<&str>,
        max_tokens: u64,
        window_secs: f64,
    ) -> Result<(), CoreError> {
        self.rate_limiter
            .update_rate_limit(dimension, key, max_tokens, window_secs)
            .await
    }

    /// Admin surface: forces every registered circuit breaker back to
    /// `CLOSED`, clearing failure history.
    pub async fn reset_all_breakers(&self) {
        self.breaker_registry.reset_all().await;
    }

    /// Cancels the broker's TTL sweeper and releases the communication
    /// manager's resources. Idempotent — safe to call more than once.
    pub async fn shutdown(&self) {
        self.comm.shutdown().await;
        self.broker.shutdown().await;
    }
}
