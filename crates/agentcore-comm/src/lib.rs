#![forbid(unsafe_code)]

//! **agentcore-comm** – the guarded front door onto the message broker.
//!
//! Every public operation runs through the same three concerns, always in
//! this order: authorization (only when a caller supplies a token),
//! rate limiting (sends only), then a circuit-breaker wrap around the
//! underlying broker call. A per-agent capabilities cache (an opaque map
//! supplied at registration) rides alongside.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agentcore_auth::{Claims, TokenValidator};
use agentcore_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
use agentcore_bus::{DeliveryCallback, MessageBroker};
use agentcore_errors::{codes, CoreError};
use agentcore_ratelimit::RateLimiter;
use agentcore_types::{AgentId, Message, MessageType};
use tokio::sync::Mutex;

/// The named breaker every communication manager instance guards sends,
/// receives, and callback registration with.
pub const AGENT_COMMUNICATION_BREAKER: &str = "agent_communication";

/// Opaque per-agent capability map, supplied wholesale at registration.
pub type Capabilities = serde_json::Map<String, serde_json::Value>;

async fn check_auth<V: TokenValidator>(
    validator: &V,
    auth_token: Option<&str>,
    required_scopes: &[&str],
    subject_agent: &AgentId,
) -> Result<(), CoreError> {
    let Some(token) = auth_token else {
        return Ok(());
    };
    let claims: Claims = validator.validate(token, required_scopes).await?;
    if claims.sub != subject_agent.as_str() {
        return Err(CoreError::authorization(format!(
            "token subject '{}' does not match agent '{}'",
            claims.sub, subject_agent
        ))
        .with_code(codes::AUTH_SUBJECT_MISMATCH));
    }
    Ok(())
}

/// Guards a [`MessageBroker`] with authorization, rate limiting, and a
/// circuit breaker.
pub struct CommunicationManager<V: TokenValidator> {
    broker: Arc<MessageBroker>,
    rate_limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    token_validator: Arc<V>,
    capabilities: Mutex<HashMap<AgentId, Capabilities>>,
}

impl<V: TokenValidator> CommunicationManager<V> {
    /// Obtains the shared `"agent_communication"` breaker from `registry`
    /// (creating it with default thresholds on first use) and wires it to
    /// `broker`/`rate_limiter`.
    pub async fn new(
        broker: Arc<MessageBroker>,
        rate_limiter: Arc<RateLimiter>,
        breaker_registry: &CircuitBreakerRegistry,
        token_validator: Arc<V>,
    ) -> Self {
        let breaker = breaker_registry
            .get_or_create(AGENT_COMMUNICATION_BREAKER, CircuitBreakerConfig::default())
            .await;
        Self {
            broker,
            rate_limiter,
            breaker,
            token_validator,
            capabilities: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an agent with the broker and caches its (opaque)
    /// communication capabilities.
    pub async fn register_agent(&self, agent_id: AgentId, capabilities: Capabilities) {
        self.broker.register(agent_id.clone()).await;
        self.capabilities.lock().await.insert(agent_id, capabilities);
    }

    /// Sends a message. Only `send` is rate-limited; `auth_token`, when
    /// given, must carry `agent:execute` and name `message.sender_id` as
    /// its subject.
    pub async fn send(
        &self,
        message: Message,
        auth_token: Option<&str>,
    ) -> Result<String, CoreError> {
        check_auth(
            self.token_validator.as_ref(),
            auth_token,
            &[agentcore_auth::scopes::AGENT_EXECUTE],
            &message.sender_id,
        )
        .await?;

        self.rate_limiter
            .check(&message.sender_id, message.message_type, message.priority)
            .await?;

        let broker = self.broker.clone();
        self.breaker.execute(|| async move { broker.send(message).await }).await
    }

    /// Pulls queued messages for `agent_id`. `auth_token`, when given, must
    /// carry `agent:execute` and name `agent_id` as its subject.
    pub async fn get_messages(
        &self,
        agent_id: &AgentId,
        mark_delivered: bool,
        auth_token: Option<&str>,
    ) -> Result<Vec<Message>, CoreError> {
        check_auth(
            self.token_validator.as_ref(),
            auth_token,
            &[agentcore_auth::scopes::AGENT_EXECUTE],
            agent_id,
        )
        .await?;

        let broker = self.broker.clone();
        let agent_id = agent_id.clone();
        self.breaker
            .execute(|| async move { Ok(broker.get_messages(&agent_id, mark_delivered).await) })
            .await
    }

    /// Registers a push-delivery callback for `agent_id`.
    pub async fn register_callback(
        &self,
        agent_id: &AgentId,
        callback: DeliveryCallback,
        auth_token: Option<&str>,
    ) -> Result<(), CoreError> {
        check_auth(
            self.token_validator.as_ref(),
            auth_token,
            &[agentcore_auth::scopes::AGENT_EXECUTE],
            agent_id,
        )
        .await?;

        let broker = self.broker.clone();
        let agent_id = agent_id.clone();
        self.breaker
            .execute(|| async move {
                broker.register_callback(&agent_id, callback).await;
                Ok(())
            })
            .await
    }

    /// Returns the cached capabilities for `agent_id`, or a not-found
    /// resource error if it was never registered.
    pub async fn get_agent_capabilities(&self, agent_id: &AgentId) -> Result<Capabilities, CoreError> {
        self.capabilities
            .lock()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| {
                CoreError::resource_not_found(format!("agent '{agent_id}' is not registered"))
                    .with_code(codes::ORCHESTRATOR_AGENT_NOT_FOUND)
            })
    }

    /// Cancels the broker's background TTL sweeper, if running.
    pub async fn shutdown(&self) {
        self.broker.shutdown().await;
    }
}

/// Cross-domain router between two [`CommunicationManager`]s: a `base`
/// manager for ordinary agents and a `container` manager for containerized
/// workloads, each backed by its own broker/rate-limiter/breaker.
///
/// Every container id is registered with *both* managers so that a base
/// agent can address a container directly and a container can address a
/// base agent. A send from a container stays on the container broker only
/// when every possible recipient is also a container (a direct send to
/// another container, or a broadcast); any other send — including a direct
/// send to a base agent — falls through to the base broker, which already
/// knows every container id via the dual registration. Receiving is
/// symmetric: a container id pulls from the container broker, anything
/// else pulls from the base broker.
pub struct ContainerCommunicationManager<V: TokenValidator> {
    base: Arc<CommunicationManager<V>>,
    container: Arc<CommunicationManager<V>>,
    container_ids: Mutex<HashSet<AgentId>>,
}

impl<V: TokenValidator> ContainerCommunicationManager<V> {
    /// Wraps the given base and container managers; neither manager's
    /// `shutdown` is called until this wrapper's own `shutdown` is.
    pub fn new(base: Arc<CommunicationManager<V>>, container: Arc<CommunicationManager<V>>) -> Self {
        Self {
            base,
            container,
            container_ids: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a containerized agent with the container manager and
    /// mirrors the registration to the base manager so sends addressed to
    /// it from either domain resolve.
    pub async fn register_container_agent(&self, agent_id: AgentId, capabilities: Capabilities) {
        self.container
            .register_agent(agent_id.clone(), capabilities.clone())
            .await;
        self.base.register_agent(agent_id.clone(), capabilities).await;
        self.container_ids.lock().await.insert(agent_id);
    }

    /// Registers a non-containerized agent with the base manager only.
    pub async fn register_base_agent(&self, agent_id: AgentId, capabilities: Capabilities) {
        self.base.register_agent(agent_id, capabilities).await;
    }

    async fn is_container(&self, agent_id: &AgentId) -> bool {
        self.container_ids.lock().await.contains(agent_id)
    }

    /// Routes a send per the cross-domain rule: a container sender stays on
    /// the container broker only for a broadcast or a recipient that is
    /// also a container; every other send goes through the base manager.
    pub async fn send(&self, message: Message, auth_token: Option<&str>) -> Result<String, CoreError> {
        let ids = self.container_ids.lock().await;
        let sender_is_container = ids.contains(&message.sender_id);
        let recipient_is_container = match &message.recipient_id {
            Some(recipient) => ids.contains(recipient),
            None => false,
        };
        drop(ids);

        let via_container =
            sender_is_container && (message.message_type == MessageType::Broadcast || recipient_is_container);

        if via_container {
            self.container.send(message, auth_token).await
        } else {
            self.base.send(message, auth_token).await
        }
    }

    /// Pulls queued messages for `agent_id`: the container broker if it is
    /// a known container id, otherwise the base broker.
    pub async fn get_messages(
        &self,
        agent_id: &AgentId,
        mark_delivered: bool,
        auth_token: Option<&str>,
    ) -> Result<Vec<Message>, CoreError> {
        if self.is_container(agent_id).await {
            self.container.get_messages(agent_id, mark_delivered, auth_token).await
        } else {
            self.base.get_messages(agent_id, mark_delivered, auth_token).await
        }
    }

    /// Registers a push-delivery callback on whichever broker owns
    /// `agent_id`'s queue.
    pub async fn register_callback(
        &self,
        agent_id: &AgentId,
        callback: DeliveryCallback,
        auth_token: Option<&str>,
    ) -> Result<(), CoreError> {
        if self.is_container(agent_id).await {
            self.container.register_callback(agent_id, callback, auth_token).await
        } else {
            self.base.register_callback(agent_id, callback, auth_token).await
        }
    }

    /// Cancels both managers' background TTL sweepers.
    pub async fn shutdown(&self) {
        self.container.shutdown().await;
        self.base.shutdown().await;
    }
}
