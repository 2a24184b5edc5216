#![forbid(unsafe_code)]

//! **agentcore-distributor** – capability-matching task distribution.
//!
//! Tracks each agent's capability set, priority rank, current load, and
//! online status; finds candidates whose capabilities satisfy a task's
//! requirements; picks one via a pluggable strategy; and hands the task off
//! through the communication manager, rolling back load accounting if the
//! send fails. The distributor does not persist task state itself — only
//! load accounting.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use agentcore_auth::TokenValidator;
use agentcore_comm::CommunicationManager;
use agentcore_errors::{codes, CoreError};
use agentcore_types::{AgentId, Message, MessageContent, MessageType, Metadata, NewMessage, Priority};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// A pluggable candidate selector for [`SelectionStrategy::Custom`].
pub type CustomSelector = Arc<dyn Fn(&[AgentId]) -> Option<AgentId> + Send + Sync>;

/// How [`TaskDistributor::select`] picks one candidate from many.
#[derive(Clone)]
pub enum SelectionStrategy {
    /// The first candidate, in `find_suitable`'s deterministic order.
    CapabilityMatch,
    /// A uniformly random candidate.
    RoundRobin,
    /// The candidate with the lowest `current_load`, ties broken by order.
    LoadBalanced,
    /// The candidate with the highest `priority_rank`, ties broken by order.
    PriorityBased,
    /// A caller-supplied selection function.
    Custom(CustomSelector),
}

impl fmt::Debug for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionStrategy::CapabilityMatch => "CapabilityMatch",
            SelectionStrategy::RoundRobin => "RoundRobin",
            SelectionStrategy::LoadBalanced => "LoadBalanced",
            SelectionStrategy::PriorityBased => "PriorityBased",
            SelectionStrategy::Custom(_) => "Custom",
        };
        f.write_str(name)
    }
}

struct AgentState {
    capabilities: HashSet<String>,
    priority_rank: i64,
    current_load: u64,
    online: bool,
}

/// Parameters for [`TaskDistributor::distribute`].
pub struct DistributeParams {
    pub task_id: String,
    pub task_type: String,
    pub required_capabilities: HashSet<String>,
    pub data: serde_json::Value,
    pub sender_id: AgentId,
    pub strategy: SelectionStrategy,
    pub excluded_agents: HashSet<AgentId>,
    pub priority: Priority,
    pub ttl_seconds: Option<i64>,
    pub metadata: Metadata,
    pub auth_token: Option<String>,
}

/// Result of a successful [`TaskDistributor::distribute`] call.
#[derive(Debug, Clone)]
pub struct DistributionResult {
    pub task_id: String,
    pub agent_id: AgentId,
    pub message_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Tracks agent capability/load/priority state and hands tasks off to
/// whichever agent a [`SelectionStrategy`] picks.
pub struct TaskDistributor<V: TokenValidator> {
    state: Mutex<HashMap<AgentId, AgentState>>,
    comm: Arc<CommunicationManager<V>>,
}

impl<V: TokenValidator> TaskDistributor<V> {
    pub fn new(comm: Arc<CommunicationManager<V>>) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            comm,
        }
    }

    /// Registers an agent with the distributor. Idempotent — re-registering
    /// replaces the prior capability set and priority, and resets load to 0.
    pub async fn register_agent(
        &self,
        agent_id: AgentId,
        capabilities: HashSet<String>,
        priority_rank: i64,
    ) {
        let mut state = self.state.lock().await;
        state.insert(
            agent_id,
            AgentState {
                capabilities,
                priority_rank,
                current_load: 0,
                online: true,
            },
        );
    }

    pub async fn unregister_agent(&self, agent_id: &AgentId) {
        self.state.lock().await.remove(agent_id);
    }

    /// Updates online status and, optionally, overwrites current load.
    pub async fn update_agent_status(
        &self,
        agent_id: &AgentId,
        online: bool,
        current_load: Option<u64>,
    ) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(agent_id) {
            entry.online = online;
            if let Some(load) = current_load {
                entry.current_load = load;
            }
        }
    }

    /// Returns every online, non-excluded agent whose capability set is a
    /// superset of `required`, sorted by agent id for determinism.
    pub async fn find_suitable(
        &self,
        required: &HashSet<String>,
        excluded: &HashSet<AgentId>,
    ) -> Vec<AgentId> {
        let state = self.state.lock().await;
        let mut suitable: Vec<AgentId> = state
            .iter()
            .filter(|(agent_id, entry)| {
                entry.online
                    && !excluded.contains(*agent_id)
                    && required.is_subset(&entry.capabilities)
            })
            .map(|(agent_id, _)| agent_id.clone())
            .collect();
        suitable.sort();
        suitable
    }

    /// Picks one candidate per `strategy`. Empty `candidates` is a
    /// distribution failure, not an empty-but-valid result.
    pub async fn select(
        &self,
        candidates: &[AgentId],
        strategy: &SelectionStrategy,
    ) -> Result<AgentId, CoreError> {
        if candidates.is_empty() {
            return Err(CoreError::resource_not_found("no suitable agent found for task")
                .with_code(codes::ORCHESTRATOR_TASK_DISTRIBUTION_FAILED)
                .with_detail("strategy", format!("{strategy:?}")));
        }

        match strategy {
            SelectionStrategy::CapabilityMatch => Ok(candidates[0].clone()),
            SelectionStrategy::RoundRobin => {
                use rand::seq::SliceRandom;
                let mut rng = rand::thread_rng();
                Ok(candidates.choose(&mut rng).expect("checked non-empty above").clone())
            }
            SelectionStrategy::LoadBalanced => {
                let state = self.state.lock().await;
                let mut best: Option<(&AgentId, u64)> = None;
                for agent_id in candidates {
                    let load = state.get(agent_id).map(|e| e.current_load).unwrap_or(0);
                    if best.map(|(_, best_load)| load < best_load).unwrap_or(true) {
                        best = Some((agent_id, load));
                    }
                }
                Ok(best.expect("checked non-empty above").0.clone())
            }
            SelectionStrategy::PriorityBased => {
                let state = self.state.lock().await;
                let mut best: Option<(&AgentId, i64)> = None;
                for agent_id in candidates {
                    let rank = state.get(agent_id).map(|e| e.priority_rank).unwrap_or(0);
                    if best.map(|(_, best_rank)| rank > best_rank).unwrap_or(true) {
                        best = Some((agent_id, rank));
                    }
                }
                Ok(best.expect("checked non-empty above").0.clone())
            }
            SelectionStrategy::Custom(selector) => selector(candidates).ok_or_else(|| {
                CoreError::resource_not_found("custom selector returned no agent")
                    .with_code(codes::ORCHESTRATOR_TASK_DISTRIBUTION_FAILED)
            }),
        }
    }

    /// Finds a suitable agent, selects one, bumps its load, and sends a
    /// `TASK_REQUEST`. Rolls the load increment back if the send fails.
    pub async fn distribute(&self, params: DistributeParams) -> Result<DistributionResult, CoreError> {
        let candidates = self
            .find_suitable(&params.required_capabilities, &params.excluded_agents)
            .await;
        let agent_id = self.select(&candidates, &params.strategy).await?;

        {
            let mut state = self.state.lock().await;
            if let Some(entry) = state.get_mut(&agent_id) {
                entry.current_load += 1;
            }
        }

        let message = match Message::new(NewMessage {
            message_type: MessageType::TaskRequest,
            sender_id: params.sender_id.clone(),
            recipient_id: Some(agent_id.clone()),
            content: MessageContent::Json(serde_json::json!({
                "task_type": params.task_type,
                "data": params.data,
            })),
            priority: params.priority,
            metadata: params.metadata,
            ttl_seconds: params.ttl_seconds,
            correlation_id: Some(params.task_id.clone()),
        }) {
            Ok(message) => message,
            Err(err) => {
                self.rollback_load(&agent_id).await;
                return Err(CoreError::validation(err.to_string())
                    .with_code(codes::ORCHESTRATOR_TASK_DISTRIBUTION_FAILED));
            }
        };

        match self.comm.send(message, params.auth_token.as_deref()).await {
            Ok(message_id) => {
                tracing::info!(task_id = %params.task_id, agent = %agent_id, "task distributed");
                Ok(DistributionResult {
                    task_id: params.task_id,
                    agent_id,
                    message_id,
                    status: "distributed".to_string(),
                    timestamp: Utc::now(),
                })
            }
            Err(err) => {
                self.rollback_load(&agent_id).await;
                Err(err)
            }
        }
    }

    async fn rollback_load(&self, agent_id: &AgentId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(agent_id) {
            entry.current_load = entry.current_load.saturating_sub(1);
        }
    }

    /// Decrements `agent_id`'s load by one (saturating at 0). The
    /// distributor does not persist task status — that is owned by
    /// whatever external task store the caller maintains.
    pub async fn handle_response(
        &self,
        task_id: &str,
        agent_id: &AgentId,
        status: &str,
    ) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(agent_id) {
            entry.current_load = entry.current_load.saturating_sub(1);
        }
        tracing::info!(task_id, agent = %agent_id, status, "task response handled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_auth::Claims;
    use agentcore_breaker::CircuitBreakerRegistry;
    use agentcore_bus::MessageBroker;
    use agentcore_ratelimit::RateLimiter;
    use async_trait::async_trait;

    struct AllowAllValidator;

    #[async_trait]
    impl TokenValidator for AllowAllValidator {
        async fn validate(&self, raw: &str, _required_scopes: &[&str]) -> agentcore_auth::Result<Claims> {
            Ok(Claims {
                sub: raw.to_string(),
                scopes: vec![],
                iat: 0,
                exp: u64::MAX,
                jti: "test".to_string(),
            })
        }
    }

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    fn caps(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    async fn distributor() -> TaskDistributor<AllowAllValidator> {
        let comm = CommunicationManager::new(
            Arc::new(MessageBroker::new()),
            Arc::new(RateLimiter::new(Default::default())),
            &CircuitBreakerRegistry::new(),
            Arc::new(AllowAllValidator),
        )
        .await;
        TaskDistributor::new(Arc::new(comm))
    }

    fn params(task_id: &str, required: &[&str], strategy: SelectionStrategy) -> DistributeParams {
        DistributeParams {
            task_id: task_id.to_string(),
            task_type: "compile".to_string(),
            required_capabilities: caps(required),
            data: serde_json::json!({}),
            sender_id: agent("coordinator"),
            strategy,
            excluded_agents: HashSet::new(),
            priority: Priority::Medium,
            ttl_seconds: None,
            metadata: Default::default(),
            auth_token: None,
        }
    }

    #[tokio::test]
    async fn find_suitable_filters_by_capability_online_and_exclusion() {
        let d = distributor().await;
        d.register_agent(agent("a"), caps(&["rust", "gpu"]), 1).await;
        d.register_agent(agent("b"), caps(&["rust"]), 1).await;
        d.register_agent(agent("c"), caps(&["rust", "gpu"]), 1).await;
        d.update_agent_status(&agent("c"), false, None).await;

        let found = d.find_suitable(&caps(&["rust", "gpu"]), &HashSet::new()).await;
        assert_eq!(found, vec![agent("a")]);

        let excluded: HashSet<AgentId> = [agent("a")].into_iter().collect();
        let found = d.find_suitable(&caps(&["rust"]), &excluded).await;
        assert_eq!(found, vec![agent("b")]);
    }

    #[tokio::test]
    async fn select_empty_candidates_is_distribution_failure() {
        let d = distributor().await;
        let err = d.select(&[], &SelectionStrategy::CapabilityMatch).await.unwrap_err();
        assert_eq!(err.code, codes::ORCHESTRATOR_TASK_DISTRIBUTION_FAILED);
    }

    #[tokio::test]
    async fn load_balanced_picks_minimum_load_with_first_found_tie_break() {
        let d = distributor().await;
        d.register_agent(agent("a"), caps(&["rust"]), 1).await;
        d.register_agent(agent("b"), caps(&["rust"]), 1).await;
        d.update_agent_status(&agent("a"), true, Some(5)).await;
        d.update_agent_status(&agent("b"), true, Some(2)).await;

        let candidates = vec![agent("a"), agent("b")];
        let selected = d.select(&candidates, &SelectionStrategy::LoadBalanced).await.unwrap();
        assert_eq!(selected, agent("b"));
    }

    #[tokio::test]
    async fn priority_based_picks_maximum_rank() {
        let d = distributor().await;
        d.register_agent(agent("a"), caps(&["rust"]), 1).await;
        d.register_agent(agent("b"), caps(&["rust"]), 9).await;

        let candidates = vec![agent("a"), agent("b")];
        let selected = d.select(&candidates, &SelectionStrategy::PriorityBased).await.unwrap();
        assert_eq!(selected, agent("b"));
    }

    #[tokio::test]
    async fn distribute_increments_load_and_sends_task_request() {
        let d = distributor().await;
        d.comm.register_agent(agent("coordinator"), Default::default()).await;
        d.comm.register_agent(agent("worker"), Default::default()).await;
        d.register_agent(agent("worker"), caps(&["rust"]), 1).await;

        let result = d
            .distribute(params("task-1", &["rust"], SelectionStrategy::CapabilityMatch))
            .await
            .unwrap();
        assert_eq!(result.agent_id, agent("worker"));
        assert_eq!(result.status, "distributed");

        let state = d.state.lock().await;
        assert_eq!(state[&agent("worker")].current_load, 1);
    }

    #[tokio::test]
    async fn distribute_rolls_back_load_when_send_fails() {
        let d = distributor().await;
        // "worker" is registered with the distributor but never with the
        // communication manager, so the send will fail with a not-found error.
        d.comm.register_agent(agent("coordinator"), Default::default()).await;
        d.register_agent(agent("worker"), caps(&["rust"]), 1).await;

        let err = d
            .distribute(params("task-2", &["rust"], SelectionStrategy::CapabilityMatch))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ORCHESTRATOR_AGENT_NOT_FOUND);

        let state = d.state.lock().await;
        assert_eq!(state[&agent("worker")].current_load, 0);
    }

    #[tokio::test]
    async fn handle_response_decrements_load_saturating_at_zero() {
        let d = distributor().await;
        d.register_agent(agent("worker"), caps(&["rust"]), 1).await;
        d.handle_response("task-1", &agent("worker"), "completed").await;

        let state = d.state.lock().await;
        assert_eq!(state[&agent("worker")].current_load, 0);
    }
}
