#![forbid(unsafe_code)]

//! **agentcore-bus** – Per-recipient priority message broker.
//!
//! Maintains one priority-ordered queue per recipient, routes sends
//! (including broadcast fan-out), supports both pull (`get_messages`) and
//! push (registered delivery callbacks) consumption, and expires TTL'd
//! messages via a background sweeper. Every mutation happens under a single
//! lock over the whole broker state — the contract calls for serialized
//! sends and atomic per-recipient queue mutation, not high write
//! concurrency, so one coarse lock is the right tradeoff.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use agentcore_errors::{codes, CoreError};
use agentcore_types::{AgentId, Message, MessageType};
use chrono::Utc;
use tokio::sync::{oneshot, Mutex};

/// A push-delivery callback. Returning `Err` is logged and does not stop
/// delivery to the remaining callbacks or messages.
pub type DeliveryCallback = Arc<dyn Fn(Message) -> Result<(), CoreError> + Send + Sync>;

struct AgentEntry {
    online: bool,
    queue: VecDeque<Message>,
    callbacks: Vec<DeliveryCallback>,
}

impl AgentEntry {
    fn new() -> Self {
        Self {
            online: true,
            queue: VecDeque::new(),
            callbacks: Vec::new(),
        }
    }

    /// Re-sorts the queue by priority, stable within a priority class.
    fn resort(&mut self) {
        self.queue
            .make_contiguous()
            .sort_by_key(|m| m.priority.sort_key());
    }
}

struct PushBatch {
    callbacks: Vec<DeliveryCallback>,
    messages: Vec<Message>,
}

/// The message broker.
pub struct MessageBroker {
    state: Mutex<HashMap<AgentId, AgentEntry>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker {
    /// Builds an empty broker with no registered agents.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Registers an agent with an empty queue if it isn't already known.
    /// Idempotent.
    pub async fn register(&self, agent_id: AgentId) {
        let mut state = self.state.lock().await;
        state.entry(agent_id).or_insert_with(AgentEntry::new);
    }

    /// Marks a known agent online/offline. No-op if the agent is unknown.
    pub async fn set_online(&self, agent_id: &AgentId, online: bool) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.get_mut(agent_id) {
            entry.online = online;
        }
    }

    /// Registers a push-delivery callback for an agent, auto-registering
    /// the agent if unknown.
    pub async fn register_callback(&self, agent_id: &AgentId, callback: DeliveryCallback) {
        let mut state = self.state.lock().await;
        state
            .entry(agent_id.clone())
            .or_insert_with(AgentEntry::new)
            .callbacks
            .push(callback);
    }

    /// Sends `message`, fanning it out to every known recipient on
    /// broadcast, or enqueuing it for the single named recipient otherwise.
    /// Returns the original message id. Affected recipients that are online
    /// and have at least one registered callback receive a push delivery
    /// after this call returns, via a spawned task per recipient — the
    /// sender does not wait on it.
    pub async fn send(&self, message: Message) -> Result<String, CoreError> {
        let original_id = message.id.clone();
        let mut push_batches = Vec::new();

        {
            let mut state = self.state.lock().await;
            state
                .entry(message.sender_id.clone())
                .or_insert_with(AgentEntry::new);

            let mut affected: Vec<AgentId> = Vec::new();
            if message.message_type == MessageType::Broadcast {
                let recipients: Vec<AgentId> = state
                    .keys()
                    .filter(|id| **id != message.sender_id)
                    .cloned()
                    .collect();
                for recipient in recipients {
                    let copy = message.fanout_copy(recipient.clone());
                    if let Some(entry) = state.get_mut(&recipient) {
                        entry.queue.push_back(copy);
                        entry.resort();
                        affected.push(recipient);
                    }
                }
            } else {
                let recipient = message.recipient_id.clone().ok_or_else(|| {
                    CoreError::validation("direct messages require a recipient_id")
                })?;
                if !state.contains_key(&recipient) {
                    return Err(CoreError::resource_not_found(format!(
                        "agent '{recipient}' is not known to the broker"
                    ))
                    .with_code(codes::ORCHESTRATOR_AGENT_NOT_FOUND));
                }
                let entry = state.get_mut(&recipient).expect("checked above");
                entry.queue.push_back(message.clone());
                entry.resort();
                affected.push(recipient);
            }

            let now = Utc::now();
            for recipient in affected {
                let entry = state.get_mut(&recipient).expect("just inserted into");
                if !entry.online || entry.callbacks.is_empty() {
                    continue;
                }
                entry.queue.retain(|m| !m.is_expired_at(now));
                let mut drained: Vec<Message> = entry.queue.drain(..).collect();
                for m in drained.iter_mut() {
                    m.mark_delivered_at(now);
                }
                if !drained.is_empty() {
                    push_batches.push((
                        recipient,
                        PushBatch {
                            callbacks: entry.callbacks.clone(),
                            messages: drained,
                        },
                    ));
                }
            }
        }

        for (recipient, batch) in push_batches {
            tokio::spawn(async move {
                for message in batch.messages {
                    for callback in &batch.callbacks {
                        if let Err(err) = callback(message.clone()) {
                            tracing::warn!(
                                agent = %recipient,
                                error = %err,
                                "push-delivery callback failed"
                            );
                        }
                    }
                }
            });
        }

        Ok(original_id)
    }

    /// Returns every non-expired message currently queued for `recipient`.
    /// When `mark_delivered` is true, the returned messages are marked
    /// delivered and the queue is cleared; otherwise this is a
    /// non-destructive peek. Unknown recipients return an empty list, not
    /// an error.
    pub async fn get_messages(&self, recipient: &AgentId, mark_delivered: bool) -> Vec<Message> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(entry) = state.get_mut(recipient) else {
            return Vec::new();
        };
        entry.queue.retain(|m| !m.is_expired_at(now));

        if mark_delivered {
            let mut out: Vec<Message> = entry.queue.drain(..).collect();
            for m in out.iter_mut() {
                m.mark_delivered_at(now);
            }
            out
        } else {
            entry.queue.iter().cloned().collect()
        }
    }

    async fn sweep_expired(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for entry in state.values_mut() {
            entry.queue.retain(|m| !m.is_expired_at(now));
        }
    }

    /// Spawns the background TTL sweeper at the given cadence. The sweeper
    /// is an amortization (both `get_messages` and push delivery already
    /// filter expired messages on the fly), not a correctness requirement.
    pub fn spawn_ttl_sweeper(self: &Arc<Self>, interval: StdDuration) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        let (tx, mut rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Some(old) = broker.shutdown_tx.lock().await.replace(tx) {
                let _ = old.send(());
            }
        });
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => broker.sweep_expired().await,
                    _ = &mut rx => break,
                }
            }
        })
    }

    /// Cancels the TTL sweeper, if one is running. Further calls to the
    /// broker remain valid; this only stops the background amortization.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentcore_types::{MessageContent, NewMessage, Priority};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn agent(id: &str) -> AgentId {
        AgentId::new(id).unwrap()
    }

    fn direct(sender: &str, recipient: &str, priority: Priority) -> Message {
        Message::new(NewMessage {
            message_type: MessageType::Direct,
            sender_id: agent(sender),
            recipient_id: Some(agent(recipient)),
            content: MessageContent::Json(serde_json::json!({"x": 1})),
            priority,
            metadata: Default::default(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn direct_send_then_pull_round_trips_a_message() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;

        let id = broker.send(direct("a", "b", Priority::Medium)).await.unwrap();
        let msgs = broker.get_messages(&agent("b"), true).await;
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].id, id);
        assert!(msgs[0].delivered);

        assert!(broker.get_messages(&agent("b"), true).await.is_empty());
    }

    #[tokio::test]
    async fn send_to_unknown_recipient_is_resource_not_found() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        let err = broker
            .send(direct("a", "ghost", Priority::Medium))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::ORCHESTRATOR_AGENT_NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_drains_in_strict_priority_order_within_a_recipient() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;

        broker.send(direct("a", "b", Priority::Low)).await.unwrap();
        broker.send(direct("a", "b", Priority::High)).await.unwrap();
        broker.send(direct("a", "b", Priority::Medium)).await.unwrap();
        broker.send(direct("a", "b", Priority::High)).await.unwrap();

        let msgs = broker.get_messages(&agent("b"), true).await;
        let priorities: Vec<Priority> = msgs.iter().map(|m| m.priority).collect();
        assert_eq!(
            priorities,
            vec![Priority::High, Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[tokio::test]
    async fn broadcast_fans_out_to_every_known_recipient_except_the_sender() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;
        broker.register(agent("c")).await;

        let broadcast = Message::new(NewMessage {
            message_type: MessageType::Broadcast,
            sender_id: agent("a"),
            recipient_id: None,
            content: MessageContent::Json(serde_json::json!({"hello": true})),
            priority: Priority::Medium,
            metadata: Default::default(),
            ttl_seconds: None,
            correlation_id: None,
        })
        .unwrap();
        let original_id = broker.send(broadcast).await.unwrap();

        let b_msgs = broker.get_messages(&agent("b"), true).await;
        let c_msgs = broker.get_messages(&agent("c"), true).await;
        assert_eq!(b_msgs.len(), 1);
        assert_eq!(c_msgs.len(), 1);
        assert_eq!(b_msgs[0].id, format!("{original_id}:b"));
        assert_eq!(c_msgs[0].id, format!("{original_id}:c"));

        assert!(broker.get_messages(&agent("a"), true).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_recipient_queue_returns_empty_not_an_error() {
        let broker = MessageBroker::new();
        let msgs = broker.get_messages(&agent("ghost"), true).await;
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn expired_messages_are_filtered_on_pull() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;

        let mut expiring = direct("a", "b", Priority::Medium);
        expiring.ttl_seconds = Some(0);
        expiring.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        broker.send(expiring).await.unwrap();
        broker.send(direct("a", "b", Priority::Medium)).await.unwrap();

        let msgs = broker.get_messages(&agent("b"), true).await;
        assert_eq!(msgs.len(), 1);
    }

    #[tokio::test]
    async fn push_delivery_invokes_registered_callback_for_online_recipients() {
        let broker = MessageBroker::new();
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;

        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        broker
            .register_callback(
                &agent("b"),
                Arc::new(move |_msg| {
                    received_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await;

        broker.send(direct("a", "b", Priority::Medium)).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(StdDuration::from_millis(10)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert!(broker.get_messages(&agent("b"), true).await.is_empty());
    }

    #[tokio::test]
    async fn ttl_sweeper_removes_expired_messages_in_the_background() {
        let broker = Arc::new(MessageBroker::new());
        broker.register(agent("a")).await;
        broker.register(agent("b")).await;

        let mut expiring = direct("a", "b", Priority::Medium);
        expiring.expires_at = Some(Utc::now() + chrono::Duration::milliseconds(20));
        broker.send(expiring).await.unwrap();

        let handle = broker.spawn_ttl_sweeper(StdDuration::from_millis(10));
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        broker.shutdown().await;
        let _ = handle.await;

        assert!(broker.get_messages(&agent("b"), false).await.is_empty());
    }
}
