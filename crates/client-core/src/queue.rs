//! Durable offline mutation queue
//!
//! This module provides the ordered queue of pending state-changing
//! actions:
//! - Capacity-checked enqueue; callers apply their optimistic update first
//! - Sequential replay against registered handlers, bounded retries
//! - Failed actions retained until explicitly retried or cleared
//! - Full-queue persistence after every state transition
//!
//! A processing pass never overlaps itself; the guard is a cooperative
//! in-memory flag, not a cross-thread lock protocol.

use crate::error::QueueError;
use crate::models::{generate_id, now_millis, ActionStatus, QueuedAction};
use crate::store::KeyValueStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the offline queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of actions held at once
    pub max_size: usize,
    /// Delivery attempts before an action is marked failed
    pub max_retries: u32,
    /// Delay before a scheduled retry pass
    pub retry_delay: Duration,
    /// Store key under which the queue is persisted
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_retries: 3,
            retry_delay: Duration::from_secs(30),
            storage_key: "offline_queue".to_string(),
        }
    }
}

/// Delivers one queued action to the backend
///
/// Handlers are the boundary to the proxying services (posting a queued
/// chat message, a task creation, a preference update); their internals
/// are outside this crate.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, action: &QueuedAction) -> Result<()>;
}

/// Durable, ordered queue of pending mutations
pub struct OfflineQueue {
    actions: Mutex<Vec<QueuedAction>>,
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
    store: Arc<dyn KeyValueStore>,
    config: QueueConfig,
    online: AtomicBool,
    processing: AtomicBool,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl OfflineQueue {
    /// Create a queue hydrated from the store; missing or corrupt state
    /// starts empty
    pub async fn load(store: Arc<dyn KeyValueStore>, config: QueueConfig) -> Arc<Self> {
        let actions = match store.get(&config.storage_key).await {
            Ok(Some(value)) => match serde_json::from_value::<Vec<QueuedAction>>(value) {
                Ok(actions) => {
                    info!(count = actions.len(), "hydrated offline queue");
                    actions
                }
                Err(e) => {
                    warn!(error = %e, "persisted queue is corrupt, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "failed to read persisted queue, starting empty");
                Vec::new()
            }
        };

        Arc::new(Self {
            actions: Mutex::new(actions),
            handlers: RwLock::new(HashMap::new()),
            store,
            config,
            online: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            retry_timer: Mutex::new(None),
        })
    }

    /// Associate an action type with its delivery handler; one handler
    /// per type, later registrations replace earlier ones
    pub async fn register_handler(&self, action_type: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.write().await.insert(action_type.into(), handler);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Append a new pending action
    ///
    /// Fails before any I/O when the queue is at capacity. When online
    /// and idle, a processing pass is triggered without being awaited.
    pub async fn enqueue(
        self: &Arc<Self>,
        action_type: impl Into<String>,
        payload: Value,
    ) -> Result<String, QueueError> {
        let action = {
            let mut actions = self.actions.lock().await;
            if actions.len() >= self.config.max_size {
                return Err(QueueError::Full {
                    capacity: self.config.max_size,
                });
            }
            let action = QueuedAction {
                id: generate_id("action"),
                action_type: action_type.into(),
                payload,
                created_at: now_millis(),
                retry_count: 0,
                max_retries: self.config.max_retries,
                status: ActionStatus::Pending,
                last_error: None,
            };
            actions.push(action.clone());
            action
        };
        self.persist().await;
        debug!(id = %action.id, action_type = %action.action_type, "enqueued action");

        if self.online.load(Ordering::SeqCst) && !self.processing.load(Ordering::SeqCst) {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.process_queue().await;
            });
        }
        Ok(action.id)
    }

    /// Replay all currently pending actions sequentially in insertion
    /// order
    ///
    /// No-op while offline or while another pass is in flight. Completed
    /// actions are purged at the end of the pass; if any remain pending,
    /// a delayed retry pass is scheduled.
    pub async fn process_queue(self: &Arc<Self>) {
        if !self.online.load(Ordering::SeqCst) {
            return;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            debug!("processing pass already in flight");
            return;
        }

        let pending: Vec<String> = {
            let actions = self.actions.lock().await;
            actions
                .iter()
                .filter(|a| a.status == ActionStatus::Pending)
                .map(|a| a.id.clone())
                .collect()
        };
        debug!(count = pending.len(), "starting queue processing pass");

        for id in pending {
            let Some(action) = self.snapshot(&id).await else {
                continue;
            };
            if action.status != ActionStatus::Pending {
                continue;
            }

            let handler = self.handlers.read().await.get(&action.action_type).cloned();
            let Some(handler) = handler else {
                let message = format!("no handler registered for type '{}'", action.action_type);
                warn!(id = %action.id, action_type = %action.action_type, "no handler for queued action");
                self.update(&id, |a| {
                    a.status = ActionStatus::Failed;
                    a.last_error = Some(message);
                })
                .await;
                continue;
            };

            self.update(&id, |a| a.status = ActionStatus::Processing).await;

            match handler.handle(&action).await {
                Ok(()) => {
                    debug!(id = %action.id, action_type = %action.action_type, "action delivered");
                    self.update(&id, |a| {
                        a.status = ActionStatus::Completed;
                        a.last_error = None;
                    })
                    .await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.update(&id, |a| {
                        a.retry_count += 1;
                        a.last_error = Some(message.clone());
                        if a.retry_count >= a.max_retries {
                            warn!(
                                id = %a.id,
                                action_type = %a.action_type,
                                retries = a.retry_count,
                                error = %message,
                                "action failed permanently"
                            );
                            a.status = ActionStatus::Failed;
                        } else {
                            debug!(
                                id = %a.id,
                                retry_count = a.retry_count,
                                error = %message,
                                "action delivery failed, will retry"
                            );
                            a.status = ActionStatus::Pending;
                        }
                    })
                    .await;
                }
            }
        }

        self.persist().await;
        let pending_remaining = {
            let mut actions = self.actions.lock().await;
            actions.retain(|a| a.status != ActionStatus::Completed);
            actions.iter().any(|a| a.status == ActionStatus::Pending)
        };
        self.persist().await;

        self.processing.store(false, Ordering::SeqCst);
        if pending_remaining {
            self.schedule_retry().await;
        }
    }

    /// Toggle connectivity; coming back online triggers a processing pass
    pub async fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!("back online, replaying queued actions");
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.process_queue().await;
            });
        }
    }

    /// Flip connectivity without triggering a pass, so tests control
    /// exactly when processing runs
    #[cfg(test)]
    pub(crate) fn set_online_flag(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Reset every failed action to pending with a fresh retry budget and
    /// trigger processing
    pub async fn retry_failed(self: &Arc<Self>) {
        {
            let mut actions = self.actions.lock().await;
            for action in actions.iter_mut().filter(|a| a.status == ActionStatus::Failed) {
                action.status = ActionStatus::Pending;
                action.retry_count = 0;
                action.last_error = None;
            }
        }
        self.persist().await;

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.process_queue().await;
        });
    }

    /// Drop every failed action without retrying
    pub async fn clear_failed(&self) {
        {
            let mut actions = self.actions.lock().await;
            actions.retain(|a| a.status != ActionStatus::Failed);
        }
        self.persist().await;
    }

    /// Snapshot of the current queue contents
    pub async fn get_queue(&self) -> Vec<QueuedAction> {
        self.actions.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.count_status(ActionStatus::Pending).await
    }

    pub async fn failed_count(&self) -> usize {
        self.count_status(ActionStatus::Failed).await
    }

    async fn count_status(&self, status: ActionStatus) -> usize {
        self.actions
            .lock()
            .await
            .iter()
            .filter(|a| a.status == status)
            .count()
    }

    /// Cancel the pending retry timer; a pass already in flight runs to
    /// completion
    pub async fn dispose(&self) {
        if let Some(handle) = self.retry_timer.lock().await.take() {
            handle.abort();
        }
    }

    async fn snapshot(&self, id: &str) -> Option<QueuedAction> {
        self.actions.lock().await.iter().find(|a| a.id == id).cloned()
    }

    /// Apply a mutation to one action and persist the whole queue
    async fn update(&self, id: &str, mutate: impl FnOnce(&mut QueuedAction)) {
        {
            let mut actions = self.actions.lock().await;
            if let Some(action) = actions.iter_mut().find(|a| a.id == id) {
                mutate(action);
            }
        }
        self.persist().await;
    }

    /// Serialize the full queue to the store; failures degrade durability
    /// only, in-memory state stays authoritative
    async fn persist(&self) {
        let value = {
            let actions = self.actions.lock().await;
            match serde_json::to_value(&*actions) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "queue failed to serialize");
                    return;
                }
            }
        };
        if let Err(e) = self.store.set(&self.config.storage_key, value).await {
            warn!(error = %e, "failed to persist queue");
        }
    }

    /// Schedule one delayed retry pass; a single shared timer, reset on
    /// every call, so bursts coalesce into one pass
    async fn schedule_retry(self: &Arc<Self>) {
        let queue = Arc::clone(self);
        let delay = self.config.retry_delay;
        let mut timer = self.retry_timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        debug!(delay_ms = delay.as_millis() as u64, "scheduling retry pass");
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.run_pass().await;
        }));
    }

    /// Type-erased processing pass for the retry timer; the timer awaits
    /// this boxed future instead of `process_queue` directly, which would
    /// make the scheduled task's future type contain itself
    fn run_pass(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        let queue = Arc::clone(self);
        Box::pin(async move { queue.process_queue().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    /// Handler that records invocation order and fails a scripted number
    /// of times
    struct RecordingHandler {
        calls: std::sync::Mutex<Vec<String>>,
        failures_remaining: AtomicU32,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Self::failing(0)
        }

        fn failing(times: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: std::sync::Mutex::new(Vec::new()),
                failures_remaining: AtomicU32::new(times),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ActionHandler for RecordingHandler {
        async fn handle(&self, action: &QueuedAction) -> Result<()> {
            self.calls.lock().unwrap().push(action.id.clone());
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("backend rejected action");
            }
            Ok(())
        }
    }

    /// Handler that parks long enough for overlap checks
    struct SlowHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionHandler for SlowHandler {
        async fn handle(&self, _action: &QueuedAction) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    async fn test_queue(config: QueueConfig) -> (Arc<OfflineQueue>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineQueue::load(store.clone() as Arc<dyn KeyValueStore>, config).await;
        (queue, store)
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            retry_delay: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_enqueue_rejects_when_full() {
        let (queue, _) = test_queue(QueueConfig {
            max_size: 2,
            ..fast_config()
        })
        .await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.enqueue("send_message", json!({})).await.unwrap();

        let err = queue.enqueue("send_message", json!({})).await.unwrap_err();
        assert!(matches!(err, QueueError::Full { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_offline_actions_replay_in_insertion_order() {
        let (queue, _) = test_queue(fast_config()).await;
        let handler = RecordingHandler::new();
        queue.register_handler("send_message", handler.clone()).await;
        queue.register_handler("create_task", handler.clone()).await;

        // Interleave types while offline; replay must not group by type
        let a = queue.enqueue("send_message", json!({"n": 1})).await.unwrap();
        let b = queue.enqueue("create_task", json!({"n": 2})).await.unwrap();
        let c = queue.enqueue("send_message", json!({"n": 3})).await.unwrap();

        queue.set_online(true).await;
        for _ in 0..100 {
            if queue.get_queue().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handler.calls(), vec![a, b, c]);
        assert_eq!(queue.pending_count().await, 0);
        assert!(queue.get_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_processing_is_noop_while_offline() {
        let (queue, _) = test_queue(fast_config()).await;
        let handler = RecordingHandler::new();
        queue.register_handler("send_message", handler.clone()).await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.process_queue().await;

        assert!(handler.calls().is_empty());
        assert_eq!(queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_immediately() {
        let (queue, _) = test_queue(fast_config()).await;

        queue.enqueue("unknown_type", json!({})).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);
        queue.process_queue().await;

        let actions = queue.get_queue().await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, ActionStatus::Failed);
        assert!(actions[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("no handler registered"));
    }

    #[tokio::test]
    async fn test_retry_exhaustion_marks_failed() {
        let (queue, _) = test_queue(QueueConfig {
            max_retries: 3,
            ..fast_config()
        })
        .await;
        let handler = RecordingHandler::failing(u32::MAX);
        queue.register_handler("send_message", handler.clone()).await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);

        // Each pass makes one attempt; three attempts exhaust the budget
        queue.process_queue().await;
        queue.process_queue().await;
        assert_eq!(queue.pending_count().await, 1);
        queue.process_queue().await;

        assert_eq!(handler.calls().len(), 3);
        assert_eq!(queue.failed_count().await, 1);

        let actions = queue.get_queue().await;
        assert_eq!(actions[0].retry_count, 3);
        assert_eq!(actions[0].status, ActionStatus::Failed);
        assert!(actions[0].last_error.as_deref().unwrap().contains("rejected"));

        // Failed actions stay until cleared
        queue.process_queue().await;
        assert_eq!(queue.get_queue().await.len(), 1);
        queue.clear_failed().await;
        assert!(queue.get_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_retry_failed_resets_budget() {
        let (queue, _) = test_queue(QueueConfig {
            max_retries: 1,
            ..fast_config()
        })
        .await;
        let handler = RecordingHandler::failing(1);
        queue.register_handler("send_message", handler.clone()).await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);
        queue.process_queue().await;
        assert_eq!(queue.failed_count().await, 1);

        // Backend recovered; the retried action now succeeds
        queue.retry_failed().await;
        queue.process_queue().await;
        for _ in 0..100 {
            if queue.get_queue().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(queue.failed_count().await, 0);
        assert!(queue.get_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_concurrent_passes() {
        let (queue, _) = test_queue(fast_config()).await;
        let handler = Arc::new(SlowHandler {
            calls: AtomicU32::new(0),
        });
        queue.register_handler("send_message", handler.clone()).await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.process_queue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // Second call while the first is in flight is a no-op
        queue.process_queue().await;
        first.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_hydrates_from_store() {
        let store = Arc::new(MemoryStore::new());
        {
            let queue =
                OfflineQueue::load(store.clone() as Arc<dyn KeyValueStore>, fast_config()).await;
            queue.enqueue("send_message", json!({"n": 1})).await.unwrap();
            queue.enqueue("create_task", json!({"n": 2})).await.unwrap();
        }

        let revived =
            OfflineQueue::load(store.clone() as Arc<dyn KeyValueStore>, fast_config()).await;
        let actions = revived.get_queue().await;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].action_type, "send_message");
        assert_eq!(actions[1].action_type, "create_task");
    }

    #[tokio::test]
    async fn test_corrupt_persisted_queue_starts_empty() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("offline_queue", json!({"not": "a queue"}))
            .await
            .unwrap();

        let queue = OfflineQueue::load(store as Arc<dyn KeyValueStore>, fast_config()).await;
        assert!(queue.get_queue().await.is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_retry_pass_runs() {
        let (queue, _) = test_queue(QueueConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(50),
            ..Default::default()
        })
        .await;
        let handler = RecordingHandler::failing(1);
        queue.register_handler("send_message", handler.clone()).await;

        queue.enqueue("send_message", json!({})).await.unwrap();
        queue.online.store(true, Ordering::SeqCst);
        queue.process_queue().await;
        assert_eq!(queue.pending_count().await, 1);

        // The shared retry timer fires and the second attempt succeeds
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.pending_count().await, 0);
        assert!(queue.get_queue().await.is_empty());

        queue.dispose().await;
    }
}
