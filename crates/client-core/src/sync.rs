//! Synchronization coordinator
//!
//! This module provides:
//! - Online/offline tracking fed by a pluggable connectivity probe
//! - Full sync passes that replay the offline queue and surface errors
//! - Per-entity reconciliation with configurable conflict strategies
//! - Lifecycle events for UI layers (started, completed, conflict, ...)
//!
//! A conflict exists only when both sides changed since the last confirmed
//! sync point. A plain remote update with no unconfirmed local write is
//! not a conflict and is applied directly.

use crate::events::{EventBus, SubscriptionId};
use crate::models::{now_millis, ActionStatus, SyncStatus, SyncableEntity};
use crate::queue::OfflineQueue;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often the connectivity probe runs
    pub probe_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
        }
    }
}

/// Answers "can we reach the backend right now?"
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// How a detected conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// The side with the newer `updated_at` wins; local wins ties
    LastWriterWins,
    /// Local version wins and is pushed
    KeepLocal,
    /// Remote version wins and is re-confirmed
    KeepRemote,
    /// A caller-supplied merge function combines both sides
    Merge,
    /// Leave the local version untouched for the user to resolve
    Manual,
}

/// Lifecycle notifications emitted by the engine
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Started,
    Completed { finished_at: i64 },
    Failed { error: String },
    Online,
    Offline,
    Conflict { entity_type: String, entity_id: String },
}

/// Coordinates offline queue replay and entity reconciliation
pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    strategies: RwLock<HashMap<String, ConflictStrategy>>,
    events: EventBus<SyncEvent>,
    online: AtomicBool,
    syncing: AtomicBool,
    last_sync_at: Mutex<Option<i64>>,
    sync_errors: Mutex<Vec<String>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(queue: Arc<OfflineQueue>, config: SyncConfig) -> Arc<Self> {
        Arc::new(Self {
            queue,
            strategies: RwLock::new(HashMap::new()),
            events: EventBus::new(),
            online: AtomicBool::new(false),
            syncing: AtomicBool::new(false),
            last_sync_at: Mutex::new(None),
            sync_errors: Mutex::new(Vec::new()),
            probe_task: Mutex::new(None),
            config,
        })
    }

    /// Set the conflict strategy for one entity type; unset types use
    /// [`ConflictStrategy::LastWriterWins`]
    pub async fn set_strategy(&self, entity_type: impl Into<String>, strategy: ConflictStrategy) {
        self.strategies.write().await.insert(entity_type.into(), strategy);
    }

    pub fn on_event<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    pub fn off_event(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Run a full sync pass: replay the offline queue and collect any
    /// delivery errors
    ///
    /// No-op while offline or while another pass is running.
    pub async fn sync(self: &Arc<Self>) {
        if !self.online.load(Ordering::SeqCst) {
            debug!("sync skipped, offline");
            return;
        }
        if self.syncing.swap(true, Ordering::SeqCst) {
            debug!("sync already in progress");
            return;
        }

        self.sync_errors.lock().await.clear();
        self.events.emit(&SyncEvent::Started);
        info!("sync pass started");

        let failed_before: HashSet<String> = self
            .queue
            .get_queue()
            .await
            .into_iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .map(|a| a.id)
            .collect();

        self.queue.process_queue().await;

        // Only failures produced by this pass count against it; older
        // failed actions stay visible through the queue snapshot and
        // failed_count until retried or cleared
        let failures: Vec<String> = self
            .queue
            .get_queue()
            .await
            .into_iter()
            .filter(|a| a.status == ActionStatus::Failed && !failed_before.contains(&a.id))
            .filter_map(|a| a.last_error)
            .collect();
        let had_failures = !failures.is_empty();
        if had_failures {
            warn!(count = failures.len(), "sync pass left failed actions behind");
            self.sync_errors.lock().await.extend(failures);
        }

        let finished_at = now_millis();
        *self.last_sync_at.lock().await = Some(finished_at);
        self.syncing.store(false, Ordering::SeqCst);
        if had_failures {
            let error = self.sync_errors.lock().await.join("; ");
            self.events.emit(&SyncEvent::Failed { error });
        } else {
            self.events.emit(&SyncEvent::Completed { finished_at });
            info!("sync pass completed");
        }
    }

    /// Update connectivity; a transition to online triggers a sync pass
    pub async fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        self.queue.set_online(online).await;

        if online == was_online {
            return;
        }
        if online {
            info!("connectivity restored");
            self.events.emit(&SyncEvent::Online);
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.sync().await;
            });
        } else {
            info!("connectivity lost");
            self.events.emit(&SyncEvent::Offline);
        }
    }

    /// Flip connectivity without forwarding to the queue or spawning a
    /// pass, so tests control exactly when syncing runs
    #[cfg(test)]
    pub(crate) fn set_online_flag(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Start the periodic connectivity probe; the loop holds only a weak
    /// reference and exits when the engine is dropped
    pub async fn start_probe(self: &Arc<Self>, probe: Arc<dyn ConnectivityProbe>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.probe_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                let online = probe.check().await;
                engine.set_online(online).await;
            }
        });

        let mut task = self.probe_task.lock().await;
        if let Some(previous) = task.take() {
            previous.abort();
        }
        *task = Some(handle);
    }

    /// Stop the probe loop and the queue's retry timer
    pub async fn dispose(&self) {
        if let Some(handle) = self.probe_task.lock().await.take() {
            handle.abort();
        }
        self.queue.dispose().await;
    }

    /// Current synchronization snapshot; counts are recomputed from the
    /// queue on every call
    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            is_online: self.online.load(Ordering::SeqCst),
            is_syncing: self.syncing.load(Ordering::SeqCst),
            last_sync_at: *self.last_sync_at.lock().await,
            pending_count: self.queue.pending_count().await,
            failed_count: self.queue.failed_count().await,
            sync_errors: self.sync_errors.lock().await.clone(),
        }
    }

    /// Reconcile one entity against its remote counterpart
    ///
    /// Offline, the entity is tagged local-only and returned unchanged.
    /// Fetch and push failures degrade to the local version so the caller
    /// always gets a usable entity back.
    pub async fn sync_entity<T, FR, FrFut, SR, SrFut, M>(
        &self,
        entity_type: &str,
        mut local: T,
        fetch_remote: FR,
        save_remote: SR,
        merge: M,
    ) -> T
    where
        T: SyncableEntity + Clone,
        FR: FnOnce() -> FrFut,
        FrFut: Future<Output = Result<Option<T>>>,
        SR: FnOnce(T) -> SrFut,
        SrFut: Future<Output = Result<T>>,
        M: FnOnce(&T, &T) -> T,
    {
        if !self.online.load(Ordering::SeqCst) {
            local.mark_local();
            return local;
        }

        let remote = match fetch_remote().await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(entity_type, entity_id = local.id(), error = %e, "remote fetch failed");
                self.record_error(format!("fetch {} {}: {}", entity_type, local.id(), e))
                    .await;
                local.mark_local();
                return local;
            }
        };

        let Some(remote) = remote else {
            // Nothing remote yet; first push creates it
            return self.push(entity_type, local.clone(), save_remote).await.unwrap_or_else(|_| {
                local.mark_local();
                local
            });
        };

        let synced_at = local.synced_at().unwrap_or(0);
        let local_dirty = local.updated_at() > synced_at;
        let remote_dirty = remote.updated_at() > synced_at;

        let (candidate, needs_push) = if local_dirty && remote_dirty {
            self.events.emit(&SyncEvent::Conflict {
                entity_type: entity_type.to_string(),
                entity_id: local.id().to_string(),
            });
            let strategy = self
                .strategies
                .read()
                .await
                .get(entity_type)
                .copied()
                .unwrap_or(ConflictStrategy::LastWriterWins);
            debug!(entity_type, entity_id = local.id(), ?strategy, "conflict detected");

            match strategy {
                ConflictStrategy::Manual => {
                    local.mark_local();
                    return local;
                }
                ConflictStrategy::KeepLocal => (local.clone(), true),
                ConflictStrategy::KeepRemote => (remote, true),
                ConflictStrategy::Merge => (merge(&local, &remote), true),
                ConflictStrategy::LastWriterWins => {
                    if local.updated_at() >= remote.updated_at() {
                        (local.clone(), true)
                    } else {
                        (remote, true)
                    }
                }
            }
        } else if local_dirty {
            (local.clone(), true)
        } else {
            // Remote-only change (or no change at all); adopt remote
            (remote, false)
        };

        if !needs_push {
            let mut adopted = candidate;
            adopted.mark_synced(now_millis());
            return adopted;
        }

        match self.push(entity_type, candidate, save_remote).await {
            Ok(saved) => saved,
            Err(_) => {
                local.mark_local();
                local
            }
        }
    }

    /// Push one entity to the backend and confirm the sync point
    async fn push<T, SR, SrFut>(&self, entity_type: &str, mut entity: T, save_remote: SR) -> Result<T>
    where
        T: SyncableEntity,
        SR: FnOnce(T) -> SrFut,
        SrFut: Future<Output = Result<T>>,
    {
        entity.mark_synced(now_millis());
        match save_remote(entity).await {
            Ok(mut saved) => {
                saved.mark_synced(now_millis());
                Ok(saved)
            }
            Err(e) => {
                warn!(entity_type, error = %e, "remote save failed");
                self.record_error(format!("save {}: {}", entity_type, e)).await;
                Err(e)
            }
        }
    }

    async fn record_error(&self, message: String) {
        self.sync_errors.lock().await.push(message);
    }
}
