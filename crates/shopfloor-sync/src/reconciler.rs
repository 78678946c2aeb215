//! # Sync Reconciler
//!
//! Replays the offline action queue against the backend.
//!
//! ## Pass
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          One Sync Pass                                  │
//! │                                                                         │
//! │  loop {                                                                 │
//! │     next = highest-priority pending action whose dependencies are      │
//! │            completed, with no open conflict, not yet tried this pass    │
//! │     pending ──► syncing ──► EntityService                              │
//! │                                 │                                       │
//! │        ok ──────────────────────┼──► completed (+ snapshot)            │
//! │        conflict ────────────────┼──► strategy (see below)              │
//! │        not_found ───────────────┼──► completed (delete) / failed       │
//! │        rejected, retryable ─────┼──► pending, retry_count + 1          │
//! │                                 │    or failed once the budget is spent │
//! │        rejected, permanent ─────┼──► failed                             │
//! │        unavailable ─────────────┴──► pending, budget untouched, pass   │
//! │                                      ends                               │
//! │     failed ──► every dependent fails with it                            │
//! │  }                                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Conflicts
//! | strategy      | effect                                                  |
//! |---------------|---------------------------------------------------------|
//! | `manual`      | held pending, `sync:conflict` emitted                   |
//! | `server_wins` | server copy cached, action cancelled                    |
//! | `client_wins` | re-sent against the server version                      |
//! | `merge`       | local keys over server keys, re-sent                    |
//!
//! Automatic re-sends count against the action's retry budget.
//!
//! ## Triggers
//! The background task runs a pass when the connection comes up, on the
//! sync interval, and on request. Nothing runs while disconnected.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use shopfloor_core::{
    merge_payloads, ActionId, ActionStatus, ActionVerb, ConflictRecord, ConnectionStatus,
    EntitySnapshot, QueuedAction, ResolutionStrategy,
};

use crate::error::{SyncError, SyncResult};
use crate::protocol;
use crate::queue::OfflineActionQueue;
use crate::remote::{EntityService, RemoteAck, RemoteError, RemoteResult};
use crate::store::ActionStore;
use crate::subscription::SubscriptionRegistry;

/// Outcome counts of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub attempted: usize,
    pub completed: usize,
    /// Put back to pending for a later pass.
    pub retried: usize,
    pub failed: usize,
    pub conflicts: usize,
    /// Failed because a dependency failed.
    pub cascaded: usize,
    /// Pending but not eligible when the pass ended.
    pub blocked: usize,
    /// Put back untouched because the backend could not be reached.
    pub deferred: usize,
}

pub struct SyncReconciler {
    queue: OfflineActionQueue,
    service: Arc<dyn EntityService>,
    registry: SubscriptionRegistry,
    strategy: ResolutionStrategy,
    /// One pass at a time.
    running: Mutex<()>,
}

impl SyncReconciler {
    pub fn new(
        queue: OfflineActionQueue,
        service: Arc<dyn EntityService>,
        registry: SubscriptionRegistry,
    ) -> Self {
        let strategy = queue.settings().conflict_strategy;
        SyncReconciler {
            queue,
            service,
            registry,
            strategy,
            running: Mutex::new(()),
        }
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        self.strategy
    }

    // =========================================================================
    // Pass
    // =========================================================================

    /// Runs one pass over the queue. Each action is tried at most once.
    pub async fn run_pass(&self) -> SyncResult<PassReport> {
        let _running = self.running.lock().await;
        let mut report = PassReport::default();
        let mut attempted: HashSet<ActionId> = HashSet::new();

        while let Some(next) = self.queue.next_eligible(&attempted).await {
            attempted.insert(next.id);
            report.attempted += 1;

            let action = self.queue.begin_sync(next.id).await?;
            debug!(
                action_id = action.id,
                verb = %action.verb,
                entity_type = %action.entity_type,
                entity_id = %action.entity_id,
                "Syncing action"
            );

            let outcome = self.execute(&action).await;
            self.settle(action, outcome, &mut report).await?;
            if report.deferred > 0 {
                break;
            }
        }

        report.blocked = self.queue.blocked_count().await;

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                completed = report.completed,
                retried = report.retried,
                failed = report.failed,
                conflicts = report.conflicts,
                blocked = report.blocked,
                deferred = report.deferred,
                "Sync pass complete"
            );
        }
        if let Ok(data) = serde_json::to_value(report) {
            self.registry.publish_local(protocol::SYNC_PASS_COMPLETE, data);
        }
        Ok(report)
    }

    async fn execute(&self, action: &QueuedAction) -> RemoteResult {
        let (t, id) = (action.entity_type.as_str(), action.entity_id.as_str());
        match action.verb {
            ActionVerb::Create => self.service.create(t, id, &action.payload).await,
            ActionVerb::Update => {
                self.service
                    .update(t, id, &action.payload, action.base_version)
                    .await
            }
            ActionVerb::Delete => self.service.delete(t, id, action.base_version).await,
            ActionVerb::Sync => self.service.get(t, id).await,
        }
    }

    async fn settle(
        &self,
        action: QueuedAction,
        outcome: RemoteResult,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        match outcome {
            Ok(ack) => self.complete(&action, ack, report).await,
            Err(RemoteError::NotFound) if action.verb == ActionVerb::Delete => {
                debug!(action_id = action.id, "Entity already gone, delete complete");
                let ack = RemoteAck {
                    version: None,
                    payload: None,
                };
                self.complete(&action, ack, report).await
            }
            Err(RemoteError::NotFound) => {
                self.fail(&action, "entity not found".into(), report).await
            }
            Err(RemoteError::Rejected {
                message,
                retryable: true,
            }) => self.retry_or_fail(&action, message, report).await,
            Err(RemoteError::Rejected {
                message,
                retryable: false,
            }) => self.fail(&action, message, report).await,
            Err(RemoteError::Unavailable(reason)) => self.defer(&action, reason, report).await,
            Err(RemoteError::Conflict {
                server_version,
                server_payload,
            }) => {
                report.conflicts += 1;
                let record = ConflictRecord {
                    action_id: action.id,
                    entity_type: action.entity_type.clone(),
                    entity_id: action.entity_id.clone(),
                    server_version,
                    server_payload,
                    client_version: action.base_version,
                    client_payload: action.payload.clone(),
                    strategy: self.strategy,
                    resolution: None,
                    resolver: None,
                    detected_at: Utc::now(),
                    resolved_at: None,
                };
                self.handle_conflict(&action, record, report).await
            }
        }
    }

    async fn complete(
        &self,
        action: &QueuedAction,
        ack: RemoteAck,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        if action.verb != ActionVerb::Delete {
            let payload = match (&ack.payload, action.verb) {
                (Some(payload), _) => Some(payload.clone()),
                (None, ActionVerb::Sync) => None,
                (None, _) => Some(action.payload.clone()),
            };
            if let Some(payload) = payload {
                self.save_snapshot(action, ack.version, payload).await?;
            }
        }

        self.queue
            .update_with(action.id, |a| {
                a.status = ActionStatus::Completed;
                a.server_version = ack.version;
                a.last_error = None;
            })
            .await?;
        report.completed += 1;
        debug!(action_id = action.id, version = ?ack.version, "Action completed");
        Ok(())
    }

    async fn defer(
        &self,
        action: &QueuedAction,
        reason: String,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        self.queue
            .update_with(action.id, |a| {
                a.status = ActionStatus::Pending;
                a.last_error = Some(reason.clone());
            })
            .await?;
        report.deferred += 1;
        info!(action_id = action.id, reason = %reason, "Backend unreachable, ending pass");
        Ok(())
    }

    async fn retry_or_fail(
        &self,
        action: &QueuedAction,
        message: String,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        if action.retry_count >= action.max_retries {
            let message = format!(
                "{} (gave up after {} retries)",
                message, action.retry_count
            );
            return self.fail(action, message, report).await;
        }

        let updated = self
            .queue
            .update_with(action.id, |a| {
                a.status = ActionStatus::Pending;
                a.retry_count += 1;
                a.last_error = Some(message);
            })
            .await?;
        report.retried += 1;
        warn!(
            action_id = action.id,
            retry = updated.retry_count,
            max_retries = updated.max_retries,
            error = ?updated.last_error,
            "Action will be retried"
        );
        Ok(())
    }

    async fn fail(
        &self,
        action: &QueuedAction,
        message: String,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        let failed = self
            .queue
            .update_with(action.id, |a| {
                a.status = ActionStatus::Failed;
                a.last_error = Some(message);
            })
            .await?;
        report.failed += 1;
        error!(action_id = failed.id, error = ?failed.last_error, "Action failed");
        self.publish_failed(&failed);

        let cascaded = self.queue.fail_dependents(failed.id).await?;
        report.cascaded += cascaded.len();
        for dependent in &cascaded {
            self.publish_failed(dependent);
        }
        Ok(())
    }

    fn publish_failed(&self, action: &QueuedAction) {
        self.registry.publish_local(
            protocol::SYNC_ACTION_FAILED,
            json!({
                "actionId": action.id,
                "entityType": action.entity_type,
                "entityId": action.entity_id,
                "error": action.last_error,
            }),
        );
    }

    async fn save_snapshot(
        &self,
        action: &QueuedAction,
        version: Option<u64>,
        payload: serde_json::Value,
    ) -> SyncResult<()> {
        let snapshot = EntitySnapshot {
            entity_type: action.entity_type.clone(),
            entity_id: action.entity_id.clone(),
            version,
            payload,
            updated_at: Utc::now(),
        };
        self.queue.store().save_snapshot(&snapshot).await
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    async fn handle_conflict(
        &self,
        action: &QueuedAction,
        record: ConflictRecord,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        warn!(
            action_id = action.id,
            server_version = record.server_version,
            client_version = ?record.client_version,
            strategy = %self.strategy,
            "Version conflict"
        );

        match self.strategy {
            ResolutionStrategy::Manual => {
                let held = self
                    .queue
                    .update_with(action.id, |a| {
                        a.status = ActionStatus::Pending;
                        a.last_error = Some("version conflict".into());
                        a.conflict = Some(record);
                    })
                    .await?;
                if let Some(conflict) = &held.conflict {
                    if let Ok(data) = serde_json::to_value(conflict) {
                        self.registry.publish_local(protocol::SYNC_CONFLICT, data);
                    }
                }
                Ok(())
            }
            ResolutionStrategy::ServerWins => {
                self.apply_resolution(action, record, ResolutionStrategy::ServerWins, "auto")
                    .await?;
                Ok(())
            }
            strategy => {
                if action.retry_count >= action.max_retries {
                    return self
                        .fail(action, "conflict could not be settled".into(), report)
                        .await;
                }
                self.apply_resolution(action, record, strategy, "auto").await?;
                report.retried += 1;
                Ok(())
            }
        }
    }

    /// Applies `strategy` to the action that produced `record`.
    async fn apply_resolution(
        &self,
        action: &QueuedAction,
        mut record: ConflictRecord,
        strategy: ResolutionStrategy,
        resolver: &str,
    ) -> SyncResult<QueuedAction> {
        record.resolution = Some(strategy);
        record.resolver = Some(resolver.to_string());
        record.resolved_at = Some(Utc::now());
        let automatic = resolver == "auto";

        info!(
            action_id = action.id,
            %strategy,
            resolver,
            "Resolving conflict"
        );

        match strategy {
            ResolutionStrategy::ServerWins => {
                self.save_snapshot(
                    action,
                    Some(record.server_version),
                    record.server_payload.clone(),
                )
                .await?;
                self.queue
                    .cancel_with(action.id, |a| {
                        a.last_error = Some("superseded by server copy".into());
                        a.conflict = Some(record);
                    })
                    .await
            }
            ResolutionStrategy::ClientWins | ResolutionStrategy::Merge => {
                let payload = if strategy == ResolutionStrategy::Merge {
                    merge_payloads(&record.server_payload, &record.client_payload)
                } else {
                    record.client_payload.clone()
                };
                let server_version = record.server_version;
                self.queue
                    .update_with(action.id, |a| {
                        a.status = ActionStatus::Pending;
                        a.payload = payload;
                        a.base_version = Some(server_version);
                        a.last_error = None;
                        if automatic {
                            a.retry_count += 1;
                        }
                        a.conflict = Some(record);
                    })
                    .await
            }
            ResolutionStrategy::Manual => Err(SyncError::InvalidConfig(
                "manual is not a resolution".into(),
            )),
        }
    }

    /// Settles a conflict held for a manual decision.
    pub async fn resolve_conflict(
        &self,
        id: ActionId,
        strategy: ResolutionStrategy,
        resolver: &str,
    ) -> SyncResult<QueuedAction> {
        if strategy == ResolutionStrategy::Manual {
            return Err(SyncError::InvalidConfig(
                "manual is not a resolution".into(),
            ));
        }

        let action = self
            .queue
            .get(id)
            .await
            .ok_or(SyncError::ActionNotFound(id))?;
        if action.status != ActionStatus::Pending {
            return Err(SyncError::InvalidActionState {
                id,
                status: action.status,
                expected: ActionStatus::Pending,
            });
        }
        let record = match &action.conflict {
            Some(record) if !record.is_resolved() => record.clone(),
            _ => return Err(SyncError::ConflictNotFound(id)),
        };
        self.apply_resolution(&action, record, strategy, resolver).await
    }

    // =========================================================================
    // Background Task
    // =========================================================================

    /// Spawns the trigger loop.
    pub fn spawn(
        self: Arc<Self>,
        status: watch::Receiver<ConnectionStatus>,
        interval: Duration,
    ) -> (ReconcilerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, status, interval));
        (ReconcilerHandle { tx }, task)
    }

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<ReconcilerCommand>,
        mut status: watch::Receiver<ConnectionStatus>,
        period: Duration,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut was_connected = status.borrow().is_connected();
        let mut status_open = true;

        info!(interval_secs = period.as_secs(), "Reconciler started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ReconcilerCommand::SyncNow(reply)) => {
                        let result = if status.borrow().is_connected() {
                            self.run_pass().await
                        } else {
                            Err(SyncError::Offline)
                        };
                        let _ = reply.send(result);
                    }
                    Some(ReconcilerCommand::Trigger) => self.run_if_needed(&status).await,
                    Some(ReconcilerCommand::Shutdown) | None => break,
                },
                changed = status.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let connected = status.borrow_and_update().is_connected();
                    if connected && !was_connected {
                        debug!("Connection established, reconciling");
                        self.run_if_needed(&status).await;
                    }
                    was_connected = connected;
                }
                _ = ticker.tick() => self.run_if_needed(&status).await,
            }
        }

        info!("Reconciler stopped");
    }

    async fn run_if_needed(&self, status: &watch::Receiver<ConnectionStatus>) {
        if !status.borrow().is_connected() || !self.queue.has_pending_work().await {
            return;
        }
        if let Err(e) = self.run_pass().await {
            error!(error = %e, "Sync pass aborted");
        }
    }
}

enum ReconcilerCommand {
    SyncNow(oneshot::Sender<SyncResult<PassReport>>),
    Trigger,
    Shutdown,
}

#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<ReconcilerCommand>,
}

impl ReconcilerHandle {
    /// Runs a pass now. Fails with `Offline` while disconnected.
    pub async fn sync_now(&self) -> SyncResult<PassReport> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ReconcilerCommand::SyncNow(tx))
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Asks for a pass if there is work and a connection.
    pub fn trigger(&self) {
        let _ = self.tx.send(ReconcilerCommand::Trigger);
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ReconcilerCommand::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::protocol::EventMessage;
    use crate::store::MemoryStore;
    use crate::subscription::SubscriptionHandle;
    use crate::testing::{settle, ScriptedEntityService, ServiceCall};
    use serde_json::{json, Value};
    use shopfloor_core::{NewAction, SocketState};
    use std::sync::Mutex as StdMutex;

    struct Fixture {
        queue: OfflineActionQueue,
        store: Arc<MemoryStore>,
        service: ScriptedEntityService,
        registry: SubscriptionRegistry,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = OfflineActionQueue::load(store.clone(), QueueSettings::default())
            .await
            .unwrap();
        Fixture {
            queue,
            store,
            service: ScriptedEntityService::new(),
            registry: SubscriptionRegistry::new(),
        }
    }

    impl Fixture {
        fn reconciler(&self, strategy: ResolutionStrategy) -> SyncReconciler {
            SyncReconciler::new(
                self.queue.clone(),
                Arc::new(self.service.clone()),
                self.registry.clone(),
            )
            .with_strategy(strategy)
        }

        fn record(&self, event_type: &str) -> (SubscriptionHandle, Arc<StdMutex<Vec<Value>>>) {
            let seen = Arc::new(StdMutex::new(Vec::new()));
            let sink = seen.clone();
            let handle = self
                .registry
                .on(event_type, move |e: &EventMessage| sink.lock().unwrap().push(e.data.clone()))
                .unwrap();
            (handle, seen)
        }
    }

    fn conflict(version: u64, payload: Value) -> RemoteResult {
        Err(RemoteError::Conflict {
            server_version: version,
            server_payload: payload,
        })
    }

    #[tokio::test]
    async fn test_pass_follows_dependency_chain() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::create("part", "p-1", json!({"rev": "A"})))
            .await
            .unwrap();
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({"rev": "B"})).with_priority(10))
            .await
            .unwrap();
        f.service.then_ok(1).then_ok(2);

        let report = f.reconciler(ResolutionStrategy::Manual).run_pass().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.completed, 2);

        let ops: Vec<&str> = f.service.calls().iter().map(|c| c.op).collect();
        assert_eq!(ops, vec!["create", "update"]);
        assert_eq!(f.queue.get(2).await.unwrap().server_version, Some(2));

        let snapshot = f.store.load_snapshot("part", "p-1").await.unwrap().unwrap();
        assert_eq!(snapshot.version, Some(2));
        assert_eq!(snapshot.payload, json!({"rev": "B"}));
    }

    #[tokio::test]
    async fn test_retry_budget_then_failure_cascades() {
        let f = fixture().await;
        let (_sub, failed) = f.record(protocol::SYNC_ACTION_FAILED);
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({})).with_max_retries(3))
            .await
            .unwrap();
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({"qty": 2})))
            .await
            .unwrap();
        for _ in 0..4 {
            f.service.then(Err(RemoteError::retryable("503 busy")));
        }

        let reconciler = f.reconciler(ResolutionStrategy::Manual);
        for pass in 1..=3 {
            let report = reconciler.run_pass().await.unwrap();
            assert_eq!(report.retried, 1);
            assert_eq!(report.blocked, 1);
            let action = f.queue.get(1).await.unwrap();
            assert_eq!(action.status, ActionStatus::Pending);
            assert_eq!(action.retry_count, pass);
        }

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.cascaded, 1);
        assert_eq!(f.queue.get(1).await.unwrap().status, ActionStatus::Failed);

        let dependent = f.queue.get(2).await.unwrap();
        assert_eq!(dependent.status, ActionStatus::Failed);
        assert_eq!(dependent.last_error.as_deref(), Some("dependency 1 failed"));
        assert_eq!(failed.lock().unwrap().len(), 2);
        assert_eq!(f.service.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_manual_conflict_holds_until_resolved() {
        let f = fixture().await;
        let (_sub, conflicts) = f.record(protocol::SYNC_CONFLICT);
        f.queue
            .add_action(
                NewAction::update("work_order", "wo-7", json!({"qty": 12})).with_base_version(3),
            )
            .await
            .unwrap();
        f.service.then(conflict(5, json!({"qty": 10, "line": "L2"})));

        let reconciler = f.reconciler(ResolutionStrategy::Manual);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(conflicts.lock().unwrap().len(), 1);
        assert_eq!(f.queue.stats().await.conflicts, 1);

        // held: nothing is attempted
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.attempted, 0);

        let resolved = reconciler
            .resolve_conflict(1, ResolutionStrategy::ClientWins, "supervisor")
            .await
            .unwrap();
        let record = resolved.conflict.unwrap();
        assert_eq!(record.resolver.as_deref(), Some("supervisor"));
        assert_eq!(resolved.retry_count, 0);

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(
            f.service.calls().last(),
            Some(&ServiceCall {
                op: "update",
                entity_type: "work_order".into(),
                entity_id: "wo-7".into(),
                payload: Some(json!({"qty": 12})),
                base_version: Some(5),
            })
        );
    }

    #[tokio::test]
    async fn test_server_wins_cancels_and_caches_server_copy() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({"rev": "B"})))
            .await
            .unwrap();
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({"rev": "C"})))
            .await
            .unwrap();
        f.service.then(conflict(8, json!({"rev": "X"}))).then_ok(9);

        let report = f
            .reconciler(ResolutionStrategy::ServerWins)
            .run_pass()
            .await
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.completed, 1);

        let first = f.queue.get(1).await.unwrap();
        assert_eq!(first.status, ActionStatus::Cancelled);
        assert_eq!(
            first.conflict.unwrap().resolution,
            Some(ResolutionStrategy::ServerWins)
        );
        assert_eq!(f.queue.get(2).await.unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_merge_resends_merged_payload() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::update("station", "s-4", json!({"state": "run"})))
            .await
            .unwrap();
        f.service
            .then(conflict(2, json!({"state": "idle", "operator": "op-9"})))
            .then_ok(3);

        let reconciler = f.reconciler(ResolutionStrategy::Merge);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.retried, 1);

        let action = f.queue.get(1).await.unwrap();
        assert_eq!(action.payload, json!({"state": "run", "operator": "op-9"}));
        assert_eq!(action.base_version, Some(2));
        assert_eq!(action.retry_count, 1);

        reconciler.run_pass().await.unwrap();
        assert_eq!(f.queue.get(1).await.unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_not_found_and_permanent_rejection() {
        let f = fixture().await;
        f.queue.add_action(NewAction::delete("part", "p-1")).await.unwrap();
        f.queue
            .add_action(NewAction::update("part", "p-2", json!({})))
            .await
            .unwrap();
        f.queue
            .add_action(NewAction::create("part", "p-3", json!({})))
            .await
            .unwrap();
        f.service
            .then(Err(RemoteError::NotFound))
            .then(Err(RemoteError::NotFound))
            .then(Err(RemoteError::permanent("schema violation")));

        let report = f.reconciler(ResolutionStrategy::Manual).run_pass().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(f.queue.get(1).await.unwrap().status, ActionStatus::Completed);
        assert_eq!(f.queue.get(2).await.unwrap().status, ActionStatus::Failed);
        assert_eq!(
            f.queue.get(3).await.unwrap().last_error.as_deref(),
            Some("schema violation")
        );
    }

    #[tokio::test]
    async fn test_sync_verb_pulls_snapshot() {
        let f = fixture().await;
        f.queue.add_action(NewAction::sync("recipe", "r-2")).await.unwrap();
        f.service.then(Ok(RemoteAck {
            version: Some(14),
            payload: Some(json!({"temp": 180})),
        }));

        f.reconciler(ResolutionStrategy::Manual).run_pass().await.unwrap();
        let snapshot = f.store.load_snapshot("recipe", "r-2").await.unwrap().unwrap();
        assert_eq!(snapshot.version, Some(14));
        assert_eq!(snapshot.payload, json!({"temp": 180}));
    }

    #[tokio::test]
    async fn test_resolve_conflict_rejects_bad_requests() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({})))
            .await
            .unwrap();
        let reconciler = f.reconciler(ResolutionStrategy::Manual);

        assert!(matches!(
            reconciler.resolve_conflict(1, ResolutionStrategy::Manual, "op").await,
            Err(SyncError::InvalidConfig(_))
        ));
        assert!(matches!(
            reconciler.resolve_conflict(1, ResolutionStrategy::Merge, "op").await,
            Err(SyncError::ConflictNotFound(1))
        ));
        assert!(matches!(
            reconciler.resolve_conflict(42, ResolutionStrategy::Merge, "op").await,
            Err(SyncError::ActionNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_conflict_stays_cancelled() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({"rev": "B"})))
            .await
            .unwrap();
        f.service.then(conflict(4, json!({"rev": "X"})));

        let reconciler = f.reconciler(ResolutionStrategy::Manual);
        reconciler.run_pass().await.unwrap();
        assert!(f.queue.cancel(1).await.unwrap());

        let err = reconciler
            .resolve_conflict(1, ResolutionStrategy::ClientWins, "supervisor")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::InvalidActionState {
                id: 1,
                status: ActionStatus::Cancelled,
                expected: ActionStatus::Pending,
            }
        ));
        assert_eq!(f.queue.get(1).await.unwrap().status, ActionStatus::Cancelled);

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(f.service.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_ends_pass_without_spending_retries() {
        let f = fixture().await;
        for n in 1..=3 {
            f.queue
                .add_action(
                    NewAction::update("part", format!("p-{}", n), json!({})).with_max_retries(1),
                )
                .await
                .unwrap();
        }
        f.service
            .then_ok(1)
            .then(Err(RemoteError::unavailable("connection lost")));

        let reconciler = f.reconciler(ResolutionStrategy::Manual);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(f.service.calls().len(), 2);

        let deferred = f.queue.get(2).await.unwrap();
        assert_eq!(deferred.status, ActionStatus::Pending);
        assert_eq!(deferred.retry_count, 0);
        assert_eq!(deferred.last_error.as_deref(), Some("connection lost"));
        let untouched = f.queue.get(3).await.unwrap();
        assert_eq!((untouched.status, untouched.retry_count), (ActionStatus::Pending, 0));

        // back online: the deferred work goes through on the next pass
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(f.queue.stats().await.completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_service_on_dead_link_defers_whole_queue() {
        use crate::config::{ConnectionSettings, DispatchSettings};
        use crate::connection::ConnectionManager;
        use crate::remote::ChannelEntityService;
        use crate::testing::MemoryConnector;

        let f = fixture().await;
        for n in 1..=3 {
            f.queue
                .add_action(
                    NewAction::update("part", format!("p-{}", n), json!({})).with_max_retries(1),
                )
                .await
                .unwrap();
        }
        let (connection, _task) = ConnectionManager::spawn(
            ConnectionSettings::default(),
            DispatchSettings::default(),
            Arc::new(MemoryConnector::new()),
            f.registry.clone(),
        );
        let service =
            ChannelEntityService::new(connection, &f.registry, Duration::from_secs(5)).unwrap();
        let reconciler =
            SyncReconciler::new(f.queue.clone(), Arc::new(service), f.registry.clone());

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(report.deferred, 1);
        for action in f.queue.get_actions(&Default::default()).await {
            assert_eq!(action.status, ActionStatus::Pending);
            assert_eq!(action.retry_count, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_runs_on_connect_and_gates_sync_now() {
        let f = fixture().await;
        f.queue
            .add_action(NewAction::update("part", "p-1", json!({})))
            .await
            .unwrap();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let reconciler = Arc::new(f.reconciler(ResolutionStrategy::Manual));
        let (handle, _task) = reconciler.spawn(status_rx, Duration::from_secs(60));

        assert!(matches!(handle.sync_now().await, Err(SyncError::Offline)));
        assert!(f.service.calls().is_empty());

        status_tx.send_modify(|s| s.socket = SocketState::Connected);
        settle().await;
        assert_eq!(f.queue.get(1).await.unwrap().status, ActionStatus::Completed);

        let report = handle.sync_now().await.unwrap();
        assert_eq!(report.attempted, 0);
        handle.shutdown();
    }
}
