// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bounded-work executor of scheduling operators: one pending operator
//! per replica, a min-heap of re-fire times, batched dispatch.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use rivulet_common::{ChangefeedId, DispatcherId, NodeId};
use rivulet_pb::{TableSpan, TableSpanStatus};
use tracing::{info, warn};

use super::{MergeSplitDispatcherOperator, Operator, RemoveDispatcherOperator};
use crate::maintainer::operator::merge_split::MergeSplitContext;
use crate::maintainer::replica::{ReplicationDb, SpanReplication};
use crate::manager::NodeManager;
use crate::messaging::MessageCenter;
use crate::metrics::MetaMetrics;

const OPERATOR_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const IDLE_WAIT: Duration = Duration::from_millis(200);
const BUSY_WAIT: Duration = Duration::from_millis(50);
/// An operator that has not finished after this long is abandoned and its
/// replica rescheduled from scratch.
const OPERATOR_TIMEOUT: Duration = Duration::from_secs(120);

struct OperatorEntry {
    op: Arc<dyn Operator>,
    removed: AtomicBool,
    enqueue_time: Instant,
    /// The authoritative next fire time; stale heap items are detected by
    /// comparing against it.
    next_fire: Mutex<Instant>,
}

struct QueueItem {
    fire: Instant,
    seq: u64,
    entry: Arc<OperatorEntry>,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.fire == other.fire && self.seq == other.seq
    }
}
impl Eq for QueueItem {}
impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest fire time.
        (other.fire, other.seq).cmp(&(self.fire, self.seq))
    }
}

#[derive(Default)]
struct ControllerInner {
    operators: HashMap<DispatcherId, Arc<OperatorEntry>>,
    queue: BinaryHeap<QueueItem>,
    seq: u64,
}

impl ControllerInner {
    fn push_item(&mut self, entry: Arc<OperatorEntry>, fire: Instant) {
        *entry.next_fire.lock() = fire;
        self.seq += 1;
        self.queue.push(QueueItem {
            fire,
            seq: self.seq,
            entry,
        });
    }
}

/// Owns every pending operator of one changefeed. `execute` runs on the
/// shared task pool concurrently with the maintainer loop, so all state is
/// behind one mutex, acquired before the replication db's lock everywhere.
pub struct OperatorController {
    changefeed_id: ChangefeedId,
    db: Arc<ReplicationDb>,
    node_manager: Arc<NodeManager>,
    message_center: Arc<dyn MessageCenter>,
    metrics: Arc<MetaMetrics>,
    batch_size: usize,
    inner: Mutex<ControllerInner>,
}

impl OperatorController {
    pub fn new(
        changefeed_id: ChangefeedId,
        db: Arc<ReplicationDb>,
        node_manager: Arc<NodeManager>,
        message_center: Arc<dyn MessageCenter>,
        metrics: Arc<MetaMetrics>,
        batch_size: usize,
    ) -> Self {
        Self {
            changefeed_id,
            db,
            node_manager,
            message_center,
            metrics,
            batch_size,
            inner: Mutex::new(ControllerInner::default()),
        }
    }

    /// Accept an operator unless its replica is unknown or already driven.
    pub fn add_operator(&self, op: Arc<dyn Operator>) -> bool {
        let mut inner = self.inner.lock();
        if inner.operators.contains_key(&op.id()) {
            info!(
                changefeed = %self.changefeed_id,
                operator = %op.desc(),
                "add operator failed, operator already exists"
            );
            return false;
        }
        if self.db.get(op.id()).is_none() {
            warn!(
                changefeed = %self.changefeed_id,
                operator = %op.desc(),
                "add operator failed, replica not found"
            );
            return false;
        }
        self.push_operator(&mut inner, op);
        true
    }

    /// Pop and run up to `batch_size` due operators; returns when to run
    /// again.
    pub fn execute(&self) -> Instant {
        let mut executed = 0;
        loop {
            let (op, next) = self.poll_queueing_operator();
            let Some(op) = op else {
                if next {
                    continue;
                }
                return Instant::now() + IDLE_WAIT;
            };

            if let Some(msg) = op.schedule() {
                if let Err(e) = self.message_center.send(msg) {
                    warn!(
                        changefeed = %self.changefeed_id,
                        operator = %op.desc(),
                        error = %e,
                        "failed to send operator message"
                    );
                }
            }
            executed += 1;
            if executed >= self.batch_size {
                return Instant::now() + BUSY_WAIT;
            }
        }
    }

    /// One scheduling step: the next due operator, or whether polling should
    /// continue.
    fn poll_queueing_operator(&self) -> (Option<Arc<dyn Operator>>, bool) {
        let mut inner = self.inner.lock();
        let Some(item) = inner.queue.pop() else {
            return (None, false);
        };
        let entry = item.entry.clone();
        if entry.removed.load(Ordering::Acquire) {
            return (None, true);
        }
        if *entry.next_fire.lock() != item.fire {
            // A stale duplicate of a re-pushed entry.
            return (None, true);
        }
        let op = entry.op.clone();
        if op.is_finished() {
            op.post_finish();
            entry.removed.store(true, Ordering::Release);
            inner.operators.remove(&op.id());
            self.metrics
                .finished_operator_count
                .with_label_values(&[
                    &self.changefeed_id.namespace,
                    &self.changefeed_id.name,
                    op.op_type(),
                ])
                .inc();
            self.metrics
                .operator_duration
                .with_label_values(&[
                    &self.changefeed_id.namespace,
                    &self.changefeed_id.name,
                    op.op_type(),
                ])
                .observe(entry.enqueue_time.elapsed().as_secs_f64());
            info!(
                changefeed = %self.changefeed_id,
                operator = %op.desc(),
                "operator finished"
            );
            return (None, true);
        }
        if entry.enqueue_time.elapsed() >= OPERATOR_TIMEOUT {
            warn!(
                changefeed = %self.changefeed_id,
                operator = %op.desc(),
                "operator timed out, replica goes back to absent"
            );
            op.on_task_removed();
            entry.removed.store(true, Ordering::Release);
            inner.operators.remove(&op.id());
            if let Some(replica) = self.db.get(op.id()) {
                self.db.mark_absent(&replica);
            }
            return (None, true);
        }
        let now = Instant::now();
        if now < item.fire {
            inner.push_item(entry, item.fire);
            return (None, false);
        }
        inner.push_item(entry, now + OPERATOR_RETRY_INTERVAL);
        (Some(op), true)
    }

    pub fn update_operator_status(&self, id: DispatcherId, from: &NodeId, status: &TableSpanStatus) {
        let entry = self.inner.lock().operators.get(&id).cloned();
        if let Some(entry) = entry {
            entry.op.check(from, status);
        }
    }

    /// A node left: orphaned replicas with no operator go back to absent,
    /// every live operator gets a chance to fail fast.
    pub fn on_node_removed(&self, node: &NodeId) {
        let (entries, orphans) = {
            let inner = self.inner.lock();
            let entries: Vec<Arc<OperatorEntry>> = inner.operators.values().cloned().collect();
            let orphans: Vec<Arc<SpanReplication>> = self
                .db
                .get_by_node(node)
                .into_iter()
                .filter(|replica| !inner.operators.contains_key(&replica.id()))
                .collect();
            (entries, orphans)
        };
        for replica in orphans {
            self.db.mark_absent(&replica);
        }
        for entry in entries {
            entry.op.on_node_removed(node);
        }
    }

    pub fn get_operator(&self, id: DispatcherId) -> Option<Arc<dyn Operator>> {
        self.inner
            .lock()
            .operators
            .get(&id)
            .map(|entry| entry.op.clone())
    }

    pub fn operator_size(&self) -> usize {
        self.inner.lock().operators.len()
    }

    /// Tear down every replica. Only called when the changefeed stops.
    pub fn remove_all_tasks(&self) {
        let detached = self.db.try_remove_all();
        let mut inner = self.inner.lock();
        for replica in detached {
            self.remove_replica_set(&mut inner, replica);
        }
    }

    /// Tear down every replica of one schema; the drop-database side effect.
    pub fn remove_tasks_by_schema_id(&self, schema_id: i64) {
        let detached = self.db.try_remove_by_schema_id(schema_id);
        let mut inner = self.inner.lock();
        for replica in detached {
            self.remove_replica_set(&mut inner, replica);
        }
    }

    /// Tear down every replica of the given tables; the drop-table side
    /// effect.
    pub fn remove_tasks_by_table_ids(&self, table_ids: &[i64]) {
        let detached = self.db.try_remove_by_table_ids(table_ids);
        let mut inner = self.inner.lock();
        for replica in detached {
            self.remove_replica_set(&mut inner, replica);
        }
    }

    /// Install one merge/split group: a randomly chosen primary plus
    /// secondaries that finish when the primary does.
    pub fn add_merge_split_operator(
        &self,
        affected: Vec<Arc<SpanReplication>>,
        new_spans: Vec<TableSpan>,
    ) -> bool {
        if affected.is_empty() || new_spans.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock();
        for replica in &affected {
            if inner.operators.contains_key(&replica.id()) {
                info!(
                    changefeed = %self.changefeed_id,
                    dispatcher = %replica.id(),
                    "add merge split operator failed, operator already exists"
                );
                return false;
            }
            if self.db.get(replica.id()).is_none() {
                warn!(
                    changefeed = %self.changefeed_id,
                    dispatcher = %replica.id(),
                    "add merge split operator failed, replica not found"
                );
                return false;
            }
        }
        let primary_idx = rand::thread_rng().gen_range(0..affected.len());
        let primary = affected[primary_idx].id();
        let table_id = new_spans[0].table_id;
        let (old_count, new_count) = (affected.len(), new_spans.len());
        let ctx = MergeSplitContext::new(primary, affected.clone(), new_spans);
        for replica in affected {
            let op = Arc::new(MergeSplitDispatcherOperator::new(
                self.db.clone(),
                replica,
                ctx.clone(),
            ));
            self.push_operator(&mut inner, op);
        }
        info!(
            changefeed = %self.changefeed_id,
            primary = %primary,
            table_id,
            old_spans = old_count,
            new_spans = new_count,
            "add merge split operator"
        );
        true
    }

    /// Replace whatever operator the replica had with a remove operator.
    fn remove_replica_set(&self, inner: &mut ControllerInner, replica: Arc<SpanReplication>) {
        let id = replica.id();
        if let Some(old) = inner.operators.remove(&id) {
            info!(
                changefeed = %self.changefeed_id,
                operator = %old.op.desc(),
                "replica removed, replacing the old operator"
            );
            old.op.on_task_removed();
            old.op.post_finish();
            old.removed.store(true, Ordering::Release);
        }
        let op = Arc::new(RemoveDispatcherOperator::new(self.db.clone(), replica));
        self.push_operator(inner, op);
    }

    fn push_operator(&self, inner: &mut ControllerInner, op: Arc<dyn Operator>) {
        // Involved nodes may already be gone; let the operator fail fast.
        let alive = self.node_manager.get_alive_nodes();
        for node in op.affected_nodes() {
            if !alive.contains_key(&node) {
                op.on_node_removed(&node);
            }
        }
        info!(
            changefeed = %self.changefeed_id,
            operator = %op.desc(),
            "add operator to running queue"
        );
        let entry = Arc::new(OperatorEntry {
            op: op.clone(),
            removed: AtomicBool::new(false),
            enqueue_time: Instant::now(),
            next_fire: Mutex::new(Instant::now()),
        });
        inner.operators.insert(op.id(), entry.clone());
        op.start();
        inner.push_item(entry, Instant::now());
        self.metrics
            .created_operator_count
            .with_label_values(&[
                &self.changefeed_id.namespace,
                &self.changefeed_id.name,
                op.op_type(),
            ])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use rivulet_common::span::total_span;
    use rivulet_common::ChangefeedId;
    use rivulet_pb::{ComponentState, ScheduleAction};

    use super::*;
    use crate::maintainer::operator::AddDispatcherOperator;
    use crate::maintainer::replica::ReplicaState;
    use crate::manager::{Env, NodeInfo};
    use crate::messaging::{CollectingMessageCenter, MessagePayload};

    fn setup() -> (
        Arc<OperatorController>,
        Arc<ReplicationDb>,
        Arc<CollectingMessageCenter>,
        Env,
    ) {
        let changefeed_id = ChangefeedId::in_default("op-test");
        let (env, mc) = Env::for_test(NodeId::from("node-a"));
        for node in ["node-a", "node-b"] {
            env.node_manager
                .register_node(NodeInfo::new(NodeId::from(node), "127.0.0.1:8300"));
        }
        let db = Arc::new(ReplicationDb::new(changefeed_id.clone()));
        let controller = Arc::new(OperatorController::new(
            changefeed_id,
            db.clone(),
            env.node_manager.clone(),
            env.message_center.clone(),
            env.metrics.clone(),
            16,
        ));
        (controller, db, mc, env)
    }

    fn absent_replica(db: &ReplicationDb, table_id: i64) -> Arc<SpanReplication> {
        let replica = Arc::new(SpanReplication::new_absent(
            ChangefeedId::in_default("op-test"),
            1,
            total_span(table_id),
            1000,
        ));
        db.insert_absent(replica.clone());
        replica
    }

    fn working_status(replica: &SpanReplication, state: ComponentState) -> TableSpanStatus {
        TableSpanStatus {
            id: replica.id().to_pb(),
            component_status: state as i32,
            checkpoint_ts: 1500,
            event_size_per_second: 0.0,
        }
    }

    fn sent_actions(mc: &CollectingMessageCenter) -> Vec<(NodeId, ScheduleAction)> {
        mc.take()
            .into_iter()
            .filter_map(|msg| match msg.payload {
                MessagePayload::ScheduleDispatcher(req) => {
                    Some((msg.target, req.schedule_action()))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_add_operator_lifecycle_and_one_op_per_replica() {
        let (controller, db, mc, _env) = setup();
        let replica = absent_replica(&db, 101);
        let node = NodeId::from("node-a");

        assert!(controller.add_operator(Arc::new(AddDispatcherOperator::new(
            db.clone(),
            replica.clone(),
            node.clone(),
        ))));
        // At most one operator per replica.
        assert!(!controller.add_operator(Arc::new(AddDispatcherOperator::new(
            db.clone(),
            replica.clone(),
            node.clone(),
        ))));
        assert_eq!(db.scheduling_size(), 1);

        controller.execute();
        let sent = sent_actions(&mc);
        assert_eq!(sent, vec![(node.clone(), ScheduleAction::Create)]);

        controller.update_operator_status(
            replica.id(),
            &node,
            &working_status(&replica, ComponentState::Working),
        );
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(db.replicating_size(), 1);
        assert_eq!(replica.checkpoint_ts(), 1500);
    }

    #[test]
    fn test_unknown_replica_is_rejected() {
        let (controller, db, _mc, _env) = setup();
        let stray = Arc::new(SpanReplication::new_absent(
            ChangefeedId::in_default("op-test"),
            1,
            total_span(999),
            1000,
        ));
        assert!(!controller.add_operator(Arc::new(AddDispatcherOperator::new(
            db,
            stray,
            NodeId::from("node-a"),
        ))));
    }

    #[test]
    fn test_node_removed_orphans_go_absent_and_add_fails_fast() {
        let (controller, db, _mc, _env) = setup();
        let node = NodeId::from("node-b");
        // A working replica with no operator.
        let orphan = absent_replica(&db, 101);
        db.bind_node_and_mark_scheduling(&orphan, node.clone());
        db.mark_replicating(&orphan);
        // A replica being added to the same node.
        let adding = absent_replica(&db, 102);
        controller.add_operator(Arc::new(AddDispatcherOperator::new(
            db.clone(),
            adding.clone(),
            node.clone(),
        )));

        controller.on_node_removed(&node);
        assert_eq!(db.state_of(orphan.id()), Some(ReplicaState::Absent));
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert_eq!(db.state_of(adding.id()), Some(ReplicaState::Absent));
    }

    #[test]
    fn test_remove_replaces_in_flight_operator() {
        let (controller, db, mc, _env) = setup();
        let replica = absent_replica(&db, 101);
        let node = NodeId::from("node-a");
        controller.add_operator(Arc::new(AddDispatcherOperator::new(
            db.clone(),
            replica.clone(),
            node.clone(),
        )));
        mc.take();

        controller.remove_tasks_by_table_ids(&[101]);
        assert_eq!(controller.operator_size(), 1);
        controller.execute();
        let sent = sent_actions(&mc);
        assert!(sent.contains(&(node.clone(), ScheduleAction::Remove)));

        controller.update_operator_status(
            replica.id(),
            &node,
            &working_status(&replica, ComponentState::Stopped),
        );
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert!(db.get(replica.id()).is_none());
    }

    #[test]
    fn test_merge_split_group_replaces_spans() {
        let (controller, db, mc, _env) = setup();
        let spans = rivulet_common::span::evenly_split_span(&total_span(7), 2);
        let mut group = Vec::new();
        for (idx, span) in spans.iter().enumerate() {
            let replica = Arc::new(SpanReplication::new_absent(
                ChangefeedId::in_default("op-test"),
                1,
                span.clone(),
                1000 + idx as u64,
            ));
            db.insert_absent(replica.clone());
            let node = NodeId::from(if idx == 0 { "node-a" } else { "node-b" });
            db.bind_node_and_mark_scheduling(&replica, node);
            db.mark_replicating(&replica);
            group.push(replica);
        }

        assert!(controller.add_merge_split_operator(group.clone(), vec![total_span(7)]));
        // Every member already has an operator now.
        assert!(!controller.add_merge_split_operator(group.clone(), vec![total_span(7)]));

        controller.execute();
        let removes = sent_actions(&mc);
        assert_eq!(removes.len(), 2);
        assert!(removes.iter().all(|(_, action)| *action == ScheduleAction::Remove));

        for replica in &group {
            let node = replica.node().unwrap();
            controller.update_operator_status(
                replica.id(),
                &node,
                &working_status(replica, ComponentState::Stopped),
            );
        }
        controller.execute();
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        assert!(group.iter().all(|replica| db.get(replica.id()).is_none()));
        // The merged span restarts from the least-advanced member.
        let merged = db.get_by_table_ids(&[7]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].span(), &total_span(7));
        assert_eq!(merged[0].checkpoint_ts(), 1000);
    }
}
