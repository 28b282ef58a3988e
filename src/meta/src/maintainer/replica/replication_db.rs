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

//! In-memory index of every dispatcher replica of one changefeed,
//! partitioned by scheduling state and indexed by node, schema, table and
//! span order. Every transition is one critical section and keeps all
//! indices consistent.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rivulet_common::{span, ChangefeedId, DispatcherId, NodeId, Ts};
use rivulet_pb::TableSpan;
use tracing::info;

use super::SpanReplication;

/// Which state partition a replica currently lives in. A removed replica is
/// simply gone from the db.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaState {
    Absent,
    Scheduling,
    Replicating,
}

#[derive(Default)]
struct DbInner {
    replicas: HashMap<DispatcherId, Arc<SpanReplication>>,
    states: HashMap<DispatcherId, ReplicaState>,
    absent: BTreeMap<DispatcherId, Arc<SpanReplication>>,
    scheduling: BTreeMap<DispatcherId, Arc<SpanReplication>>,
    replicating: BTreeMap<DispatcherId, Arc<SpanReplication>>,
    node_tasks: HashMap<NodeId, BTreeMap<DispatcherId, Arc<SpanReplication>>>,
    schema_tasks: HashMap<i64, BTreeMap<DispatcherId, Arc<SpanReplication>>>,
    table_tasks: HashMap<i64, BTreeMap<DispatcherId, Arc<SpanReplication>>>,
    /// `(table_id, start_key) -> replica`, for neighbour queries.
    span_index: BTreeMap<(i64, Vec<u8>), DispatcherId>,
    ddl_dispatcher: Option<DispatcherId>,
}

impl DbInner {
    fn add(&mut self, replica: Arc<SpanReplication>, state: ReplicaState) {
        let id = replica.id();
        self.replicas.insert(id, replica.clone());
        self.states.insert(id, state);
        self.partition_of(state).insert(id, replica.clone());
        if let Some(node) = replica.node() {
            self.node_tasks
                .entry(node)
                .or_default()
                .insert(id, replica.clone());
        }
        self.schema_tasks
            .entry(replica.schema_id())
            .or_default()
            .insert(id, replica.clone());
        self.table_tasks
            .entry(replica.table_id())
            .or_default()
            .insert(id, replica.clone());
        self.span_index
            .insert(span::span_order_key(replica.span()), id);
    }

    fn purge(&mut self, id: DispatcherId) -> Option<Arc<SpanReplication>> {
        let replica = self.replicas.remove(&id)?;
        if let Some(state) = self.states.remove(&id) {
            self.partition_of(state).remove(&id);
        }
        if let Some(node) = replica.node() {
            if let Some(tasks) = self.node_tasks.get_mut(&node) {
                tasks.remove(&id);
                if tasks.is_empty() {
                    self.node_tasks.remove(&node);
                }
            }
        }
        if let Some(tasks) = self.schema_tasks.get_mut(&replica.schema_id()) {
            tasks.remove(&id);
            if tasks.is_empty() {
                self.schema_tasks.remove(&replica.schema_id());
            }
        }
        if let Some(tasks) = self.table_tasks.get_mut(&replica.table_id()) {
            tasks.remove(&id);
            if tasks.is_empty() {
                self.table_tasks.remove(&replica.table_id());
            }
        }
        self.span_index.remove(&span::span_order_key(replica.span()));
        if self.ddl_dispatcher == Some(id) {
            self.ddl_dispatcher = None;
        }
        Some(replica)
    }

    fn partition_of(
        &mut self,
        state: ReplicaState,
    ) -> &mut BTreeMap<DispatcherId, Arc<SpanReplication>> {
        match state {
            ReplicaState::Absent => &mut self.absent,
            ReplicaState::Scheduling => &mut self.scheduling,
            ReplicaState::Replicating => &mut self.replicating,
        }
    }

    /// Move the replica to `state` and rebind its node, updating the node
    /// index. The single place partition membership changes.
    fn transition(
        &mut self,
        replica: &Arc<SpanReplication>,
        state: ReplicaState,
        node: Option<NodeId>,
    ) {
        let id = replica.id();
        if !self.replicas.contains_key(&id) {
            return;
        }
        if let Some(old_state) = self.states.insert(id, state) {
            self.partition_of(old_state).remove(&id);
        }
        self.partition_of(state).insert(id, replica.clone());

        let old_node = replica.node();
        if old_node != node {
            if let Some(old_node) = old_node {
                if let Some(tasks) = self.node_tasks.get_mut(&old_node) {
                    tasks.remove(&id);
                    if tasks.is_empty() {
                        self.node_tasks.remove(&old_node);
                    }
                }
            }
            if let Some(new_node) = &node {
                self.node_tasks
                    .entry(new_node.clone())
                    .or_default()
                    .insert(id, replica.clone());
            }
            replica.set_node(node);
        }
    }
}

pub struct ReplicationDb {
    changefeed_id: ChangefeedId,
    inner: RwLock<DbInner>,
}

impl ReplicationDb {
    pub fn new(changefeed_id: ChangefeedId) -> Self {
        Self {
            changefeed_id,
            inner: RwLock::new(DbInner::default()),
        }
    }

    pub fn insert_absent(&self, replica: Arc<SpanReplication>) {
        debug_assert!(replica.node().is_none());
        self.inner.write().add(replica, ReplicaState::Absent);
    }

    /// Insert a replica already working on a remote node, from a bootstrap
    /// report.
    pub fn insert_replicating(&self, replica: Arc<SpanReplication>) {
        debug_assert!(replica.node().is_some());
        self.inner.write().add(replica, ReplicaState::Replicating);
    }

    pub fn get(&self, id: DispatcherId) -> Option<Arc<SpanReplication>> {
        self.inner.read().replicas.get(&id).cloned()
    }

    /// Every replica, in dispatcher-id order.
    pub fn all_replicas(&self) -> Vec<Arc<SpanReplication>> {
        let inner = self.inner.read();
        let mut replicas: Vec<_> = inner.replicas.values().cloned().collect();
        replicas.sort_by_key(|replica| replica.id());
        replicas
    }

    /// Bind the replica to its destination and mark it scheduling; the first
    /// half of an add.
    pub fn bind_node_and_mark_scheduling(&self, replica: &Arc<SpanReplication>, node: NodeId) {
        self.inner
            .write()
            .transition(replica, ReplicaState::Scheduling, Some(node));
    }

    /// Back to absent with no owner.
    pub fn mark_absent(&self, replica: &Arc<SpanReplication>) {
        self.inner
            .write()
            .transition(replica, ReplicaState::Absent, None);
    }

    /// Scheduling, keeping the current owner. Used while an operator is
    /// draining or moving the dispatcher.
    pub fn mark_scheduling(&self, replica: &Arc<SpanReplication>) {
        let node = replica.node();
        self.inner
            .write()
            .transition(replica, ReplicaState::Scheduling, node);
    }

    pub fn mark_replicating(&self, replica: &Arc<SpanReplication>) {
        let node = replica.node();
        debug_assert!(node.is_some(), "replicating replica must have a node");
        self.inner
            .write()
            .transition(replica, ReplicaState::Replicating, node);
    }

    /// Terminal: purge the replica from every index.
    pub fn remove(&self, replica: &Arc<SpanReplication>) {
        self.inner.write().purge(replica.id());
    }

    /// Detach every replica. Absent ones are purged outright; the rest are
    /// returned so the caller can drive remove operators for them.
    pub fn try_remove_all(&self) -> Vec<Arc<SpanReplication>> {
        let ids: Vec<DispatcherId> = self.inner.read().replicas.keys().copied().collect();
        self.try_remove(ids)
    }

    pub fn try_remove_by_schema_id(&self, schema_id: i64) -> Vec<Arc<SpanReplication>> {
        let ids: Vec<DispatcherId> = self
            .inner
            .read()
            .schema_tasks
            .get(&schema_id)
            .map(|tasks| tasks.keys().copied().collect())
            .unwrap_or_default();
        self.try_remove(ids)
    }

    pub fn try_remove_by_table_ids(&self, table_ids: &[i64]) -> Vec<Arc<SpanReplication>> {
        let inner = self.inner.read();
        let mut ids = Vec::new();
        for table_id in table_ids {
            if let Some(tasks) = inner.table_tasks.get(table_id) {
                ids.extend(tasks.keys().copied());
            }
        }
        drop(inner);
        self.try_remove(ids)
    }

    fn try_remove(&self, ids: Vec<DispatcherId>) -> Vec<Arc<SpanReplication>> {
        let mut inner = self.inner.write();
        let mut detached = Vec::new();
        for id in ids {
            let Some(state) = inner.states.get(&id).copied() else {
                continue;
            };
            match state {
                ReplicaState::Absent => {
                    inner.purge(id);
                }
                _ => {
                    if let Some(replica) = inner.replicas.get(&id) {
                        detached.push(replica.clone());
                    }
                }
            }
        }
        detached
    }

    pub fn get_by_node(&self, node: &NodeId) -> Vec<Arc<SpanReplication>> {
        self.inner
            .read()
            .node_tasks
            .get(node)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_by_schema_id(&self, schema_id: i64) -> Vec<Arc<SpanReplication>> {
        self.inner
            .read()
            .schema_tasks
            .get(&schema_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_by_table_ids(&self, table_ids: &[i64]) -> Vec<Arc<SpanReplication>> {
        let inner = self.inner.read();
        let mut replicas = Vec::new();
        for table_id in table_ids {
            if let Some(tasks) = inner.table_tasks.get(table_id) {
                replicas.extend(tasks.values().cloned());
            }
        }
        replicas
    }

    /// All spans of one table in span order, for split and merge queries.
    pub fn spans_of_table(&self, table_id: i64) -> Vec<Arc<SpanReplication>> {
        let inner = self.inner.read();
        inner
            .span_index
            .range((table_id, Vec::new())..(table_id + 1, Vec::new()))
            .filter_map(|(_, id)| inner.replicas.get(id).cloned())
            .collect()
    }

    /// Table ids currently covered by any replica, the DDL span excluded.
    pub fn covered_table_ids(&self) -> HashSet<i64> {
        self.inner
            .read()
            .table_tasks
            .keys()
            .copied()
            .filter(|table_id| *table_id != span::DDL_SPAN_TABLE_ID)
            .collect()
    }

    pub fn absent_size(&self) -> usize {
        self.inner.read().absent.len()
    }

    pub fn scheduling_size(&self) -> usize {
        self.inner.read().scheduling.len()
    }

    pub fn replicating_size(&self) -> usize {
        self.inner.read().replicating.len()
    }

    pub fn task_size(&self) -> usize {
        self.inner.read().replicas.len()
    }

    pub fn task_size_by_node(&self, node: &NodeId) -> usize {
        self.inner
            .read()
            .node_tasks
            .get(node)
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    /// Replicating replica count per node.
    pub fn replicating_counts_by_node(&self) -> HashMap<NodeId, usize> {
        let inner = self.inner.read();
        let mut counts: HashMap<NodeId, usize> = HashMap::new();
        for replica in inner.replicating.values() {
            if let Some(node) = replica.node() {
                *counts.entry(node).or_default() += 1;
            }
        }
        counts
    }

    /// Up to `limit` absent replicas, in dispatcher-id order.
    pub fn get_absent_batch(&self, limit: usize) -> Vec<Arc<SpanReplication>> {
        self.inner
            .read()
            .absent
            .values()
            .take(limit)
            .cloned()
            .collect()
    }

    /// Replace a group of replicas with fresh absent replicas covering
    /// `new_spans`, the tail of split and merge operators.
    pub fn replace_with_spans(
        &self,
        old_replicas: &[Arc<SpanReplication>],
        new_spans: &[TableSpan],
        checkpoint_ts: Ts,
    ) -> Vec<Arc<SpanReplication>> {
        let schema_id = old_replicas
            .first()
            .map(|replica| replica.schema_id())
            .unwrap_or_default();
        let mut inner = self.inner.write();
        for replica in old_replicas {
            inner.purge(replica.id());
        }
        let mut created = Vec::with_capacity(new_spans.len());
        for new_span in new_spans {
            let replica = Arc::new(SpanReplication::new_absent(
                self.changefeed_id.clone(),
                schema_id,
                new_span.clone(),
                checkpoint_ts,
            ));
            inner.add(replica.clone(), ReplicaState::Absent);
            created.push(replica);
        }
        info!(
            changefeed = %self.changefeed_id,
            old = old_replicas.len(),
            new = created.len(),
            "replaced replica spans"
        );
        created
    }

    /// Rebind every replica of `table_id` to a new schema, keeping the schema
    /// index consistent. The rename-table side effect.
    pub fn update_schema_id(&self, table_id: i64, new_schema_id: i64) {
        let mut inner = self.inner.write();
        let ids: Vec<DispatcherId> = inner
            .table_tasks
            .get(&table_id)
            .map(|tasks| tasks.keys().copied().collect())
            .unwrap_or_default();
        for id in ids {
            let Some(replica) = inner.replicas.get(&id).cloned() else {
                continue;
            };
            let old_schema_id = replica.schema_id();
            if old_schema_id == new_schema_id {
                continue;
            }
            if let Some(tasks) = inner.schema_tasks.get_mut(&old_schema_id) {
                tasks.remove(&id);
                if tasks.is_empty() {
                    inner.schema_tasks.remove(&old_schema_id);
                }
            }
            replica.set_schema_id(new_schema_id);
            inner
                .schema_tasks
                .entry(new_schema_id)
                .or_default()
                .insert(id, replica);
        }
    }

    pub fn set_ddl_dispatcher(&self, id: DispatcherId) {
        self.inner.write().ddl_dispatcher = Some(id);
    }

    pub fn ddl_dispatcher(&self) -> Option<Arc<SpanReplication>> {
        let inner = self.inner.read();
        inner
            .ddl_dispatcher
            .and_then(|id| inner.replicas.get(&id).cloned())
    }

    pub fn state_of(&self, id: DispatcherId) -> Option<ReplicaState> {
        self.inner.read().states.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use rivulet_common::span::total_span;

    use super::*;

    fn db() -> ReplicationDb {
        ReplicationDb::new(ChangefeedId::in_default("test"))
    }

    fn absent(db: &ReplicationDb, table_id: i64) -> Arc<SpanReplication> {
        let replica = Arc::new(SpanReplication::new_absent(
            ChangefeedId::in_default("test"),
            1,
            total_span(table_id),
            1000,
        ));
        db.insert_absent(replica.clone());
        replica
    }

    #[test]
    fn test_exactly_one_partition_per_replica() {
        let db = db();
        let replica = absent(&db, 101);
        assert_eq!(db.state_of(replica.id()), Some(ReplicaState::Absent));
        assert_eq!(
            (db.absent_size(), db.scheduling_size(), db.replicating_size()),
            (1, 0, 0)
        );

        let node = NodeId::from("node-a");
        db.bind_node_and_mark_scheduling(&replica, node.clone());
        assert_eq!(
            (db.absent_size(), db.scheduling_size(), db.replicating_size()),
            (0, 1, 0)
        );
        assert_eq!(replica.node(), Some(node.clone()));
        assert_eq!(db.task_size_by_node(&node), 1);

        db.mark_replicating(&replica);
        assert_eq!(
            (db.absent_size(), db.scheduling_size(), db.replicating_size()),
            (0, 0, 1)
        );

        db.mark_absent(&replica);
        assert_eq!(replica.node(), None);
        assert_eq!(db.task_size_by_node(&node), 0);

        db.remove(&replica);
        assert_eq!(db.task_size(), 0);
        assert!(db.get(replica.id()).is_none());
        assert!(db.get_by_table_ids(&[101]).is_empty());
    }

    #[test]
    fn test_try_remove_purges_absent_and_returns_placed() {
        let db = db();
        let unplaced = absent(&db, 101);
        let placed = absent(&db, 102);
        db.bind_node_and_mark_scheduling(&placed, NodeId::from("node-a"));

        let detached = db.try_remove_all();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].id(), placed.id());
        assert!(db.get(unplaced.id()).is_none());
        assert!(db.get(placed.id()).is_some());
    }

    #[test]
    fn test_update_schema_id_moves_schema_index() {
        let db = db();
        let replica = absent(&db, 101);
        assert_eq!(db.get_by_schema_id(1).len(), 1);
        db.update_schema_id(101, 2);
        assert!(db.get_by_schema_id(1).is_empty());
        assert_eq!(db.get_by_schema_id(2)[0].id(), replica.id());
        assert_eq!(replica.schema_id(), 2);
    }

    #[test]
    fn test_spans_of_table_are_span_ordered() {
        let db = db();
        let spans = rivulet_common::span::evenly_split_span(&total_span(7), 3);
        for span in spans.iter().rev() {
            let replica = Arc::new(SpanReplication::new_absent(
                ChangefeedId::in_default("test"),
                1,
                span.clone(),
                1000,
            ));
            db.insert_absent(replica);
        }
        let ordered = db.spans_of_table(7);
        assert_eq!(ordered.len(), 3);
        assert_eq!(ordered[0].span(), &spans[0]);
        assert_eq!(ordered[2].span(), &spans[2]);
    }

    #[test]
    fn test_replace_with_spans() {
        let db = db();
        let replica = absent(&db, 7);
        let new_spans = rivulet_common::span::evenly_split_span(&total_span(7), 2);
        let created = db.replace_with_spans(&[replica.clone()], &new_spans, 2000);
        assert!(db.get(replica.id()).is_none());
        assert_eq!(created.len(), 2);
        assert_eq!(db.absent_size(), 2);
        assert!(created.iter().all(|r| r.checkpoint_ts() == 2000));
    }
}
