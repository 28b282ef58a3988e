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

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rivulet_common::{DispatcherId, NodeId};
use rivulet_pb::{ComponentState, TableSpan, TableSpanStatus};

use super::Operator;
use crate::maintainer::replica::{ReplicationDb, SpanReplication};
use crate::messaging::TargetMessage;

/// State shared between the primary merge-split operator and its
/// secondaries. The primary replaces the whole group once every member has
/// drained; secondaries finish when that happens.
pub struct MergeSplitContext {
    primary: DispatcherId,
    affected: Vec<Arc<SpanReplication>>,
    new_spans: Vec<TableSpan>,
    stopped: Mutex<HashSet<DispatcherId>>,
    done: AtomicBool,
}

impl MergeSplitContext {
    pub fn new(
        primary: DispatcherId,
        affected: Vec<Arc<SpanReplication>>,
        new_spans: Vec<TableSpan>,
    ) -> Arc<Self> {
        Arc::new(Self {
            primary,
            affected,
            new_spans,
            stopped: Mutex::new(HashSet::new()),
            done: AtomicBool::new(false),
        })
    }

    fn all_stopped(&self) -> bool {
        self.stopped.lock().len() == self.affected.len()
    }
}

/// One member of a merge/split group.
///
/// Merge: many affected replicas, one new span. Split: one affected replica,
/// many new spans. Merge-split: both greater than one.
pub struct MergeSplitDispatcherOperator {
    replica: Arc<SpanReplication>,
    ctx: Arc<MergeSplitContext>,
    db: Arc<ReplicationDb>,
    taken_over: AtomicBool,
}

impl MergeSplitDispatcherOperator {
    pub fn new(
        db: Arc<ReplicationDb>,
        replica: Arc<SpanReplication>,
        ctx: Arc<MergeSplitContext>,
    ) -> Self {
        Self {
            replica,
            ctx,
            db,
            taken_over: AtomicBool::new(false),
        }
    }

    fn is_primary(&self) -> bool {
        self.replica.id() == self.ctx.primary
    }

    fn own_stopped(&self) -> bool {
        self.ctx.stopped.lock().contains(&self.replica.id())
    }
}

impl Operator for MergeSplitDispatcherOperator {
    fn id(&self) -> DispatcherId {
        self.replica.id()
    }

    fn op_type(&self) -> &'static str {
        "merge-split"
    }

    fn start(&self) {
        self.db.mark_scheduling(&self.replica);
    }

    fn schedule(&self) -> Option<TargetMessage> {
        if self.own_stopped() {
            return None;
        }
        let node = self.replica.node()?;
        Some(self.replica.new_remove_dispatcher_message(&node))
    }

    fn check(&self, from: &NodeId, status: &TableSpanStatus) {
        if Some(from) == self.replica.node().as_ref()
            && status.component_status() == ComponentState::Stopped
        {
            self.replica.update_status(status);
            self.ctx.stopped.lock().insert(self.replica.id());
        }
    }

    fn on_node_removed(&self, node: &NodeId) {
        if Some(node) == self.replica.node().as_ref() {
            self.ctx.stopped.lock().insert(self.replica.id());
        }
    }

    fn on_task_removed(&self) {
        self.taken_over.store(true, Ordering::Release);
        // Unblock the rest of the group.
        self.ctx.stopped.lock().insert(self.replica.id());
    }

    fn is_finished(&self) -> bool {
        if self.taken_over.load(Ordering::Acquire) {
            return true;
        }
        if self.is_primary() {
            self.ctx.all_stopped()
        } else {
            self.ctx.done.load(Ordering::Acquire)
        }
    }

    fn post_finish(&self) {
        if self.taken_over.load(Ordering::Acquire) || !self.is_primary() {
            return;
        }
        // The merged spans restart from the least-advanced member so no
        // committed event is skipped.
        let checkpoint_ts = self
            .ctx
            .affected
            .iter()
            .map(|replica| replica.checkpoint_ts())
            .min()
            .unwrap_or_default();
        self.db
            .replace_with_spans(&self.ctx.affected, &self.ctx.new_spans, checkpoint_ts);
        self.ctx.done.store(true, Ordering::Release);
    }

    fn affected_nodes(&self) -> Vec<NodeId> {
        self.replica.node().into_iter().collect()
    }

    fn desc(&self) -> String {
        format!(
            "merge-split dispatcher {} table {} (primary {}, {} -> {})",
            self.replica.id(),
            self.replica.table_id(),
            self.ctx.primary,
            self.ctx.affected.len(),
            self.ctx.new_spans.len()
        )
    }
}
