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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rivulet_common::{DispatcherId, NodeId};
use rivulet_pb::{ComponentState, TableSpanStatus};

use super::Operator;
use crate::maintainer::replica::{ReplicationDb, SpanReplication};
use crate::messaging::TargetMessage;

/// Place one absent replica on `dest`.
///
/// ```text
/// Start -> create rpc -> remote Working -> Finished (replica replicating)
///             |
///             +-- dest removed -> Finished (replica back to absent)
/// ```
pub struct AddDispatcherOperator {
    replica: Arc<SpanReplication>,
    dest: NodeId,
    db: Arc<ReplicationDb>,
    finished: AtomicBool,
    canceled: AtomicBool,
    taken_over: AtomicBool,
}

impl AddDispatcherOperator {
    pub fn new(db: Arc<ReplicationDb>, replica: Arc<SpanReplication>, dest: NodeId) -> Self {
        Self {
            replica,
            dest,
            db,
            finished: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            taken_over: AtomicBool::new(false),
        }
    }
}

impl Operator for AddDispatcherOperator {
    fn id(&self) -> DispatcherId {
        self.replica.id()
    }

    fn op_type(&self) -> &'static str {
        "add"
    }

    fn start(&self) {
        self.db
            .bind_node_and_mark_scheduling(&self.replica, self.dest.clone());
    }

    fn schedule(&self) -> Option<TargetMessage> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        Some(self.replica.new_add_dispatcher_message(&self.dest))
    }

    fn check(&self, from: &NodeId, status: &TableSpanStatus) {
        if from == &self.dest && status.component_status() == ComponentState::Working {
            self.replica.update_status(status);
            self.finished.store(true, Ordering::Release);
        }
    }

    fn on_node_removed(&self, node: &NodeId) {
        if node == &self.dest {
            self.canceled.store(true, Ordering::Release);
            self.finished.store(true, Ordering::Release);
        }
    }

    fn on_task_removed(&self) {
        self.taken_over.store(true, Ordering::Release);
        self.finished.store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn post_finish(&self) {
        if self.taken_over.load(Ordering::Acquire) {
            return;
        }
        if self.canceled.load(Ordering::Acquire) {
            self.db.mark_absent(&self.replica);
        } else {
            self.db.mark_replicating(&self.replica);
        }
    }

    fn affected_nodes(&self) -> Vec<NodeId> {
        vec![self.dest.clone()]
    }

    fn desc(&self) -> String {
        format!(
            "add dispatcher {} table {} to node {}",
            self.replica.id(),
            self.replica.table_id(),
            self.dest
        )
    }
}
