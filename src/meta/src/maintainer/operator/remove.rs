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

/// Tear down one replica wherever it currently lives.
pub struct RemoveDispatcherOperator {
    replica: Arc<SpanReplication>,
    db: Arc<ReplicationDb>,
    finished: AtomicBool,
    taken_over: AtomicBool,
}

impl RemoveDispatcherOperator {
    pub fn new(db: Arc<ReplicationDb>, replica: Arc<SpanReplication>) -> Self {
        Self {
            replica,
            db,
            finished: AtomicBool::new(false),
            taken_over: AtomicBool::new(false),
        }
    }
}

impl Operator for RemoveDispatcherOperator {
    fn id(&self) -> DispatcherId {
        self.replica.id()
    }

    fn op_type(&self) -> &'static str {
        "remove"
    }

    fn start(&self) {
        self.db.mark_scheduling(&self.replica);
    }

    fn schedule(&self) -> Option<TargetMessage> {
        if self.finished.load(Ordering::Acquire) {
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
            self.finished.store(true, Ordering::Release);
        }
    }

    fn on_node_removed(&self, node: &NodeId) {
        // The dispatcher died with its node; nothing left to remove.
        if Some(node) == self.replica.node().as_ref() {
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
        self.db.remove(&self.replica);
    }

    fn affected_nodes(&self) -> Vec<NodeId> {
        self.replica.node().into_iter().collect()
    }

    fn desc(&self) -> String {
        format!(
            "remove dispatcher {} table {} from node {:?}",
            self.replica.id(),
            self.replica.table_id(),
            self.replica.node()
        )
    }
}
