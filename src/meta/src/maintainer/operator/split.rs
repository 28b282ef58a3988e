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
use rivulet_pb::{ComponentState, TableSpan, TableSpanStatus};

use super::Operator;
use crate::maintainer::replica::{ReplicationDb, SpanReplication};
use crate::messaging::TargetMessage;

/// Drain one overloaded replica on its node and replace it with absent
/// replicas covering `new_spans`; the basic scheduler then places them.
pub struct SplitDispatcherOperator {
    replica: Arc<SpanReplication>,
    origin: NodeId,
    new_spans: Vec<TableSpan>,
    db: Arc<ReplicationDb>,
    finished: AtomicBool,
    taken_over: AtomicBool,
}

impl SplitDispatcherOperator {
    pub fn new(
        db: Arc<ReplicationDb>,
        replica: Arc<SpanReplication>,
        origin: NodeId,
        new_spans: Vec<TableSpan>,
    ) -> Self {
        Self {
            replica,
            origin,
            new_spans,
            db,
            finished: AtomicBool::new(false),
            taken_over: AtomicBool::new(false),
        }
    }
}

impl Operator for SplitDispatcherOperator {
    fn id(&self) -> DispatcherId {
        self.replica.id()
    }

    fn op_type(&self) -> &'static str {
        "split"
    }

    fn start(&self) {
        self.db.mark_scheduling(&self.replica);
    }

    fn schedule(&self) -> Option<TargetMessage> {
        if self.finished.load(Ordering::Acquire) {
            return None;
        }
        Some(self.replica.new_remove_dispatcher_message(&self.origin))
    }

    fn check(&self, from: &NodeId, status: &TableSpanStatus) {
        if from == &self.origin && status.component_status() == ComponentState::Stopped {
            self.replica.update_status(status);
            self.finished.store(true, Ordering::Release);
        }
    }

    fn on_node_removed(&self, node: &NodeId) {
        if node == &self.origin {
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
        self.db.replace_with_spans(
            std::slice::from_ref(&self.replica),
            &self.new_spans,
            self.replica.checkpoint_ts(),
        );
    }

    fn affected_nodes(&self) -> Vec<NodeId> {
        vec![self.origin.clone()]
    }

    fn desc(&self) -> String {
        format!(
            "split dispatcher {} table {} on {} into {} spans",
            self.replica.id(),
            self.replica.table_id(),
            self.origin,
            self.new_spans.len()
        )
    }
}
