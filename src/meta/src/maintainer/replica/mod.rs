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

mod replication_db;

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;
pub use replication_db::{ReplicaState, ReplicationDb};
use rivulet_common::{ChangefeedId, DispatcherId, NodeId, Ts};
use rivulet_pb::{
    ComponentState, DispatcherConfig, ScheduleAction, ScheduleDispatcherRequest, TableSpan,
    TableSpanStatus,
};

use crate::messaging::{MessagePayload, TargetMessage};

/// The scheduler's unit: one dispatcher replica covering one table span.
///
/// Identity and span are immutable. Placement and progress are mutated by the
/// [`ReplicationDb`] and the operators, which run concurrently with the
/// maintainer loop.
pub struct SpanReplication {
    id: DispatcherId,
    changefeed_id: ChangefeedId,
    span: TableSpan,
    schema_id: AtomicI64,
    node: RwLock<Option<NodeId>>,
    checkpoint_ts: AtomicU64,
    component_status: AtomicI32,
    /// f32 bits of the measured sink traffic.
    event_size_per_second: AtomicU32,
}

impl SpanReplication {
    /// A replica for a span nobody owns yet.
    pub fn new_absent(
        changefeed_id: ChangefeedId,
        schema_id: i64,
        span: TableSpan,
        checkpoint_ts: Ts,
    ) -> Self {
        Self {
            id: DispatcherId::new(),
            changefeed_id,
            span,
            schema_id: AtomicI64::new(schema_id),
            node: RwLock::new(None),
            checkpoint_ts: AtomicU64::new(checkpoint_ts),
            component_status: AtomicI32::new(ComponentState::Absent as i32),
            event_size_per_second: AtomicU32::new(0),
        }
    }

    /// A replica reported by a remote node during bootstrap; it keeps the
    /// dispatcher id the node already runs.
    pub fn new_working(
        changefeed_id: ChangefeedId,
        id: DispatcherId,
        schema_id: i64,
        span: TableSpan,
        checkpoint_ts: Ts,
        component_status: ComponentState,
        node: NodeId,
    ) -> Self {
        Self {
            id,
            changefeed_id,
            span,
            schema_id: AtomicI64::new(schema_id),
            node: RwLock::new(Some(node)),
            checkpoint_ts: AtomicU64::new(checkpoint_ts),
            component_status: AtomicI32::new(component_status as i32),
            event_size_per_second: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> DispatcherId {
        self.id
    }

    pub fn changefeed_id(&self) -> &ChangefeedId {
        &self.changefeed_id
    }

    pub fn span(&self) -> &TableSpan {
        &self.span
    }

    pub fn table_id(&self) -> i64 {
        self.span.table_id
    }

    pub fn schema_id(&self) -> i64 {
        self.schema_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_schema_id(&self, schema_id: i64) {
        self.schema_id.store(schema_id, Ordering::Release);
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node.read().clone()
    }

    pub(crate) fn set_node(&self, node: Option<NodeId>) {
        *self.node.write() = node;
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.checkpoint_ts.load(Ordering::Acquire)
    }

    pub fn component_status(&self) -> ComponentState {
        ComponentState::try_from(self.component_status.load(Ordering::Acquire))
            .unwrap_or(ComponentState::Absent)
    }

    pub fn event_size_per_second(&self) -> f32 {
        f32::from_bits(self.event_size_per_second.load(Ordering::Acquire))
    }

    /// Fold in one reported status. The checkpoint only moves forward.
    pub fn update_status(&self, status: &TableSpanStatus) {
        if status.checkpoint_ts > 0 {
            self.checkpoint_ts
                .fetch_max(status.checkpoint_ts, Ordering::AcqRel);
        }
        self.component_status
            .store(status.component_status, Ordering::Release);
        self.event_size_per_second
            .store(status.event_size_per_second.to_bits(), Ordering::Release);
    }

    pub fn new_add_dispatcher_message(&self, node: &NodeId) -> TargetMessage {
        TargetMessage::new(
            node.clone(),
            MessagePayload::ScheduleDispatcher(ScheduleDispatcherRequest {
                changefeed_id: self.changefeed_id.to_pb(),
                config: Some(DispatcherConfig {
                    dispatcher_id: self.id.to_pb(),
                    span: Some(self.span.clone()),
                    schema_id: self.schema_id(),
                    start_ts: self.checkpoint_ts(),
                }),
                schedule_action: ScheduleAction::Create as i32,
            }),
        )
    }

    pub fn new_remove_dispatcher_message(&self, node: &NodeId) -> TargetMessage {
        TargetMessage::new(
            node.clone(),
            MessagePayload::ScheduleDispatcher(ScheduleDispatcherRequest {
                changefeed_id: self.changefeed_id.to_pb(),
                config: Some(DispatcherConfig {
                    dispatcher_id: self.id.to_pb(),
                    span: Some(self.span.clone()),
                    schema_id: self.schema_id(),
                    start_ts: 0,
                }),
                schedule_action: ScheduleAction::Remove as i32,
            }),
        )
    }
}

impl std::fmt::Debug for SpanReplication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanReplication")
            .field("id", &self.id)
            .field("table_id", &self.span.table_id)
            .field("node", &self.node())
            .field("checkpoint_ts", &self.checkpoint_ts())
            .finish()
    }
}
