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

//! The outbound messaging seam. The wire transport lives outside this
//! workspace; the control plane only needs a non-blocking `send`.

use parking_lot::Mutex;
use rivulet_common::NodeId;
use rivulet_pb::{
    BlockStatusRequest, CheckpointTsMessage, DispatcherStatus, HeartBeatRequest,
    MaintainerBootstrapRequest, MaintainerBootstrapResponse, MaintainerCloseRequest,
    MaintainerCloseResponse, MaintainerStatus, RemoveMaintainerRequest, ScheduleDispatcherRequest,
};

use crate::MetaResult;

#[derive(Clone, PartialEq)]
pub enum MessagePayload {
    HeartBeat(HeartBeatRequest),
    BlockStatus(BlockStatusRequest),
    MaintainerBootstrapRequest(MaintainerBootstrapRequest),
    MaintainerBootstrapResponse(MaintainerBootstrapResponse),
    MaintainerCloseRequest(MaintainerCloseRequest),
    MaintainerCloseResponse(MaintainerCloseResponse),
    RemoveMaintainerRequest(RemoveMaintainerRequest),
    CheckpointTs(CheckpointTsMessage),
    DispatcherStatus(DispatcherStatus),
    ScheduleDispatcher(ScheduleDispatcherRequest),
    MaintainerStatus(MaintainerStatus),
}

impl MessagePayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessagePayload::HeartBeat(_) => "HeartBeatRequest",
            MessagePayload::BlockStatus(_) => "BlockStatusRequest",
            MessagePayload::MaintainerBootstrapRequest(_) => "MaintainerBootstrapRequest",
            MessagePayload::MaintainerBootstrapResponse(_) => "MaintainerBootstrapResponse",
            MessagePayload::MaintainerCloseRequest(_) => "MaintainerCloseRequest",
            MessagePayload::MaintainerCloseResponse(_) => "MaintainerCloseResponse",
            MessagePayload::RemoveMaintainerRequest(_) => "RemoveMaintainerRequest",
            MessagePayload::CheckpointTs(_) => "CheckpointTsMessage",
            MessagePayload::DispatcherStatus(_) => "DispatcherStatus",
            MessagePayload::ScheduleDispatcher(_) => "ScheduleDispatcherRequest",
            MessagePayload::MaintainerStatus(_) => "MaintainerStatus",
        }
    }
}

impl std::fmt::Debug for MessagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A message addressed to one node.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetMessage {
    pub target: NodeId,
    pub payload: MessagePayload,
}

impl TargetMessage {
    pub fn new(target: NodeId, payload: MessagePayload) -> Self {
        Self { target, payload }
    }
}

/// An inbound message, tagged with the node that sent it.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub from: NodeId,
    pub payload: MessagePayload,
}

/// Fire-and-forget message egress. Must not block: callers run on the
/// single-threaded maintainer loop.
pub trait MessageCenter: Send + Sync {
    fn send(&self, msg: TargetMessage) -> MetaResult<()>;
}

/// Buffers every sent message; the test double for RPC capture, also usable
/// as a local in-process transport.
#[derive(Default)]
pub struct CollectingMessageCenter {
    sent: Mutex<Vec<TargetMessage>>,
}

impl CollectingMessageCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything sent since the last call.
    pub fn take(&self) -> Vec<TargetMessage> {
        std::mem::take(&mut self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl MessageCenter for CollectingMessageCenter {
    fn send(&self, msg: TargetMessage) -> MetaResult<()> {
        self.sent.lock().push(msg);
        Ok(())
    }
}
