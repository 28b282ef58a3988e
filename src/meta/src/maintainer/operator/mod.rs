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

//! Scheduling operators: small state machines that drive exactly one replica
//! to a target placement, re-emitting their RPC until the dispatcher reports
//! the transition.

mod add;
mod controller;
mod merge_split;
mod move_op;
mod remove;
mod split;

pub use add::AddDispatcherOperator;
pub use controller::OperatorController;
pub use merge_split::MergeSplitDispatcherOperator;
pub use move_op::MoveDispatcherOperator;
pub use remove::RemoveDispatcherOperator;
use rivulet_common::{DispatcherId, NodeId};
use rivulet_pb::TableSpanStatus;
pub use split::SplitDispatcherOperator;

use crate::messaging::TargetMessage;

/// One scheduling task attached to exactly one replica. All methods take
/// `&self`: operators run both on the executor task and on the maintainer
/// loop, and keep their state in atomics.
pub trait Operator: Send + Sync {
    /// The replica this operator drives; also the operator's identity.
    fn id(&self) -> DispatcherId;

    fn op_type(&self) -> &'static str;

    /// Called once when the controller accepts the operator.
    fn start(&self);

    /// The outbound message to (re-)send, or `None` when there is nothing
    /// left to ask of the remote side.
    fn schedule(&self) -> Option<TargetMessage>;

    /// Feed one reported dispatcher status into the state machine.
    fn check(&self, from: &NodeId, status: &TableSpanStatus);

    /// A node left the cluster; fail fast if it was involved.
    fn on_node_removed(&self, node: &NodeId);

    /// The controller replaced this operator; suppress any further state
    /// transitions in `post_finish`.
    fn on_task_removed(&self);

    fn is_finished(&self) -> bool;

    /// Runs exactly once after `is_finished`, applying the final replica
    /// transition.
    fn post_finish(&self);

    /// Nodes whose departure this operator must hear about.
    fn affected_nodes(&self) -> Vec<NodeId>;

    fn desc(&self) -> String;
}
