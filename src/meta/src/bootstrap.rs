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

//! Collects one bootstrap response from every alive node before a controller
//! becomes authoritative, rolling forward on node churn.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rivulet_common::NodeId;
use tracing::info;

use crate::messaging::TargetMessage;

const RESEND_INTERVAL: Duration = Duration::from_millis(500);

enum NodeState<R> {
    /// Request sent, waiting for the reply.
    Sent { last_sent: Instant },
    Responded(R),
}

pub type NewBootstrapFn = Box<dyn Fn(&NodeId) -> TargetMessage + Send>;

/// Tracks which nodes have answered the bootstrap request of one controller.
///
/// The set of tracked nodes follows the alive-nodes view: new nodes get a
/// request, removed nodes are dropped from the completion check. Completion is
/// reported exactly once, as the map of all responses.
pub struct Bootstrapper<R> {
    id: String,
    nodes: HashMap<NodeId, NodeState<R>>,
    new_bootstrap_msg: NewBootstrapFn,
    bootstrapped: bool,
}

impl<R: Clone> Bootstrapper<R> {
    pub fn new(id: impl Into<String>, new_bootstrap_msg: NewBootstrapFn) -> Self {
        Self {
            id: id.into(),
            nodes: HashMap::new(),
            new_bootstrap_msg,
            bootstrapped: false,
        }
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// The snapshot of nodes this bootstrapper currently tracks, compared
    /// against the live view to detect churn.
    pub fn get_all_nodes(&self) -> HashSet<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    /// Start tracking `nodes` and return the bootstrap requests for the ones
    /// not yet seen.
    pub fn handle_new_nodes(&mut self, nodes: Vec<NodeId>) -> Vec<TargetMessage> {
        let mut msgs = Vec::new();
        for node in nodes {
            if self.nodes.contains_key(&node) {
                continue;
            }
            msgs.push((self.new_bootstrap_msg)(&node));
            self.nodes.insert(
                node,
                NodeState::Sent {
                    last_sent: Instant::now(),
                },
            );
        }
        msgs
    }

    /// Record one response. Returns the full response map iff this response
    /// completes the bootstrap.
    pub fn handle_bootstrap_response(
        &mut self,
        from: NodeId,
        resp: R,
    ) -> Option<HashMap<NodeId, R>> {
        if !self.nodes.contains_key(&from) {
            info!(id = %self.id, node = %from, "bootstrap response from untracked node, ignore");
            return None;
        }
        self.nodes.insert(from, NodeState::Responded(resp));
        self.check_all_responded()
    }

    /// Drop removed nodes. Their response is no longer required, so removal
    /// alone can complete the bootstrap.
    pub fn handle_remove_nodes(&mut self, nodes: Vec<NodeId>) -> Option<HashMap<NodeId, R>> {
        for node in &nodes {
            self.nodes.remove(node);
        }
        self.check_all_responded()
    }

    /// Requests for every node that has not responded, rate-limited per node.
    pub fn resend_bootstrap_message(&mut self) -> Vec<TargetMessage> {
        let mut msgs = Vec::new();
        for (node, state) in &mut self.nodes {
            if let NodeState::Sent { last_sent } = state {
                if last_sent.elapsed() >= RESEND_INTERVAL {
                    msgs.push((self.new_bootstrap_msg)(node));
                    *last_sent = Instant::now();
                }
            }
        }
        msgs
    }

    fn check_all_responded(&mut self) -> Option<HashMap<NodeId, R>> {
        if self.bootstrapped || self.nodes.is_empty() {
            return None;
        }
        let all = self
            .nodes
            .values()
            .all(|s| matches!(s, NodeState::Responded(_)));
        if !all {
            return None;
        }
        self.bootstrapped = true;
        Some(
            self.nodes
                .iter()
                .map(|(node, state)| {
                    let NodeState::Responded(resp) = state else {
                        unreachable!()
                    };
                    (node.clone(), resp.clone())
                })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use rivulet_pb::MaintainerCloseRequest;

    use super::*;
    use crate::messaging::MessagePayload;

    fn bootstrapper() -> Bootstrapper<u64> {
        Bootstrapper::new(
            "test",
            Box::new(|node| {
                TargetMessage::new(
                    node.clone(),
                    // Payload type is irrelevant to the bookkeeping.
                    MessagePayload::MaintainerCloseRequest(MaintainerCloseRequest {
                        changefeed_id: "default/test".into(),
                    }),
                )
            }),
        )
    }

    #[test]
    fn test_completes_when_all_nodes_respond() {
        let mut b = bootstrapper();
        let a = NodeId::from("a");
        let c = NodeId::from("c");
        let msgs = b.handle_new_nodes(vec![a.clone(), c.clone()]);
        assert_eq!(msgs.len(), 2);
        // Known nodes do not get a second request.
        assert!(b.handle_new_nodes(vec![a.clone()]).is_empty());

        assert!(b.handle_bootstrap_response(a.clone(), 1).is_none());
        let all = b.handle_bootstrap_response(c.clone(), 2).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&a], 1);
        // Completion is reported once.
        assert!(b.handle_bootstrap_response(a, 3).is_none());
    }

    #[test]
    fn test_node_removal_completes_bootstrap() {
        let mut b = bootstrapper();
        let a = NodeId::from("a");
        let c = NodeId::from("c");
        b.handle_new_nodes(vec![a.clone(), c.clone()]);
        assert!(b.handle_bootstrap_response(a, 1).is_none());
        let all = b.handle_remove_nodes(vec![c]).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_response_from_untracked_node_is_ignored() {
        let mut b = bootstrapper();
        b.handle_new_nodes(vec![NodeId::from("a")]);
        assert!(b
            .handle_bootstrap_response(NodeId::from("stranger"), 9)
            .is_none());
        assert!(!b.bootstrapped());
    }
}
