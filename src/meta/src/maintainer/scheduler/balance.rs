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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rivulet_common::NodeId;
use tracing::info;

use super::Scheduler;
use crate::maintainer::operator::{MoveDispatcherOperator, OperatorController};
use crate::maintainer::replica::ReplicationDb;
use crate::manager::NodeManager;

/// Evens out the replicating replica count across nodes, one batch of moves
/// at a time. Only acts when the cluster is quiet: nothing absent, nothing
/// scheduling, no operators in flight.
pub struct BalanceScheduler {
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    node_manager: Arc<NodeManager>,
    batch_size: usize,
    check_interval: Duration,
    last_check: Mutex<Instant>,
}

impl BalanceScheduler {
    pub fn new(
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        node_manager: Arc<NodeManager>,
        batch_size: usize,
        check_interval: Duration,
    ) -> Self {
        Self {
            db,
            operator_controller,
            node_manager,
            batch_size,
            check_interval,
            last_check: Mutex::new(Instant::now() - check_interval),
        }
    }
}

impl Scheduler for BalanceScheduler {
    fn name(&self) -> &'static str {
        "balance-scheduler"
    }

    fn schedule(&self) {
        if self.operator_controller.operator_size() > 0
            || self.db.absent_size() > 0
            || self.db.scheduling_size() > 0
        {
            return;
        }
        {
            let mut last_check = self.last_check.lock();
            if last_check.elapsed() < self.check_interval {
                return;
            }
            *last_check = Instant::now();
        }

        let mut counts: HashMap<NodeId, usize> = self
            .node_manager
            .get_alive_nodes()
            .into_keys()
            .map(|node| (node, 0))
            .collect();
        if counts.len() < 2 {
            return;
        }
        for (node, count) in self.db.replicating_counts_by_node() {
            // Replicas on a node that just left are handled by the node-gone
            // path, not by balancing.
            if let Some(entry) = counts.get_mut(&node) {
                *entry = count;
            }
        }

        let mut moved = 0;
        while moved < self.batch_size {
            // Ties break on node id, keeping the pass deterministic.
            let (max_node, max_count) = counts
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
                .map(|(node, count)| (node.clone(), *count))
                .unwrap();
            let (min_node, min_count) = counts
                .iter()
                .min_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(b.0)))
                .map(|(node, count)| (node.clone(), *count))
                .unwrap();
            if max_count - min_count <= 1 {
                break;
            }
            // Stable choice: the smallest dispatcher id on the loaded node
            // that is not already being driven.
            let Some(replica) = self
                .db
                .get_by_node(&max_node)
                .into_iter()
                .find(|replica| {
                    self.operator_controller.get_operator(replica.id()).is_none()
                })
            else {
                break;
            };
            info!(
                dispatcher = %replica.id(),
                from = %max_node,
                to = %min_node,
                "balance: move replica"
            );
            if !self
                .operator_controller
                .add_operator(Arc::new(MoveDispatcherOperator::new(
                    self.db.clone(),
                    replica,
                    max_node.clone(),
                    min_node.clone(),
                )))
            {
                break;
            }
            *counts.get_mut(&max_node).unwrap() -= 1;
            *counts.get_mut(&min_node).unwrap() += 1;
            moved += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use rivulet_common::span::total_span;
    use rivulet_common::ChangefeedId;
    use rivulet_pb::{ComponentState, TableSpanStatus};

    use super::*;
    use crate::maintainer::operator::OperatorController;
    use crate::maintainer::replica::SpanReplication;
    use crate::manager::{Env, NodeInfo};

    #[test]
    fn test_balance_moves_until_even() {
        let changefeed_id = ChangefeedId::in_default("balance-test");
        let (env, _mc) = Env::for_test(NodeId::from("node-a"));
        for node in ["node-a", "node-b"] {
            env.node_manager
                .register_node(NodeInfo::new(NodeId::from(node), "127.0.0.1:8300"));
        }
        let db = Arc::new(ReplicationDb::new(changefeed_id.clone()));
        let controller = Arc::new(OperatorController::new(
            changefeed_id.clone(),
            db.clone(),
            env.node_manager.clone(),
            env.message_center.clone(),
            env.metrics.clone(),
            16,
        ));
        let node_a = NodeId::from("node-a");
        let node_b = NodeId::from("node-b");
        let mut replicas = Vec::new();
        for table_id in [101, 102, 103, 104] {
            let replica = Arc::new(SpanReplication::new_absent(
                changefeed_id.clone(),
                1,
                total_span(table_id),
                1000,
            ));
            db.insert_absent(replica.clone());
            db.bind_node_and_mark_scheduling(&replica, node_a.clone());
            db.mark_replicating(&replica);
            replicas.push(replica);
        }

        let scheduler = BalanceScheduler::new(
            db.clone(),
            controller.clone(),
            env.node_manager.clone(),
            16,
            Duration::ZERO,
        );
        scheduler.schedule();
        assert_eq!(controller.operator_size(), 2);
        // With moves in flight, a second pass stays quiet.
        scheduler.schedule();
        assert_eq!(controller.operator_size(), 2);

        // Drain on the origin, then come up on the destination.
        controller.execute();
        for replica in &replicas {
            if controller.get_operator(replica.id()).is_none() {
                continue;
            }
            controller.update_operator_status(
                replica.id(),
                &node_a,
                &TableSpanStatus {
                    id: replica.id().to_pb(),
                    component_status: ComponentState::Stopped as i32,
                    checkpoint_ts: 1200,
                    event_size_per_second: 0.0,
                },
            );
            controller.update_operator_status(
                replica.id(),
                &node_b,
                &TableSpanStatus {
                    id: replica.id().to_pb(),
                    component_status: ComponentState::Working as i32,
                    checkpoint_ts: 1200,
                    event_size_per_second: 0.0,
                },
            );
        }
        controller.execute();
        assert_eq!(controller.operator_size(), 0);
        let counts = db.replicating_counts_by_node();
        assert_eq!(counts[&node_a], 2);
        assert_eq!(counts[&node_b], 2);
    }
}
