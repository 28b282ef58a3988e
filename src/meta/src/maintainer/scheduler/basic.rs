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
use std::hash::Hash;
use std::sync::Arc;

use itertools::Itertools;
use tracing::warn;

use super::Scheduler;
use crate::maintainer::operator::{AddDispatcherOperator, OperatorController};
use crate::maintainer::replica::ReplicationDb;
use crate::manager::NodeManager;

/// Assign `items` to `captures` round-robin, in input order. The shared core
/// of the span scheduler and the coordinator's changefeed scheduler.
pub fn round_robin_pairs<T, N: Clone>(items: Vec<T>, captures: &[N]) -> Vec<(T, N)> {
    if captures.is_empty() {
        return Vec::new();
    }
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| (item, captures[idx % captures.len()].clone()))
        .collect()
}

/// Keys of `current` that are no longer in `target`: the entries a basic
/// scheduler must remove.
pub fn stray_keys<K: Eq + Hash + Clone>(
    target: &HashSet<K>,
    current: impl Iterator<Item = K>,
) -> Vec<K> {
    current.filter(|key| !target.contains(key)).collect()
}

/// Fills the cluster: places up to `add_batch_size` absent replicas per tick,
/// round-robin over the alive nodes.
pub struct BasicScheduler {
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    node_manager: Arc<NodeManager>,
    add_batch_size: usize,
}

impl BasicScheduler {
    pub fn new(
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        node_manager: Arc<NodeManager>,
        add_batch_size: usize,
    ) -> Self {
        Self {
            db,
            operator_controller,
            node_manager,
            add_batch_size,
        }
    }
}

impl Scheduler for BasicScheduler {
    fn name(&self) -> &'static str {
        "basic-scheduler"
    }

    fn schedule(&self) {
        let absent = self.db.get_absent_batch(self.add_batch_size);
        if absent.is_empty() {
            return;
        }
        let mut nodes = self.node_manager.get_alive_nodes().into_keys().collect_vec();
        if nodes.is_empty() {
            warn!("cannot find alive node to place absent replicas");
            return;
        }
        nodes.sort();
        for (replica, node) in round_robin_pairs(absent, &nodes) {
            self.operator_controller
                .add_operator(Arc::new(AddDispatcherOperator::new(
                    self.db.clone(),
                    replica,
                    node,
                )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_pairs() {
        let pairs = round_robin_pairs(vec![1, 2, 3, 4, 5], &["a", "b"]);
        assert_eq!(
            pairs,
            vec![(1, "a"), (2, "b"), (3, "a"), (4, "b"), (5, "a")]
        );
        assert!(round_robin_pairs::<i32, &str>(vec![1], &[]).is_empty());
    }

    #[test]
    fn test_stray_keys() {
        let target: HashSet<i32> = [1, 2].into_iter().collect();
        let mut strays = stray_keys(&target, vec![1, 2, 3, 4].into_iter());
        strays.sort();
        assert_eq!(strays, vec![3, 4]);
    }
}
