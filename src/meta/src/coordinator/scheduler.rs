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

//! The cluster-level scheduler that places maintainers themselves. Same
//! basic-filler algorithm as the span scheduler, over changefeeds instead of
//! spans, through the shared round-robin core.

use std::collections::{HashMap, HashSet};

use rivulet_common::{ChangefeedId, NodeId};
use tracing::{info, warn};

use super::{SchedulerStatus, StateMachine};
use crate::maintainer::scheduler::{round_robin_pairs, stray_keys};

/// A scheduling decision over one changefeed's maintainer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleTask {
    AddMaintainer {
        id: ChangefeedId,
        node: NodeId,
    },
    MoveMaintainer {
        id: ChangefeedId,
        origin: NodeId,
        dest: NodeId,
    },
    RemoveMaintainer {
        id: ChangefeedId,
        node: NodeId,
    },
}

pub struct BasicScheduler {
    batch_size: usize,
}

impl BasicScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    pub fn name(&self) -> &'static str {
        "basic-scheduler"
    }

    /// Place every changefeed without a running maintainer and tear down
    /// state machines whose changefeed no longer exists.
    pub fn schedule(
        &self,
        all_changefeeds: &[ChangefeedId],
        alive_nodes: &[NodeId],
        state_machines: &HashMap<ChangefeedId, StateMachine>,
    ) -> Vec<ScheduleTask> {
        let mut tasks = Vec::new();

        let mut unplaced = Vec::new();
        for id in all_changefeeds {
            if unplaced.len() >= self.batch_size {
                break;
            }
            match state_machines.get(id) {
                None => unplaced.push(id.clone()),
                Some(machine) if machine.state == SchedulerStatus::Absent => {
                    unplaced.push(id.clone())
                }
                Some(_) => {}
            }
        }
        if !unplaced.is_empty() {
            if alive_nodes.is_empty() {
                warn!("cannot find alive node to place maintainers");
                return tasks;
            }
            let mut nodes = alive_nodes.to_vec();
            nodes.sort();
            for (id, node) in round_robin_pairs(unplaced, &nodes) {
                info!(changefeed = %id, %node, "burst add maintainer");
                tasks.push(ScheduleTask::AddMaintainer { id, node });
            }
        }

        let target: HashSet<ChangefeedId> = all_changefeeds.iter().cloned().collect();
        for id in stray_keys(&target, state_machines.keys().cloned()) {
            let machine = &state_machines[&id];
            let Some(node) = machine.primary.clone() else {
                warn!(
                    changefeed = %id,
                    "primary not found for removed changefeed, wait for heartbeat"
                );
                continue;
            };
            info!(changefeed = %id, %node, "burst remove maintainer");
            tasks.push(ScheduleTask::RemoveMaintainer { id, node });
        }
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(state: SchedulerStatus, primary: Option<&str>) -> StateMachine {
        StateMachine {
            state,
            primary: primary.map(NodeId::from),
            checkpoint_ts: 0,
        }
    }

    #[test]
    fn test_round_robin_placement_of_missing_changefeeds() {
        let scheduler = BasicScheduler::new(10);
        let feeds: Vec<ChangefeedId> = (1..=3)
            .map(|idx| ChangefeedId::in_default(format!("feed-{idx}")))
            .collect();
        let nodes = vec![NodeId::from("node-a"), NodeId::from("node-b")];
        let mut machines = HashMap::new();
        machines.insert(
            feeds[1].clone(),
            machine(SchedulerStatus::Working, Some("node-a")),
        );

        let tasks = scheduler.schedule(&feeds, &nodes, &machines);
        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0],
            ScheduleTask::AddMaintainer {
                id: feeds[0].clone(),
                node: NodeId::from("node-a"),
            }
        );
        assert_eq!(
            tasks[1],
            ScheduleTask::AddMaintainer {
                id: feeds[2].clone(),
                node: NodeId::from("node-b"),
            }
        );
    }

    #[test]
    fn test_stray_state_machines_are_removed() {
        let scheduler = BasicScheduler::new(10);
        let feeds = vec![ChangefeedId::in_default("keep")];
        let nodes = vec![NodeId::from("node-a")];
        let mut machines = HashMap::new();
        machines.insert(
            feeds[0].clone(),
            machine(SchedulerStatus::Working, Some("node-a")),
        );
        machines.insert(
            ChangefeedId::in_default("gone"),
            machine(SchedulerStatus::Working, Some("node-b")),
        );
        machines.insert(
            ChangefeedId::in_default("gone-unplaced"),
            machine(SchedulerStatus::Absent, None),
        );

        let tasks = scheduler.schedule(&feeds, &nodes, &machines);
        // The placed stray gets a remove; the unplaced one waits.
        assert_eq!(
            tasks,
            vec![ScheduleTask::RemoveMaintainer {
                id: ChangefeedId::in_default("gone"),
                node: NodeId::from("node-b"),
            }]
        );
    }

    #[test]
    fn test_batch_bounds_additions() {
        let scheduler = BasicScheduler::new(1);
        let feeds: Vec<ChangefeedId> = (1..=3)
            .map(|idx| ChangefeedId::in_default(format!("feed-{idx}")))
            .collect();
        let nodes = vec![NodeId::from("node-a")];
        let tasks = scheduler.schedule(&feeds, &nodes, &HashMap::new());
        assert_eq!(tasks.len(), 1);
    }
}
