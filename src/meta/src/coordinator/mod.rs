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

//! The cluster-wide coordinator: owns the changefeed set, elects one
//! maintainer per changefeed on some node and routes admin commands. Elected
//! through the external election service; only its interface to the
//! maintainers lives here.

mod scheduler;

use std::collections::HashMap;

use itertools::Itertools;
use rivulet_common::config::ChangefeedConfig;
use rivulet_common::filter::Filter;
use rivulet_common::{ChangefeedId, NodeId, Ts};
use rivulet_pb::{ComponentState, MaintainerStatus, RemoveMaintainerRequest};
pub use scheduler::{BasicScheduler, ScheduleTask};
use tracing::{info, warn};

use crate::manager::Env;
use crate::messaging::{MessagePayload, TargetMessage};
use crate::{MetaError, MetaResult};

/// Scheduler-side state of one changefeed's maintainer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// No maintainer placed.
    Absent,
    /// Placement sent, waiting for the maintainer to report.
    Commit,
    Working,
    Removing,
}

#[derive(Clone, Debug)]
pub struct StateMachine {
    pub state: SchedulerStatus,
    pub primary: Option<NodeId>,
    pub checkpoint_ts: Ts,
}

/// User-facing lifecycle of a changefeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedState {
    Normal,
    Paused,
    Warning,
    Failed,
    Removed,
}

struct Changefeed {
    config: ChangefeedConfig,
    feed_state: FeedState,
    checkpoint_ts: Ts,
}

/// Launches maintainers on nodes. The RPC that carries the placement is
/// outside this workspace; the server wires this to its transport.
pub trait MaintainerLauncher: Send + Sync {
    fn launch(&self, node: &NodeId, config: &ChangefeedConfig, checkpoint_ts: Ts);
}

pub struct Coordinator {
    env: Env,
    launcher: Box<dyn MaintainerLauncher>,
    scheduler: BasicScheduler,
    changefeeds: HashMap<ChangefeedId, Changefeed>,
    state_machines: HashMap<ChangefeedId, StateMachine>,
}

impl Coordinator {
    pub fn new(env: Env, launcher: Box<dyn MaintainerLauncher>, batch_size: usize) -> Self {
        Self {
            env,
            launcher,
            scheduler: BasicScheduler::new(batch_size),
            changefeeds: HashMap::new(),
            state_machines: HashMap::new(),
        }
    }

    /// Admin: create a changefeed. Config errors fail fast and are never
    /// retried.
    pub fn create_changefeed(&mut self, config: ChangefeedConfig) -> MetaResult<()> {
        let id = config.changefeed_id();
        if self.changefeeds.contains_key(&id) {
            return Err(MetaError::invalid_config(format!(
                "changefeed {id} already exists"
            )));
        }
        if config.sink_uri.is_empty() {
            return Err(MetaError::invalid_config("empty sink uri"));
        }
        Filter::new(&config.filter, config.force_replicate)?;
        info!(changefeed = %id, start_ts = config.start_ts, "changefeed created");
        self.changefeeds.insert(
            id,
            Changefeed {
                checkpoint_ts: config.start_ts,
                config,
                feed_state: FeedState::Normal,
            },
        );
        Ok(())
    }

    /// Admin: remove a changefeed; `cascade` also tears down every
    /// dispatcher.
    pub fn remove_changefeed(&mut self, id: &ChangefeedId, cascade: bool) -> MetaResult<()> {
        let changefeed = self
            .changefeeds
            .get_mut(id)
            .ok_or_else(|| MetaError::invalid_config(format!("changefeed {id} not found")))?;
        changefeed.feed_state = FeedState::Removed;
        self.send_remove_maintainer(id, cascade);
        self.changefeeds.remove(id);
        Ok(())
    }

    /// Admin: stop replication but keep the changefeed definition.
    pub fn pause_changefeed(&mut self, id: &ChangefeedId) -> MetaResult<()> {
        let changefeed = self
            .changefeeds
            .get_mut(id)
            .ok_or_else(|| MetaError::invalid_config(format!("changefeed {id} not found")))?;
        changefeed.feed_state = FeedState::Paused;
        self.send_remove_maintainer(id, false);
        Ok(())
    }

    pub fn resume_changefeed(&mut self, id: &ChangefeedId) -> MetaResult<()> {
        let changefeed = self
            .changefeeds
            .get_mut(id)
            .ok_or_else(|| MetaError::invalid_config(format!("changefeed {id} not found")))?;
        if changefeed.feed_state != FeedState::Paused {
            return Err(MetaError::invalid_config(format!(
                "changefeed {id} is not paused"
            )));
        }
        changefeed.feed_state = FeedState::Normal;
        Ok(())
    }

    pub fn feed_state(&self, id: &ChangefeedId) -> Option<FeedState> {
        self.changefeeds.get(id).map(|changefeed| changefeed.feed_state)
    }

    pub fn checkpoint_ts(&self, id: &ChangefeedId) -> Option<Ts> {
        self.changefeeds.get(id).map(|changefeed| changefeed.checkpoint_ts)
    }

    /// One scheduling pass: place maintainers for schedulable changefeeds,
    /// remove stray state machines.
    pub fn schedule(&mut self) {
        let mut schedulable = self
            .changefeeds
            .iter()
            .filter(|(_, changefeed)| changefeed.feed_state == FeedState::Normal)
            .map(|(id, _)| id.clone())
            .collect_vec();
        schedulable.sort();
        let nodes = self
            .env
            .node_manager
            .get_alive_nodes()
            .into_keys()
            .collect_vec();
        let tasks = self
            .scheduler
            .schedule(&schedulable, &nodes, &self.state_machines);
        for task in tasks {
            match task {
                ScheduleTask::AddMaintainer { id, node } => {
                    let changefeed = &self.changefeeds[&id];
                    self.launcher
                        .launch(&node, &changefeed.config, changefeed.checkpoint_ts);
                    self.state_machines.insert(
                        id,
                        StateMachine {
                            state: SchedulerStatus::Commit,
                            primary: Some(node),
                            checkpoint_ts: changefeed.checkpoint_ts,
                        },
                    );
                }
                ScheduleTask::MoveMaintainer { id, origin, dest } => {
                    // Move = remove on origin, re-add on dest next pass.
                    info!(changefeed = %id, %origin, %dest, "move maintainer");
                    self.send_remove_maintainer(&id, false);
                }
                ScheduleTask::RemoveMaintainer { id, node } => {
                    self.send_message(TargetMessage::new(
                        node,
                        MessagePayload::RemoveMaintainerRequest(RemoveMaintainerRequest {
                            changefeed_id: id.to_pb(),
                            cascade: true,
                        }),
                    ));
                    if let Some(machine) = self.state_machines.get_mut(&id) {
                        machine.state = SchedulerStatus::Removing;
                    }
                }
            }
        }
    }

    /// Ingest one maintainer status report.
    pub fn handle_maintainer_status(&mut self, from: NodeId, status: MaintainerStatus) {
        let id = ChangefeedId::from_pb(&status.changefeed_id);
        let state = ComponentState::try_from(status.state).unwrap_or(ComponentState::Absent);
        if state == ComponentState::Stopped {
            if self.state_machines.remove(&id).is_none() {
                warn!(changefeed = %id, node = %from, "status for unknown maintainer");
                return;
            }
            info!(changefeed = %id, node = %from, "maintainer stopped");
        } else {
            let Some(machine) = self.state_machines.get_mut(&id) else {
                warn!(changefeed = %id, node = %from, "status for unknown maintainer");
                return;
            };
            machine.state = SchedulerStatus::Working;
            machine.primary = Some(from);
            machine.checkpoint_ts = status.checkpoint_ts;
        }
        if let Some(changefeed) = self.changefeeds.get_mut(&id) {
            changefeed.checkpoint_ts = changefeed.checkpoint_ts.max(status.checkpoint_ts);
            if changefeed.feed_state == FeedState::Normal && !status.err.is_empty() {
                changefeed.feed_state = FeedState::Failed;
                warn!(
                    changefeed = %id,
                    code = %status.err[0].code,
                    message = %status.err[0].message,
                    "changefeed failed"
                );
            } else if changefeed.feed_state == FeedState::Normal && !status.warning.is_empty() {
                changefeed.feed_state = FeedState::Warning;
            }
        }
    }

    /// Node churn: maintainers on dead nodes become schedulable again.
    pub fn on_node_removed(&mut self, node: &NodeId) {
        for (id, machine) in &mut self.state_machines {
            if machine.primary.as_ref() == Some(node) {
                info!(changefeed = %id, %node, "maintainer node removed, reschedule");
                machine.state = SchedulerStatus::Absent;
                machine.primary = None;
            }
        }
    }

    fn send_remove_maintainer(&mut self, id: &ChangefeedId, cascade: bool) {
        let Some(machine) = self.state_machines.get_mut(id) else {
            return;
        };
        machine.state = SchedulerStatus::Removing;
        let Some(node) = machine.primary.clone() else {
            warn!(changefeed = %id, "no primary node to send remove maintainer request");
            return;
        };
        self.send_message(TargetMessage::new(
            node,
            MessagePayload::RemoveMaintainerRequest(RemoveMaintainerRequest {
                changefeed_id: id.to_pb(),
                cascade,
            }),
        ));
    }

    fn send_message(&self, msg: TargetMessage) {
        if let Err(e) = self.env.message_center.send(msg) {
            warn!(error = %e, "failed to send coordinator message");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::manager::NodeInfo;
    use crate::messaging::CollectingMessageCenter;

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(NodeId, ChangefeedId)>>,
    }

    impl MaintainerLauncher for Arc<RecordingLauncher> {
        fn launch(&self, node: &NodeId, config: &ChangefeedConfig, _checkpoint_ts: Ts) {
            self.launched
                .lock()
                .push((node.clone(), config.changefeed_id()));
        }
    }

    fn config(name: &str) -> ChangefeedConfig {
        ChangefeedConfig {
            namespace: "default".to_owned(),
            name: name.to_owned(),
            sink_uri: "mysql://127.0.0.1:4000".to_owned(),
            start_ts: 1000,
            target_ts: 0,
            force_replicate: false,
            filter: Default::default(),
            enable_sync_point: false,
            sync_point_interval_ms: 0,
            scheduler: Default::default(),
        }
    }

    fn setup(nodes: &[&str]) -> (Coordinator, Arc<CollectingMessageCenter>, Arc<RecordingLauncher>) {
        let (env, mc) = Env::for_test(NodeId::from("node-a"));
        for node in nodes {
            env.node_manager
                .register_node(NodeInfo::new(NodeId::from(*node), "127.0.0.1:8300"));
        }
        let launcher = Arc::new(RecordingLauncher::default());
        let coordinator = Coordinator::new(env, Box::new(launcher.clone()), 16);
        (coordinator, mc, launcher)
    }

    #[test]
    fn test_create_validates_config() {
        let (mut coordinator, _mc, _launcher) = setup(&["node-a"]);
        let mut bad = config("bad");
        bad.sink_uri = String::new();
        assert!(coordinator.create_changefeed(bad).is_err());

        let mut bad_filter = config("bad-filter");
        bad_filter.filter.rules = vec!["no-dot-rule".to_owned()];
        assert!(coordinator.create_changefeed(bad_filter).is_err());

        assert!(coordinator.create_changefeed(config("good")).is_ok());
        assert!(coordinator.create_changefeed(config("good")).is_err());
    }

    #[test]
    fn test_schedule_places_maintainers_round_robin() {
        let (mut coordinator, _mc, launcher) = setup(&["node-a", "node-b"]);
        for name in ["feed-1", "feed-2", "feed-3"] {
            coordinator.create_changefeed(config(name)).unwrap();
        }
        coordinator.schedule();
        let launched = launcher.launched.lock();
        assert_eq!(launched.len(), 3);
        let on_a = launched.iter().filter(|(node, _)| node.as_str() == "node-a").count();
        let on_b = launched.iter().filter(|(node, _)| node.as_str() == "node-b").count();
        assert_eq!((on_a, on_b), (2, 1));
        drop(launched);

        // Status reports promote the machines to working; a second pass adds
        // nothing new.
        for (node, id) in launcher.launched.lock().iter() {
            coordinator.handle_maintainer_status(
                node.clone(),
                MaintainerStatus {
                    changefeed_id: id.to_pb(),
                    feed_state: "normal".to_owned(),
                    state: ComponentState::Working as i32,
                    checkpoint_ts: 1200,
                    warning: Vec::new(),
                    err: Vec::new(),
                },
            );
        }
        coordinator.schedule();
        assert_eq!(launcher.launched.lock().len(), 3);
        assert_eq!(
            coordinator.checkpoint_ts(&ChangefeedId::in_default("feed-1")),
            Some(1200)
        );
    }

    #[test]
    fn test_node_removed_makes_changefeed_schedulable_again() {
        let (mut coordinator, _mc, launcher) = setup(&["node-a", "node-b"]);
        coordinator.create_changefeed(config("feed-1")).unwrap();
        coordinator.schedule();
        let (node, id) = launcher.launched.lock()[0].clone();
        coordinator.handle_maintainer_status(
            node.clone(),
            MaintainerStatus {
                changefeed_id: id.to_pb(),
                feed_state: "normal".to_owned(),
                state: ComponentState::Working as i32,
                checkpoint_ts: 1100,
                warning: Vec::new(),
                err: Vec::new(),
            },
        );

        coordinator.env.node_manager.remove_node(&node);
        coordinator.on_node_removed(&node);
        coordinator.schedule();
        let launched = launcher.launched.lock();
        assert_eq!(launched.len(), 2);
        assert_ne!(launched[1].0, node);
    }

    #[test]
    fn test_remove_changefeed_sends_cascade_request() {
        let (mut coordinator, mc, launcher) = setup(&["node-a"]);
        coordinator.create_changefeed(config("feed-1")).unwrap();
        coordinator.schedule();
        let (node, id) = launcher.launched.lock()[0].clone();
        mc.take();

        coordinator.remove_changefeed(&id, true).unwrap();
        let msgs = mc.take();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].target, node);
        let MessagePayload::RemoveMaintainerRequest(req) = &msgs[0].payload else {
            panic!("expected remove maintainer request");
        };
        assert!(req.cascade);
        assert!(coordinator.feed_state(&id).is_none());
    }

    #[test]
    fn test_pause_and_resume() {
        let (mut coordinator, mc, launcher) = setup(&["node-a"]);
        coordinator.create_changefeed(config("feed-1")).unwrap();
        coordinator.schedule();
        let id = launcher.launched.lock()[0].1.clone();
        mc.take();

        coordinator.pause_changefeed(&id).unwrap();
        assert_eq!(coordinator.feed_state(&id), Some(FeedState::Paused));
        assert_eq!(mc.sent_count(), 1);
        // Paused feeds are not rescheduled.
        coordinator.schedule();
        assert_eq!(launcher.launched.lock().len(), 1);

        assert!(coordinator.resume_changefeed(&id).is_ok());
        assert_eq!(coordinator.feed_state(&id), Some(FeedState::Normal));
    }
}
