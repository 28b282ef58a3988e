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

//! Cross-dispatcher coordination of blocking events (multi-table DDLs and
//! syncpoints). Exactly one dispatcher writes the event to the sink; the
//! rest pass over it. The maintainer decides which.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rivulet_common::table::Table;
use rivulet_common::{ChangefeedId, DispatcherId, NodeId, Ts};
use rivulet_pb::{
    Ack, Action, BlockStage, BlockStatusRequest, DispatcherAction, DispatcherStatus, InfluenceType,
    InfluencedTables, State,
};
use tracing::{info, warn};

use super::controller::Controller;
use crate::messaging::{MessageCenter, MessagePayload, TargetMessage};

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct BlockEventKey {
    block_ts: Ts,
    is_syncpoint: bool,
}

#[derive(Clone, Copy)]
enum EventStage {
    /// Accumulating blocked reports.
    Waiting,
    /// Writer selected, actions out, waiting for done reports.
    Writing { writer: DispatcherId },
}

struct BarrierEvent {
    key: BlockEventKey,
    influence: InfluencedTables,
    stage: EventStage,
    blocked: HashSet<DispatcherId>,
    done: HashSet<DispatcherId>,
    /// Side effects reported with the blocking event, applied once every
    /// expected dispatcher is done.
    need_dropped_tables: Option<InfluencedTables>,
    need_added_tables: Vec<rivulet_pb::Table>,
    updated_schemas: Vec<rivulet_pb::SchemaIdChange>,
}

/// The per-changefeed barrier. Runs on the maintainer loop; every method is
/// synchronous and completes in bounded time.
pub struct Barrier {
    changefeed_id: ChangefeedId,
    controller: Arc<Controller>,
    message_center: Arc<dyn MessageCenter>,
    blocked_events: HashMap<BlockEventKey, BarrierEvent>,
}

impl Barrier {
    pub fn new(
        changefeed_id: ChangefeedId,
        controller: Arc<Controller>,
        message_center: Arc<dyn MessageCenter>,
    ) -> Self {
        Self {
            changefeed_id,
            controller,
            message_center,
            blocked_events: HashMap::new(),
        }
    }

    /// Handle one block status report; the returned message is the ack for
    /// the reporting node.
    pub fn handle_status(
        &mut self,
        from: &NodeId,
        request: &BlockStatusRequest,
    ) -> Option<TargetMessage> {
        let id = DispatcherId::from_pb(&request.id)?;
        let state = request.state.as_ref()?;

        if !state.is_blocked {
            // A single-table DDL the dispatcher flushed by itself; only its
            // topology side effects reach the maintainer.
            self.apply_side_effects(
                state.need_dropped_tables.as_ref(),
                &state.need_added_tables,
                &state.updated_schemas,
                state.block_ts,
            );
            return Some(ack_message(from, &request.id, state));
        }

        let key = BlockEventKey {
            block_ts: state.block_ts,
            is_syncpoint: state.is_sync_point,
        };
        match state.stage() {
            BlockStage::Waiting | BlockStage::Writing => {
                let event = self.blocked_events.entry(key).or_insert_with(|| {
                    info!(
                        changefeed = %self.changefeed_id,
                        block_ts = key.block_ts,
                        is_syncpoint = key.is_syncpoint,
                        "new blocking event"
                    );
                    BarrierEvent {
                        key,
                        influence: state.block_tables.clone().unwrap_or_default(),
                        stage: EventStage::Waiting,
                        blocked: HashSet::new(),
                        done: HashSet::new(),
                        need_dropped_tables: state.need_dropped_tables.clone(),
                        need_added_tables: state.need_added_tables.clone(),
                        updated_schemas: state.updated_schemas.clone(),
                    }
                });
                event.blocked.insert(id);
                self.maybe_select_writer(key);
            }
            BlockStage::Done => {
                let Some(event) = self.blocked_events.get_mut(&key) else {
                    // Inconsistent report, e.g. after a maintainer restart.
                    warn!(
                        changefeed = %self.changefeed_id,
                        dispatcher = %id,
                        block_ts = key.block_ts,
                        "done report for unknown blocking event, ignore"
                    );
                    return Some(ack_message(from, &request.id, state));
                };
                event.done.insert(id);
                self.maybe_finish_event(key);
            }
            BlockStage::None => {}
        }
        Some(ack_message(from, &request.id, state))
    }

    /// Re-send pending actions; driven by the maintainer's periodic tick
    /// until every expected dispatcher reports done.
    pub fn resend(&mut self) -> Vec<TargetMessage> {
        let keys: Vec<BlockEventKey> = self.blocked_events.keys().copied().collect();
        let mut msgs = Vec::new();
        for key in keys {
            msgs.extend(self.action_messages(key));
        }
        msgs
    }

    /// The dispatchers that must report blocked before the event can move:
    /// the influence set intersected with the current replication db.
    fn expected_dispatchers(&self, influence: &InfluencedTables) -> HashSet<DispatcherId> {
        let db = self.controller.replication_db();
        let replicas = match influence.influence_type() {
            InfluenceType::Normal => db.get_by_table_ids(&influence.table_ids),
            InfluenceType::Db => db.get_by_schema_id(influence.schema_id),
            InfluenceType::All => db.all_replicas(),
        };
        replicas.iter().map(|replica| replica.id()).collect()
    }

    fn maybe_select_writer(&mut self, key: BlockEventKey) {
        let Some(event) = self.blocked_events.get(&key) else {
            return;
        };
        if !matches!(event.stage, EventStage::Waiting) {
            return;
        }
        let expected = self.expected_dispatchers(&event.influence);
        if expected.is_empty() || !expected.iter().all(|id| event.blocked.contains(id)) {
            return;
        }
        // Deterministic choice: the smallest dispatcher id writes.
        let writer = *expected.iter().min().unwrap();
        info!(
            changefeed = %self.changefeed_id,
            block_ts = key.block_ts,
            is_syncpoint = key.is_syncpoint,
            %writer,
            expected = expected.len(),
            "blocking event reached quorum, writer selected"
        );
        let event = self.blocked_events.get_mut(&key).unwrap();
        event.stage = EventStage::Writing { writer };
        for msg in self.action_messages(key) {
            if let Err(e) = self.message_center.send(msg) {
                warn!(changefeed = %self.changefeed_id, error = %e, "failed to send dispatcher action");
            }
        }
    }

    /// Build the write/pass actions still owed for one event. The write
    /// action follows its dispatcher to whatever node currently runs it, but
    /// never moves to a different dispatcher.
    fn action_messages(&self, key: BlockEventKey) -> Vec<TargetMessage> {
        let Some(event) = self.blocked_events.get(&key) else {
            return Vec::new();
        };
        let EventStage::Writing { writer } = event.stage else {
            return Vec::new();
        };
        let db = self.controller.replication_db();
        let expected = self.expected_dispatchers(&event.influence);

        let mut per_node: HashMap<NodeId, Vec<Vec<u8>>> = HashMap::new();
        let mut write_msg = None;
        for id in expected {
            if event.done.contains(&id) {
                continue;
            }
            let Some(node) = db.get(id).and_then(|replica| replica.node()) else {
                continue;
            };
            if id == writer {
                write_msg = Some(TargetMessage::new(
                    node,
                    MessagePayload::DispatcherStatus(DispatcherStatus {
                        dispatcher_ids: vec![id.to_pb()],
                        ack: None,
                        action: Some(DispatcherAction {
                            action: Action::Write as i32,
                            commit_ts: key.block_ts,
                            is_sync_point: key.is_syncpoint,
                        }),
                    }),
                ));
            } else {
                per_node.entry(node).or_default().push(id.to_pb());
            }
        }

        let mut msgs: Vec<TargetMessage> = per_node
            .into_iter()
            .map(|(node, dispatcher_ids)| {
                TargetMessage::new(
                    node,
                    MessagePayload::DispatcherStatus(DispatcherStatus {
                        dispatcher_ids,
                        ack: None,
                        action: Some(DispatcherAction {
                            action: Action::Pass as i32,
                            commit_ts: key.block_ts,
                            is_sync_point: key.is_syncpoint,
                        }),
                    }),
                )
            })
            .collect();
        msgs.extend(write_msg);
        msgs
    }

    fn maybe_finish_event(&mut self, key: BlockEventKey) {
        let Some(event) = self.blocked_events.get(&key) else {
            return;
        };
        if !matches!(event.stage, EventStage::Writing { .. }) {
            return;
        }
        let expected = self.expected_dispatchers(&event.influence);
        if !expected.iter().all(|id| event.done.contains(id)) {
            return;
        }
        let event = self.blocked_events.remove(&key).unwrap();
        info!(
            changefeed = %self.changefeed_id,
            block_ts = key.block_ts,
            is_syncpoint = key.is_syncpoint,
            "blocking event done"
        );
        self.apply_side_effects(
            event.need_dropped_tables.as_ref(),
            &event.need_added_tables,
            &event.updated_schemas,
            event.key.block_ts,
        );
    }

    fn apply_side_effects(
        &self,
        need_dropped: Option<&InfluencedTables>,
        need_added: &[rivulet_pb::Table],
        updated_schemas: &[rivulet_pb::SchemaIdChange],
        block_ts: Ts,
    ) {
        if let Some(dropped) = need_dropped {
            match dropped.influence_type() {
                InfluenceType::Normal => {
                    if !dropped.table_ids.is_empty() {
                        self.controller.remove_tasks_by_table_ids(&dropped.table_ids);
                    }
                }
                InfluenceType::Db => {
                    self.controller.remove_tasks_by_schema_id(dropped.schema_id);
                }
                InfluenceType::All => {
                    warn!(changefeed = %self.changefeed_id, "drop-all side effect is not expected");
                }
            }
        }
        for table in need_added {
            self.controller.add_new_table(Table::from_pb(table), block_ts);
        }
        for change in updated_schemas {
            self.controller
                .update_schema_id(change.table_id, change.new_schema_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_events(&self) -> usize {
        self.blocked_events.len()
    }
}

fn ack_message(from: &NodeId, dispatcher_id: &[u8], state: &State) -> TargetMessage {
    TargetMessage::new(
        from.clone(),
        MessagePayload::DispatcherStatus(DispatcherStatus {
            dispatcher_ids: vec![dispatcher_id.to_vec()],
            ack: Some(Ack {
                commit_ts: state.block_ts,
                is_sync_point: state.is_sync_point,
            }),
            action: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use rivulet_common::config::SchedulerConfig;
    use rivulet_common::filter::Filter;
    use rivulet_common::span::{ddl_span, total_span};
    use rivulet_pb::{BootstrapTableSpan, ComponentState};

    use super::*;
    use crate::manager::{Env, NodeInfo};
    use crate::messaging::CollectingMessageCenter;

    fn setup(
        table_ids: &[i64],
    ) -> (
        Barrier,
        Arc<Controller>,
        Arc<CollectingMessageCenter>,
        HashMap<i64, DispatcherId>,
    ) {
        let changefeed_id = ChangefeedId::in_default("barrier-test");
        let (env, mc) = Env::for_test(NodeId::from("node-a"));
        for node in ["node-a", "node-b"] {
            env.node_manager
                .register_node(NodeInfo::new(NodeId::from(node), "127.0.0.1:8300"));
        }
        let filter = Arc::new(Filter::new(&Default::default(), false).unwrap());
        let controller = Arc::new(Controller::new(
            changefeed_id.clone(),
            1000,
            &SchedulerConfig::default(),
            filter,
            &env,
        ));

        let mut dispatchers = HashMap::new();
        let mut reported = Vec::new();
        let mut reported_tables = Vec::new();
        for (idx, table_id) in table_ids.iter().enumerate() {
            let id = DispatcherId::new();
            dispatchers.insert(*table_id, id);
            let node = if idx % 2 == 0 { "node-a" } else { "node-b" };
            reported.push((
                NodeId::from(node),
                BootstrapTableSpan {
                    id: id.to_pb(),
                    schema_id: 1,
                    span: Some(total_span(*table_id)),
                    component_status: ComponentState::Working as i32,
                    checkpoint_ts: 1000,
                },
            ));
            reported_tables.push(rivulet_common::table::Table {
                schema_id: 1,
                schema_name: "app".to_owned(),
                table_id: *table_id,
                table_name: format!("t{table_id}"),
            });
        }
        // Report the DDL-span dispatcher too, so no add operator is pending.
        let ddl_id = DispatcherId::new();
        dispatchers.insert(0, ddl_id);
        reported.push((
            NodeId::from("node-a"),
            BootstrapTableSpan {
                id: ddl_id.to_pb(),
                schema_id: 0,
                span: Some(ddl_span()),
                component_status: ComponentState::Working as i32,
                checkpoint_ts: 1000,
            },
        ));
        controller.set_initial_tables(reported_tables);
        controller.finish_bootstrap(reported);
        mc.take();

        let barrier = Barrier::new(changefeed_id, controller.clone(), mc.clone());
        (barrier, controller, mc, dispatchers)
    }

    fn block_request(
        dispatcher: DispatcherId,
        state: State,
    ) -> BlockStatusRequest {
        BlockStatusRequest {
            changefeed_id: "default/barrier-test".to_owned(),
            id: dispatcher.to_pb(),
            state: Some(state),
        }
    }

    fn waiting_state(block_ts: Ts, influence: InfluencedTables) -> State {
        State {
            is_blocked: true,
            block_ts,
            block_tables: Some(influence),
            need_dropped_tables: None,
            need_added_tables: Vec::new(),
            updated_schemas: Vec::new(),
            is_sync_point: false,
            stage: BlockStage::Waiting as i32,
        }
    }

    fn done_state(block_ts: Ts) -> State {
        State {
            is_blocked: true,
            block_ts,
            block_tables: None,
            need_dropped_tables: None,
            need_added_tables: Vec::new(),
            updated_schemas: Vec::new(),
            is_sync_point: false,
            stage: BlockStage::Done as i32,
        }
    }

    fn actions(mc: &CollectingMessageCenter) -> Vec<(NodeId, DispatcherStatus)> {
        mc.take()
            .into_iter()
            .filter_map(|msg| match msg.payload {
                MessagePayload::DispatcherStatus(status) if status.action.is_some() => {
                    Some((msg.target, status))
                }
                _ => None,
            })
            .collect()
    }

    fn node_of(controller: &Controller, id: DispatcherId) -> NodeId {
        controller.replication_db().get(id).unwrap().node().unwrap()
    }

    #[test]
    fn test_cross_schema_rename_single_writer_and_schema_rebind() {
        let (mut barrier, controller, mc, dispatchers) = setup(&[101]);
        let writer = dispatchers[&101];
        let node = node_of(&controller, writer);

        let influence = InfluencedTables {
            influence_type: InfluenceType::Normal as i32,
            table_ids: vec![101],
            schema_id: 0,
        };
        let mut state = waiting_state(3000, influence);
        state.updated_schemas = vec![rivulet_pb::SchemaIdChange {
            table_id: 101,
            old_schema_id: 1,
            new_schema_id: 2,
        }];
        let ack = barrier
            .handle_status(&node, &block_request(writer, state))
            .unwrap();
        assert_eq!(ack.target, node);

        // The only expected dispatcher reported, so the write goes out
        // immediately and nobody passes.
        let sent = actions(&mc);
        assert_eq!(sent.len(), 1);
        let (target, status) = &sent[0];
        assert_eq!(target, &node);
        assert_eq!(status.action.unwrap().action(), Action::Write);
        assert_eq!(status.dispatcher_ids, vec![writer.to_pb()]);

        barrier
            .handle_status(&node, &block_request(writer, done_state(3000)))
            .unwrap();
        assert_eq!(barrier.pending_events(), 0);
        // The schema index now binds table 101 to schema 2.
        assert!(controller.replication_db().get_by_schema_id(1).is_empty());
        assert_eq!(
            controller.replication_db().get_by_schema_id(2)[0].id(),
            writer
        );
    }

    #[test]
    fn test_create_view_blocks_all_with_single_writer() {
        let (mut barrier, controller, mc, dispatchers) = setup(&[101, 102]);
        let influence = InfluencedTables {
            influence_type: InfluenceType::All as i32,
            table_ids: Vec::new(),
            schema_id: 0,
        };
        let all: Vec<DispatcherId> = dispatchers.values().copied().collect();
        let before_tasks = controller.task_size();

        for id in &all {
            let node = node_of(&controller, *id);
            barrier
                .handle_status(&node, &block_request(*id, waiting_state(4000, influence.clone())))
                .unwrap();
        }
        let sent = actions(&mc);
        let mut write_ids = Vec::new();
        let mut pass_ids = Vec::new();
        for (_, status) in &sent {
            let ids = status
                .dispatcher_ids
                .iter()
                .map(|raw| DispatcherId::from_pb(raw).unwrap());
            match status.action.unwrap().action() {
                Action::Write => write_ids.extend(ids),
                Action::Pass => pass_ids.extend(ids),
            }
        }
        // Exactly one writer, everyone else passes.
        assert_eq!(write_ids.len(), 1);
        assert_eq!(pass_ids.len(), all.len() - 1);
        assert_eq!(write_ids[0], *all.iter().min().unwrap());

        // Resends are idempotent in shape: still one write, same writer.
        let resent = barrier.resend();
        let writes: Vec<_> = resent
            .iter()
            .filter_map(|msg| match &msg.payload {
                MessagePayload::DispatcherStatus(status) => status.action.as_ref(),
                _ => None,
            })
            .filter(|action| action.action() == Action::Write)
            .collect();
        assert_eq!(writes.len(), 1);

        for id in &all {
            let node = node_of(&controller, *id);
            barrier
                .handle_status(&node, &block_request(*id, done_state(4000)))
                .unwrap();
        }
        assert_eq!(barrier.pending_events(), 0);
        // No topology change from a create-view.
        assert_eq!(controller.task_size(), before_tasks);
    }

    #[test]
    fn test_write_action_follows_writer_to_new_node() {
        let (mut barrier, controller, mc, dispatchers) = setup(&[101]);
        let writer = dispatchers[&101];
        let node = node_of(&controller, writer);
        let influence = InfluencedTables {
            influence_type: InfluenceType::Normal as i32,
            table_ids: vec![101],
            schema_id: 0,
        };
        barrier
            .handle_status(&node, &block_request(writer, waiting_state(5000, influence)))
            .unwrap();
        assert_eq!(actions(&mc).len(), 1);

        // The writer's replica lands on another node before reporting done.
        let db = controller.replication_db();
        let replica = db.get(writer).unwrap();
        db.mark_absent(&replica);
        db.bind_node_and_mark_scheduling(&replica, NodeId::from("node-b"));
        db.mark_replicating(&replica);

        let resent = barrier.resend();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].target, NodeId::from("node-b"));
        let MessagePayload::DispatcherStatus(status) = &resent[0].payload else {
            panic!("expected dispatcher status");
        };
        assert_eq!(status.action.unwrap().action(), Action::Write);
        assert_eq!(status.dispatcher_ids, vec![writer.to_pb()]);
    }

    #[test]
    fn test_done_for_unknown_event_is_ignored() {
        let (mut barrier, _controller, _mc, dispatchers) = setup(&[101]);
        let ack = barrier.handle_status(
            &NodeId::from("node-a"),
            &block_request(dispatchers[&101], done_state(9999)),
        );
        assert!(ack.is_some());
        assert_eq!(barrier.pending_events(), 0);
    }

    #[test]
    fn test_non_blocked_report_applies_side_effects() {
        let (mut barrier, controller, _mc, _dispatchers) = setup(&[101]);
        let state = State {
            is_blocked: false,
            block_ts: 2000,
            block_tables: None,
            need_dropped_tables: Some(InfluencedTables {
                influence_type: InfluenceType::Normal as i32,
                table_ids: vec![101],
                schema_id: 0,
            }),
            need_added_tables: vec![rivulet_pb::Table {
                schema_id: 1,
                table_id: 105,
                schema_name: "app".to_owned(),
                table_name: "t105".to_owned(),
            }],
            updated_schemas: Vec::new(),
            is_sync_point: false,
            stage: BlockStage::None as i32,
        };
        let request = BlockStatusRequest {
            changefeed_id: "default/barrier-test".to_owned(),
            id: DispatcherId::new().to_pb(),
            state: Some(state),
        };
        barrier
            .handle_status(&NodeId::from("node-a"), &request)
            .unwrap();

        let db = controller.replication_db();
        // 101 is being torn down by a remove operator, 105 waits for
        // placement.
        assert_eq!(controller.operator_controller().operator_size(), 1);
        assert!(db.covered_table_ids().contains(&105));
        let new_replica = &db.get_by_table_ids(&[105])[0];
        assert_eq!(new_replica.checkpoint_ts(), 2000);
    }
}
