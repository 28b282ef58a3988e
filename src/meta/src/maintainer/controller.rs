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

//! Per-changefeed scheduling controller: owns the replication db, the
//! operator controller and the scheduler chain; reconciles the bootstrap
//! reports against the table set from the schema store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rivulet_common::config::SchedulerConfig;
use rivulet_common::filter::Filter;
use rivulet_common::table::Table;
use rivulet_common::{span, ChangefeedId, DispatcherId, NodeId, Ts};
use rivulet_pb::{BootstrapTableSpan, ComponentState, TableSpanStatus};
use tracing::{info, warn};

use super::operator::{AddDispatcherOperator, OperatorController};
use super::replica::{ReplicationDb, SpanReplication};
use super::scheduler::{
    stray_keys, BalanceScheduler, BasicScheduler, EvenSpanSplitter, MergeScheduler, Scheduler,
    SplitScheduler,
};
use crate::manager::Env;

pub struct Controller {
    changefeed_id: ChangefeedId,
    start_ts: Ts,
    filter: Arc<Filter>,
    self_node: NodeId,
    replication_db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    schedulers: Vec<Box<dyn Scheduler>>,
    bootstrapped: AtomicBool,
    /// The table set pulled from the schema store during initialize, consumed
    /// by `finish_bootstrap`.
    initial_tables: Mutex<Vec<Table>>,
}

impl Controller {
    pub fn new(
        changefeed_id: ChangefeedId,
        start_ts: Ts,
        config: &SchedulerConfig,
        filter: Arc<Filter>,
        env: &Env,
    ) -> Self {
        let replication_db = Arc::new(ReplicationDb::new(changefeed_id.clone()));
        let operator_controller = Arc::new(OperatorController::new(
            changefeed_id.clone(),
            replication_db.clone(),
            env.node_manager.clone(),
            env.message_center.clone(),
            env.metrics.clone(),
            config.batch_size,
        ));

        let mut schedulers: Vec<Box<dyn Scheduler>> = vec![Box::new(BasicScheduler::new(
            replication_db.clone(),
            operator_controller.clone(),
            env.node_manager.clone(),
            config.add_table_batch_size,
        ))];
        schedulers.push(Box::new(BalanceScheduler::new(
            replication_db.clone(),
            operator_controller.clone(),
            env.node_manager.clone(),
            config.batch_size,
            Duration::from_millis(config.check_balance_interval_ms),
        )));
        if config.enable_table_across_nodes {
            schedulers.push(Box::new(SplitScheduler::new(
                replication_db.clone(),
                operator_controller.clone(),
                Arc::new(EvenSpanSplitter),
                config.split_event_size_threshold,
                config.batch_size,
            )));
            schedulers.push(Box::new(MergeScheduler::new(
                replication_db.clone(),
                operator_controller.clone(),
                config.merge_event_size_low_water,
            )));
        }

        Self {
            changefeed_id,
            start_ts,
            filter,
            self_node: env.self_node.clone(),
            replication_db,
            operator_controller,
            schedulers,
            bootstrapped: AtomicBool::new(false),
            initial_tables: Mutex::new(Vec::new()),
        }
    }

    pub fn replication_db(&self) -> &Arc<ReplicationDb> {
        &self.replication_db
    }

    pub fn operator_controller(&self) -> &Arc<OperatorController> {
        &self.operator_controller
    }

    pub fn set_initial_tables(&self, tables: Vec<Table>) {
        *self.initial_tables.lock() = tables;
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::Acquire)
    }

    /// Seed the replication db from what the nodes already run, then
    /// reconcile against the schema store's table set: uncovered tables
    /// become absent replicas, stray replicas get remove operators, and the
    /// DDL-span dispatcher is created on this node if nobody reported it.
    pub fn finish_bootstrap(&self, reported: Vec<(NodeId, BootstrapTableSpan)>) {
        if self.bootstrapped.swap(true, Ordering::AcqRel) {
            warn!(changefeed = %self.changefeed_id, "bootstrap already finished");
            return;
        }
        let tables = std::mem::take(&mut *self.initial_tables.lock());

        let mut covered: HashSet<i64> = HashSet::new();
        for (node, span_info) in reported {
            let Some(id) = DispatcherId::from_pb(&span_info.id) else {
                warn!(changefeed = %self.changefeed_id, ?node, "malformed dispatcher id in bootstrap span");
                continue;
            };
            let Some(table_span) = span_info.span.clone() else {
                continue;
            };
            if span_info.component_status() == ComponentState::Stopped {
                continue;
            }
            let replica = Arc::new(SpanReplication::new_working(
                self.changefeed_id.clone(),
                id,
                span_info.schema_id,
                table_span.clone(),
                span_info.checkpoint_ts,
                span_info.component_status(),
                node,
            ));
            self.replication_db.insert_replicating(replica);
            if span::is_ddl_span(&table_span) {
                self.replication_db.set_ddl_dispatcher(id);
            } else {
                covered.insert(table_span.table_id);
            }
        }

        let target: HashSet<i64> = tables.iter().map(|table| table.table_id).collect();
        for table in &tables {
            if covered.contains(&table.table_id) {
                continue;
            }
            self.replication_db
                .insert_absent(Arc::new(SpanReplication::new_absent(
                    self.changefeed_id.clone(),
                    table.schema_id,
                    span::total_span(table.table_id),
                    self.start_ts,
                )));
        }
        let strays = stray_keys(&target, covered.iter().copied());
        if !strays.is_empty() {
            info!(
                changefeed = %self.changefeed_id,
                strays = strays.len(),
                "removing replicas for tables outside the snapshot"
            );
            self.operator_controller.remove_tasks_by_table_ids(&strays);
        }

        if self.replication_db.ddl_dispatcher().is_none() {
            let replica = Arc::new(SpanReplication::new_absent(
                self.changefeed_id.clone(),
                0,
                span::ddl_span(),
                self.start_ts,
            ));
            self.replication_db.set_ddl_dispatcher(replica.id());
            self.replication_db.insert_absent(replica.clone());
            // The table-trigger dispatcher is pinned to the maintainer's own
            // node.
            self.operator_controller
                .add_operator(Arc::new(AddDispatcherOperator::new(
                    self.replication_db.clone(),
                    replica,
                    self.self_node.clone(),
                )));
        }
        info!(
            changefeed = %self.changefeed_id,
            tables = target.len(),
            covered = covered.len(),
            "bootstrap finished"
        );
    }

    /// Route reported statuses to the replicas and their operators.
    pub fn handle_status(&self, from: &NodeId, statuses: &[TableSpanStatus]) {
        for status in statuses {
            let Some(id) = DispatcherId::from_pb(&status.id) else {
                continue;
            };
            match self.replication_db.get(id) {
                Some(replica) => replica.update_status(status),
                None => {
                    if status.component_status() == ComponentState::Working {
                        warn!(
                            changefeed = %self.changefeed_id,
                            dispatcher = %id,
                            ?from,
                            "working dispatcher reported for unknown replica"
                        );
                    }
                }
            }
            self.operator_controller
                .update_operator_status(id, from, status);
        }
    }

    /// Run the scheduler chain once. No-op before bootstrap completes.
    pub fn tick(&self) {
        if !self.bootstrapped() {
            return;
        }
        for scheduler in &self.schedulers {
            scheduler.schedule();
        }
    }

    /// Whether every replica is placed and working: the gate for checkpoint
    /// advancement.
    pub fn schedule_finished(&self) -> bool {
        self.bootstrapped()
            && self.operator_controller.operator_size() == 0
            && self.replication_db.absent_size() == 0
            && self.replication_db.scheduling_size() == 0
    }

    /// A DDL created a table: add an absent replica for it.
    pub fn add_new_table(&self, table: Table, start_ts: Ts) {
        if self
            .filter
            .should_ignore_table(&table.schema_name, &table.table_name)
        {
            return;
        }
        if self
            .replication_db
            .covered_table_ids()
            .contains(&table.table_id)
        {
            return;
        }
        self.replication_db
            .insert_absent(Arc::new(SpanReplication::new_absent(
                self.changefeed_id.clone(),
                table.schema_id,
                span::total_span(table.table_id),
                start_ts,
            )));
    }

    pub fn remove_tasks_by_table_ids(&self, table_ids: &[i64]) {
        self.operator_controller.remove_tasks_by_table_ids(table_ids);
    }

    pub fn remove_tasks_by_schema_id(&self, schema_id: i64) {
        self.operator_controller.remove_tasks_by_schema_id(schema_id);
    }

    pub fn remove_all_tasks(&self) {
        self.operator_controller.remove_all_tasks();
    }

    pub fn update_schema_id(&self, table_id: i64, new_schema_id: i64) {
        self.replication_db.update_schema_id(table_id, new_schema_id);
    }

    pub fn remove_node(&self, node: &NodeId) {
        self.operator_controller.on_node_removed(node);
    }

    pub fn task_size(&self) -> usize {
        self.replication_db.task_size()
    }

    pub fn task_size_by_node(&self, node: &NodeId) -> usize {
        self.replication_db.task_size_by_node(node)
    }

    pub fn ddl_dispatcher_node(&self) -> Option<NodeId> {
        self.replication_db
            .ddl_dispatcher()
            .and_then(|replica| replica.node())
    }

    pub fn stop(&self) {
        info!(changefeed = %self.changefeed_id, "controller stopped");
    }
}
