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

//! The per-changefeed maintainer: a single-threaded event loop that
//! bootstraps the node set, schedules dispatcher replicas, advances the
//! changefeed checkpoint and coordinates blocking DDLs through the barrier.
//!
//! The loop must never block: initialization runs on the shared task pool
//! and completes through an event; the operator executor runs on its own
//! task against the shared controller state.

mod barrier;
mod controller;
pub mod operator;
pub mod replica;
pub mod scheduler;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use barrier::Barrier;
pub use controller::Controller;
use parking_lot::Mutex;
use rivulet_common::config::ChangefeedConfig;
use rivulet_common::filter::Filter;
use rivulet_common::table::Table;
use rivulet_common::ts::{current_physical, extract_physical};
use rivulet_common::{ChangefeedId, NodeId, Ts};
use rivulet_pb::{
    BlockStatusRequest, CheckpointTsMessage, ComponentState, HeartBeatRequest,
    MaintainerBootstrapRequest, MaintainerBootstrapResponse, MaintainerCloseRequest,
    MaintainerCloseResponse, MaintainerStatus, RunningError, Watermark,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::Bootstrapper;
use crate::manager::Env;
use crate::messaging::{IncomingMessage, MessagePayload, TargetMessage};
use crate::schemastore::PersistentStorage;
use crate::{MetaError, MetaResult};

const PERIOD_INTERVAL: Duration = Duration::from_millis(500);
const OPERATOR_EXECUTE_INTERVAL: Duration = Duration::from_millis(100);
const CHECKPOINT_MIN_INTERVAL: Duration = Duration::from_secs(2);
const PRINT_STATUS_INTERVAL: Duration = Duration::from_secs(20);
const INIT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Where the maintainer reads the changefeed's table set from. Backed by the
/// schema store in production.
pub trait TableSetSource: Send + Sync + 'static {
    fn get_all_physical_tables(&self, snap_ts: Ts, filter: &Filter) -> MetaResult<Vec<Table>>;
}

impl TableSetSource for PersistentStorage {
    fn get_all_physical_tables(&self, snap_ts: Ts, filter: &Filter) -> MetaResult<Vec<Table>> {
        PersistentStorage::get_all_physical_tables(self, snap_ts, filter)
    }
}

/// Everything the maintainer reacts to, consumed one at a time.
pub enum Event {
    Init,
    /// Completion of the off-loop initialize.
    InitDone(MetaResult<Vec<Table>>),
    Message(IncomingMessage),
    Period,
}

#[derive(Default)]
struct RunningErrors {
    errors: HashMap<NodeId, RunningError>,
    warnings: HashMap<NodeId, RunningError>,
}

pub struct Maintainer {
    id: ChangefeedId,
    config: ChangefeedConfig,
    env: Env,
    table_source: Arc<dyn TableSetSource>,
    controller: Arc<Controller>,
    barrier: Barrier,
    bootstrapper: Bootstrapper<MaintainerBootstrapResponse>,
    /// The node whose coordinator receives our status reports, if any.
    coordinator_node: Option<NodeId>,

    watermark: Watermark,
    checkpoint_ts_by_node: HashMap<NodeId, Watermark>,

    state: ComponentState,
    initialized: bool,
    removing: bool,
    cascade_removing: bool,
    removed: bool,
    nodes_closed: HashSet<NodeId>,

    node_changed: Arc<AtomicBool>,
    status_changed: Arc<AtomicBool>,
    /// Written by the off-loop initialize as well, hence the shared mutex.
    /// Warnings and errors live under the one lock.
    running_errors: Arc<Mutex<RunningErrors>>,

    last_checkpoint_time: Instant,
    last_print_time: Instant,

    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl Maintainer {
    pub fn new(
        config: ChangefeedConfig,
        env: Env,
        table_source: Arc<dyn TableSetSource>,
        coordinator_node: Option<NodeId>,
    ) -> MetaResult<Self> {
        let id = config.changefeed_id();
        let filter = Arc::new(
            Filter::new(&config.filter, config.force_replicate)
                .map_err(MetaError::invalid_config)?,
        );
        let controller = Arc::new(Controller::new(
            id.clone(),
            config.start_ts,
            &config.scheduler,
            filter,
            &env,
        ));
        let barrier = Barrier::new(id.clone(), controller.clone(), env.message_center.clone());
        let bootstrapper = Bootstrapper::new(id.to_pb(), new_bootstrap_fn(&config)?);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        env.metrics
            .maintainer_count
            .with_label_values(&[&id.namespace, &id.name])
            .inc();
        info!(changefeed = %id, start_ts = config.start_ts, "maintainer created");

        Ok(Self {
            id,
            env,
            table_source,
            controller,
            barrier,
            bootstrapper,
            coordinator_node,
            watermark: Watermark::new(config.start_ts),
            checkpoint_ts_by_node: HashMap::new(),
            state: ComponentState::Working,
            initialized: false,
            removing: false,
            cascade_removing: false,
            removed: false,
            nodes_closed: HashSet::new(),
            node_changed: Arc::new(AtomicBool::new(false)),
            status_changed: Arc::new(AtomicBool::new(true)),
            running_errors: Arc::new(Mutex::new(RunningErrors::default())),
            last_checkpoint_time: Instant::now() - CHECKPOINT_MIN_INTERVAL,
            last_print_time: Instant::now(),
            event_tx,
            event_rx: Some(event_rx),
            config,
        })
    }

    pub fn id(&self) -> &ChangefeedId {
        &self.id
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.event_tx.clone()
    }

    pub fn checkpoint_ts(&self) -> Ts {
        self.watermark.checkpoint_ts
    }

    pub fn state(&self) -> ComponentState {
        self.state
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Run the loop: inbound events, the 500 ms period tick and the operator
    /// executor, until stopped or shut down.
    pub fn start(mut self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let mut event_rx = self.event_rx.take().expect("maintainer already started");
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let operator_controller = self.controller.operator_controller().clone();
            let mut period = tokio::time::interval(PERIOD_INTERVAL);
            let mut executor = tokio::time::interval(OPERATOR_EXECUTE_INTERVAL);
            self.handle_event(Event::Init);
            loop {
                tokio::select! {
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        self.handle_event(event);
                    }
                    _ = period.tick() => self.handle_event(Event::Period),
                    _ = executor.tick() => {
                        operator_controller.execute();
                    }
                    _ = &mut shutdown_rx => break,
                }
                if self.removed {
                    break;
                }
            }
            self.close();
        });
        (join_handle, shutdown_tx)
    }

    /// The single entry point of the state machine.
    pub fn handle_event(&mut self, event: Event) {
        let start = Instant::now();
        if self.state == ComponentState::Stopped {
            warn!(changefeed = %self.id, "maintainer is stopped, ignore event");
            return;
        }
        if self.node_changed.swap(false, Ordering::AcqRel) {
            self.on_node_changed();
        }
        match event {
            Event::Init => self.on_init(),
            Event::InitDone(result) => self.on_init_done(result),
            Event::Message(msg) => self.on_message(msg),
            Event::Period => self.on_period(),
        }
        let elapsed = start.elapsed();
        if elapsed > Duration::from_secs(1) {
            info!(changefeed = %self.id, ?elapsed, "maintainer event handling is too slow");
        }
        self.env
            .metrics
            .handle_event_duration
            .with_label_values(&[&self.id.namespace, &self.id.name])
            .observe(elapsed.as_secs_f64());
    }

    fn on_init(&mut self) {
        if self.initialized {
            return;
        }
        let table_source = self.table_source.clone();
        let filter = Filter::new(&self.config.filter, self.config.force_replicate);
        let start_ts = self.watermark.checkpoint_ts;
        let event_tx = self.event_tx.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                let filter = filter.map_err(MetaError::invalid_config)?;
                table_source.get_all_physical_tables(start_ts, &filter)
            })
            .await
            .unwrap_or_else(|e| Err(MetaError::from(anyhow::anyhow!("initialize panicked: {e}"))));
            if event_tx.send(Event::InitDone(result)).is_err() {
                info!(changefeed = %id, "maintainer gone before initialize finished");
            }
        });
    }

    fn on_init_done(&mut self, result: MetaResult<Vec<Table>>) {
        if self.initialized {
            return;
        }
        let tables = match result {
            Ok(tables) => tables,
            Err(e) if e.is_transient() => {
                // The upstream will come back; retry with a delay.
                warn!(changefeed = %self.id, error = %e, "initialize failed, retrying");
                let event_tx = self.event_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(INIT_RETRY_INTERVAL).await;
                    let _ = event_tx.send(Event::Init);
                });
                return;
            }
            Err(e) => {
                self.handle_error(e);
                return;
            }
        };
        info!(changefeed = %self.id, tables = tables.len(), "maintainer initialized");
        self.controller.set_initial_tables(tables);
        self.initialized = true;
        self.state = ComponentState::Working;
        self.status_changed.store(true, Ordering::Release);

        let node_changed = self.node_changed.clone();
        self.env.node_manager.register_node_change_handler(
            format!("maintainer-{}", self.id),
            move |_| {
                node_changed.store(true, Ordering::Release);
            },
        );
        let nodes: Vec<NodeId> = self
            .env
            .node_manager
            .get_alive_nodes()
            .into_keys()
            .collect();
        info!(changefeed = %self.id, nodes = nodes.len(), "changefeed bootstrap initial nodes");
        let msgs = self.bootstrapper.handle_new_nodes(nodes);
        self.send_messages(msgs);
    }

    fn on_message(&mut self, msg: IncomingMessage) {
        let IncomingMessage { from, payload } = msg;
        match payload {
            MessagePayload::HeartBeat(req) => self.on_heartbeat(from, req),
            MessagePayload::BlockStatus(req) => self.on_block_status(from, req),
            MessagePayload::MaintainerBootstrapResponse(resp) => {
                self.on_bootstrap_response(from, resp)
            }
            MessagePayload::MaintainerCloseResponse(resp) => self.on_node_closed(from, resp),
            MessagePayload::RemoveMaintainerRequest(req) => self.on_remove_maintainer(req.cascade),
            MessagePayload::CheckpointTs(msg) => self.on_checkpoint_ts_persisted(msg),
            other => {
                warn!(
                    changefeed = %self.id,
                    ?from,
                    message = other.type_name(),
                    "unexpected message type"
                );
            }
        }
    }

    fn on_heartbeat(&mut self, from: NodeId, req: HeartBeatRequest) {
        if let Some(watermark) = req.watermark {
            self.checkpoint_ts_by_node.insert(from.clone(), watermark);
        }
        self.controller.handle_status(&from, &req.statuses);
        if req.warning.is_some() || req.err.is_some() {
            let mut running = self.running_errors.lock();
            if let Some(warning) = req.warning {
                running.warnings.insert(from.clone(), warning);
            }
            if let Some(err) = req.err {
                running.errors.insert(from, err);
            }
            self.status_changed.store(true, Ordering::Release);
        }
    }

    fn on_block_status(&mut self, from: NodeId, req: BlockStatusRequest) {
        if let Some(ack) = self.barrier.handle_status(&from, &req) {
            self.send_messages(vec![ack]);
        }
    }

    fn on_bootstrap_response(&mut self, from: NodeId, resp: MaintainerBootstrapResponse) {
        info!(changefeed = %self.id, node = %from, "received maintainer bootstrap response");
        let cached = self.bootstrapper.handle_bootstrap_response(from, resp);
        self.on_bootstrap_done(cached);
    }

    fn on_bootstrap_done(&mut self, cached: Option<HashMap<NodeId, MaintainerBootstrapResponse>>) {
        let Some(cached) = cached else { return };
        info!(
            changefeed = %self.id,
            nodes = cached.len(),
            "all nodes have sent bootstrap response"
        );
        let mut reported = Vec::new();
        for (node, resp) in cached {
            for span_info in resp.spans {
                reported.push((node.clone(), span_info));
            }
        }
        self.controller.finish_bootstrap(reported);
    }

    fn on_node_closed(&mut self, from: NodeId, resp: MaintainerCloseResponse) {
        if resp.success {
            self.nodes_closed.insert(from);
        }
        // Re-check whether every node has closed by now.
        self.on_remove_maintainer(self.cascade_removing);
    }

    fn on_remove_maintainer(&mut self, cascade: bool) {
        self.removing = true;
        self.cascade_removing = cascade;
        if self.try_close_changefeed() {
            self.removed = true;
            self.state = ComponentState::Stopped;
            self.env
                .metrics
                .maintainer_count
                .with_label_values(&[&self.id.namespace, &self.id.name])
                .dec();
            self.status_changed.store(true, Ordering::Release);
            info!(changefeed = %self.id, "maintainer removed");
        }
    }

    fn on_checkpoint_ts_persisted(&mut self, msg: CheckpointTsMessage) {
        let Some(node) = self.controller.ddl_dispatcher_node() else {
            warn!(
                changefeed = %self.id,
                "ddl dispatcher not found, can not forward checkpoint message"
            );
            return;
        };
        self.send_messages(vec![TargetMessage::new(
            node,
            MessagePayload::CheckpointTs(msg),
        )]);
    }

    fn on_node_changed(&mut self) {
        let current = self.bootstrapper.get_all_nodes();
        let alive = self.env.node_manager.get_alive_nodes();

        let new_nodes: Vec<NodeId> = alive
            .keys()
            .filter(|node| !current.contains(*node))
            .cloned()
            .collect();
        let removed_nodes: Vec<NodeId> = current
            .iter()
            .filter(|node| !alive.contains_key(*node))
            .cloned()
            .collect();
        info!(
            changefeed = %self.id,
            new = new_nodes.len(),
            removed = removed_nodes.len(),
            "maintainer node changed"
        );
        for node in &removed_nodes {
            self.checkpoint_ts_by_node.remove(node);
            self.controller.remove_node(node);
        }
        let msgs = self.bootstrapper.handle_new_nodes(new_nodes);
        self.send_messages(msgs);
        let cached = self.bootstrapper.handle_remove_nodes(removed_nodes);
        if cached.is_some() {
            info!(changefeed = %self.id, "bootstrap done after removing nodes");
            self.on_bootstrap_done(cached);
        }
    }

    fn on_period(&mut self) {
        self.handle_resend_messages();
        if self.initialized {
            self.controller.tick();
        }
        self.collect_metrics();
        self.calc_checkpoint_ts();
        self.report_status();
    }

    fn handle_resend_messages(&mut self) {
        let msgs = self.bootstrapper.resend_bootstrap_message();
        self.send_messages(msgs);
        if self.removing {
            self.send_maintainer_close_request_to_all_nodes();
        }
        let msgs = self.barrier.resend();
        self.send_messages(msgs);
    }

    /// Compute the changefeed watermark as the min over the per-node reports.
    ///
    /// Only advances when the topology is quiet: no operators in flight and
    /// nothing absent or scheduling. The published checkpoint never moves
    /// backwards even when a source watermark regresses.
    fn calc_checkpoint_ts(&mut self) {
        self.update_metrics();
        if self.last_checkpoint_time.elapsed() < CHECKPOINT_MIN_INTERVAL
            || !self.controller.schedule_finished()
        {
            return;
        }
        self.last_checkpoint_time = Instant::now();

        let mut new_watermark = Watermark::max_sentinel();
        for node in self.bootstrapper.get_all_nodes() {
            if self.controller.task_size_by_node(&node) == 0 {
                continue;
            }
            match self.checkpoint_ts_by_node.get(&node) {
                Some(watermark) => new_watermark.update_min(*watermark),
                None => {
                    debug!(
                        changefeed = %self.id,
                        %node,
                        "checkpoint can not be advanced, missing node heartbeat"
                    );
                    return;
                }
            }
        }
        if new_watermark.checkpoint_ts != u64::MAX {
            self.watermark.checkpoint_ts =
                self.watermark.checkpoint_ts.max(new_watermark.checkpoint_ts);
        }
        if new_watermark.resolved_ts != u64::MAX {
            self.watermark.resolved_ts = new_watermark
                .resolved_ts
                .max(self.watermark.checkpoint_ts);
        }
    }

    fn update_metrics(&self) {
        let labels = &[self.id.namespace.as_str(), self.id.name.as_str()];
        let metrics = &self.env.metrics;
        let checkpoint_phy = extract_physical(self.watermark.checkpoint_ts) as i64;
        metrics
            .changefeed_checkpoint_ts
            .with_label_values(labels)
            .set(checkpoint_phy);
        metrics
            .changefeed_checkpoint_ts_lag
            .with_label_values(labels)
            .set((current_physical() as i64 - checkpoint_phy) / 1000);
        let resolved_phy = extract_physical(self.watermark.resolved_ts) as i64;
        metrics
            .changefeed_resolved_ts
            .with_label_values(labels)
            .set(resolved_phy);
        metrics
            .changefeed_resolved_ts_lag
            .with_label_values(labels)
            .set((current_physical() as i64 - resolved_phy) / 1000);
        metrics
            .changefeed_status
            .with_label_values(labels)
            .set(self.state as i64);
    }

    fn collect_metrics(&mut self) {
        if self.last_print_time.elapsed() < PRINT_STATUS_INTERVAL {
            return;
        }
        self.last_print_time = Instant::now();
        let db = self.controller.replication_db();
        let (total, absent, scheduling, working) = (
            db.task_size(),
            db.absent_size(),
            db.scheduling_size(),
            db.replicating_size(),
        );
        let metrics = &self.env.metrics;
        metrics
            .table_count
            .with_label_values(&[&self.id.namespace, &self.id.name])
            .set(total as i64);
        for (state, value) in [
            ("Absent", absent),
            ("Scheduling", scheduling),
            ("Working", working),
        ] {
            metrics
                .table_state_count
                .with_label_values(&[&self.id.namespace, &self.id.name, state])
                .set(value as i64);
        }
        info!(
            changefeed = %self.id,
            total,
            absent,
            scheduling,
            working,
            "maintainer status"
        );
    }

    /// The status reported to the coordinator, draining collected warnings
    /// and errors.
    pub fn get_maintainer_status(&self) -> MaintainerStatus {
        let mut running = self.running_errors.lock();
        let warning: Vec<RunningError> = running.warnings.drain().map(|(_, e)| e).collect();
        let err: Vec<RunningError> = running.errors.drain().map(|(_, e)| e).collect();
        MaintainerStatus {
            changefeed_id: self.id.to_pb(),
            feed_state: if self.removing { "removing" } else { "normal" }.to_owned(),
            state: self.state as i32,
            checkpoint_ts: self.watermark.checkpoint_ts,
            warning,
            err,
        }
    }

    fn report_status(&mut self) {
        let Some(coordinator) = self.coordinator_node.clone() else {
            return;
        };
        if !self.status_changed.swap(false, Ordering::AcqRel) {
            return;
        }
        let status = self.get_maintainer_status();
        self.send_messages(vec![TargetMessage::new(
            coordinator,
            MessagePayload::MaintainerStatus(status),
        )]);
    }

    fn try_close_changefeed(&mut self) -> bool {
        if self.state != ComponentState::Stopped {
            self.status_changed.store(true, Ordering::Release);
        }
        if !self.cascade_removing {
            return true;
        }
        self.send_maintainer_close_request_to_all_nodes()
    }

    /// Broadcast close requests to the alive nodes that have not yet
    /// acknowledged; true when nobody is left.
    fn send_maintainer_close_request_to_all_nodes(&mut self) -> bool {
        let msgs: Vec<TargetMessage> = self
            .env
            .node_manager
            .get_alive_nodes()
            .into_keys()
            .filter(|node| !self.nodes_closed.contains(node))
            .map(|node| {
                TargetMessage::new(
                    node,
                    MessagePayload::MaintainerCloseRequest(MaintainerCloseRequest {
                        changefeed_id: self.id.to_pb(),
                    }),
                )
            })
            .collect();
        let done = msgs.is_empty();
        self.send_messages(msgs);
        done
    }

    fn send_messages(&self, msgs: Vec<TargetMessage>) {
        for msg in msgs {
            if let Err(e) = self.env.message_center.send(msg) {
                debug!(changefeed = %self.id, error = %e, "failed to send maintainer message");
            }
        }
    }

    /// Cache the error; the next status report surfaces it to the
    /// coordinator.
    fn handle_error(&mut self, err: MetaError) {
        warn!(changefeed = %self.id, error = ?err, "maintainer error");
        let mut running = self.running_errors.lock();
        running.errors.insert(
            self.env.self_node.clone(),
            RunningError {
                time: current_physical().to_string(),
                node: self.env.self_node.to_string(),
                code: err.code().to_owned(),
                message: err.to_string(),
            },
        );
        self.status_changed.store(true, Ordering::Release);
    }

    fn close(&mut self) {
        self.env
            .node_manager
            .unregister_node_change_handler(&format!("maintainer-{}", self.id));
        self.env
            .metrics
            .remove_changefeed(&self.id.namespace, &self.id.name);
        self.controller.stop();
        info!(
            changefeed = %self.id,
            removed = self.removed,
            checkpoint_ts = self.watermark.checkpoint_ts,
            "changefeed maintainer closed"
        );
    }

    #[cfg(test)]
    fn force_checkpoint_due(&mut self) {
        self.last_checkpoint_time = Instant::now() - CHECKPOINT_MIN_INTERVAL;
    }
}

fn new_bootstrap_fn(
    config: &ChangefeedConfig,
) -> MetaResult<crate::bootstrap::NewBootstrapFn> {
    // Only the dispatcher-facing subset travels in the bootstrap request.
    let config_bytes = serde_json::to_vec(config)?;
    let changefeed_id = config.changefeed_id().to_pb();
    Ok(Box::new(move |node: &NodeId| {
        info!(changefeed = %changefeed_id, %node, "send maintainer bootstrap message");
        TargetMessage::new(
            node.clone(),
            MessagePayload::MaintainerBootstrapRequest(MaintainerBootstrapRequest {
                changefeed_id: changefeed_id.clone(),
                config: config_bytes.clone(),
            }),
        )
    }))
}

#[cfg(test)]
mod tests {
    use rivulet_common::config::{FilterConfig, SchedulerConfig};
    use rivulet_pb::{ScheduleAction, ScheduleDispatcherRequest, TableSpanStatus};

    use super::*;
    use crate::manager::NodeInfo;
    use crate::messaging::CollectingMessageCenter;

    struct FixedTables(Vec<Table>);

    impl TableSetSource for FixedTables {
        fn get_all_physical_tables(
            &self,
            _snap_ts: Ts,
            _filter: &Filter,
        ) -> MetaResult<Vec<Table>> {
            Ok(self.0.clone())
        }
    }

    fn table(table_id: i64) -> Table {
        Table {
            schema_id: 1,
            schema_name: "app".to_owned(),
            table_id,
            table_name: format!("t{table_id}"),
        }
    }

    fn new_maintainer(
        table_ids: &[i64],
        nodes: &[&str],
        add_batch: usize,
    ) -> (Maintainer, Arc<CollectingMessageCenter>) {
        let (env, mc) = Env::for_test(NodeId::from("node-a"));
        for node in nodes {
            env.node_manager
                .register_node(NodeInfo::new(NodeId::from(*node), "127.0.0.1:8300"));
        }
        let config = ChangefeedConfig {
            namespace: "default".to_owned(),
            name: "feed".to_owned(),
            sink_uri: "mysql://127.0.0.1:4000".to_owned(),
            start_ts: 1000,
            target_ts: 0,
            force_replicate: false,
            filter: FilterConfig::default(),
            enable_sync_point: false,
            sync_point_interval_ms: 0,
            scheduler: SchedulerConfig {
                batch_size: 16,
                add_table_batch_size: add_batch,
                ..Default::default()
            },
        };
        let tables = table_ids.iter().copied().map(table).collect();
        let maintainer =
            Maintainer::new(config, env, Arc::new(FixedTables(tables)), None).unwrap();
        (maintainer, mc)
    }

    fn message(from: &str, payload: MessagePayload) -> Event {
        Event::Message(IncomingMessage {
            from: NodeId::from(from),
            payload,
        })
    }

    /// Drive initialize and answer the bootstrap requests with empty
    /// responses from every node.
    fn bootstrap(maintainer: &mut Maintainer, mc: &CollectingMessageCenter, table_ids: &[i64]) {
        let tables = table_ids.iter().copied().map(table).collect();
        maintainer.handle_event(Event::InitDone(Ok(tables)));
        let requests = mc.take();
        assert!(!requests.is_empty());
        for request in requests {
            assert!(matches!(
                request.payload,
                MessagePayload::MaintainerBootstrapRequest(_)
            ));
            maintainer.handle_event(Event::Message(IncomingMessage {
                from: request.target,
                payload: MessagePayload::MaintainerBootstrapResponse(
                    MaintainerBootstrapResponse {
                        changefeed_id: "default/feed".to_owned(),
                        spans: Vec::new(),
                    },
                ),
            }));
        }
    }

    /// Drain the captured create/remove dispatcher requests.
    fn schedule_requests(
        mc: &CollectingMessageCenter,
    ) -> Vec<(NodeId, ScheduleDispatcherRequest)> {
        mc.take()
            .into_iter()
            .filter_map(|msg| match msg.payload {
                MessagePayload::ScheduleDispatcher(req) => Some((msg.target, req)),
                _ => None,
            })
            .collect()
    }

    /// Answer every pending create request with a Working heartbeat from its
    /// target node, then let the executor reap the finished operators.
    fn ack_creates_as_working(
        maintainer: &mut Maintainer,
        requests: &[(NodeId, ScheduleDispatcherRequest)],
        checkpoint_ts: Ts,
    ) {
        for (node, request) in requests {
            if request.schedule_action() != ScheduleAction::Create {
                continue;
            }
            let status = TableSpanStatus {
                id: request.config.as_ref().unwrap().dispatcher_id.clone(),
                component_status: ComponentState::Working as i32,
                checkpoint_ts,
                event_size_per_second: 0.0,
            };
            maintainer.handle_event(Event::Message(IncomingMessage {
                from: node.clone(),
                payload: MessagePayload::HeartBeat(HeartBeatRequest {
                    changefeed_id: "default/feed".to_owned(),
                    watermark: None,
                    statuses: vec![status],
                    warning: None,
                    err: None,
                }),
            }));
        }
        maintainer.controller.operator_controller().execute();
    }

    fn heartbeat_watermark(maintainer: &mut Maintainer, from: &str, checkpoint: Ts, resolved: Ts) {
        maintainer.handle_event(message(
            from,
            MessagePayload::HeartBeat(HeartBeatRequest {
                changefeed_id: "default/feed".to_owned(),
                watermark: Some(Watermark {
                    checkpoint_ts: checkpoint,
                    resolved_ts: resolved,
                }),
                statuses: Vec::new(),
                warning: None,
                err: None,
            }),
        ));
    }

    /// Replicating table replicas per node, the DDL span excluded.
    fn distribution(maintainer: &Maintainer) -> HashMap<String, usize> {
        let db = maintainer.controller.replication_db();
        let mut counts = HashMap::new();
        for replica in db.all_replicas() {
            if rivulet_common::span::is_ddl_span(replica.span()) {
                continue;
            }
            if let Some(node) = replica.node() {
                *counts.entry(node.to_string()).or_default() += 1;
            }
        }
        counts
    }

    #[test]
    fn test_cold_start_round_robin_two_ticks() {
        let (mut maintainer, mc) = new_maintainer(&[101, 102, 103, 104], &["node-a", "node-b"], 2);
        bootstrap(&mut maintainer, &mc, &[101, 102, 103, 104]);
        let db = maintainer.controller.replication_db().clone();
        assert_eq!(db.absent_size(), 4);
        // The DDL-span dispatcher is pinned to the maintainer's node.
        assert_eq!(db.scheduling_size(), 1);

        // Tick 1: two adds, one per node.
        maintainer.handle_event(Event::Period);
        maintainer.controller.operator_controller().execute();
        let requests = schedule_requests(&mc);
        let creates: Vec<_> = requests
            .iter()
            .filter(|(_, req)| req.schedule_action() == ScheduleAction::Create)
            .collect();
        // Two table spans plus the DDL span.
        assert_eq!(creates.len(), 3);
        let table_targets: HashSet<&NodeId> = creates
            .iter()
            .filter(|(_, req)| req.config.as_ref().unwrap().span.as_ref().unwrap().table_id != 0)
            .map(|(node, _)| node)
            .collect();
        assert_eq!(table_targets.len(), 2);
        ack_creates_as_working(&mut maintainer, &requests, 1000);

        // Tick 2: the remaining two.
        maintainer.handle_event(Event::Period);
        maintainer.controller.operator_controller().execute();
        let requests = schedule_requests(&mc);
        ack_creates_as_working(&mut maintainer, &requests, 1000);

        let dist = distribution(&maintainer);
        assert_eq!(dist["node-a"], 2);
        assert_eq!(dist["node-b"], 2);
        assert!(maintainer.controller.schedule_finished());

        // Checkpoint starts at the start ts and never drops below it.
        assert_eq!(maintainer.checkpoint_ts(), 1000);
        heartbeat_watermark(&mut maintainer, "node-a", 900, 950);
        heartbeat_watermark(&mut maintainer, "node-b", 900, 950);
        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1000);
    }

    #[test]
    fn test_checkpoint_advances_and_is_monotone() {
        let (mut maintainer, mc) = new_maintainer(&[101, 102], &["node-a", "node-b"], 50);
        bootstrap(&mut maintainer, &mc, &[101, 102]);
        maintainer.handle_event(Event::Period);
        maintainer.controller.operator_controller().execute();
        let requests = schedule_requests(&mc);
        ack_creates_as_working(&mut maintainer, &requests, 1000);
        assert!(maintainer.controller.schedule_finished());

        // A node with replicas but no reported watermark blocks advancement.
        heartbeat_watermark(&mut maintainer, "node-a", 1500, 1600);
        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1000);

        heartbeat_watermark(&mut maintainer, "node-b", 1400, 1700);
        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1400);

        // A regressed source watermark never moves the checkpoint back.
        heartbeat_watermark(&mut maintainer, "node-a", 1200, 1300);
        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1400);
    }

    #[test]
    fn test_node_lost_reassigns_and_checkpoint_holds() {
        let (mut maintainer, mc) = new_maintainer(&[101, 102, 103, 104], &["node-a", "node-b"], 50);
        bootstrap(&mut maintainer, &mc, &[101, 102, 103, 104]);
        maintainer.handle_event(Event::Period);
        maintainer.controller.operator_controller().execute();
        let requests = schedule_requests(&mc);
        ack_creates_as_working(&mut maintainer, &requests, 1000);
        heartbeat_watermark(&mut maintainer, "node-a", 1500, 1600);
        heartbeat_watermark(&mut maintainer, "node-b", 1500, 1600);
        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1500);

        // Node b vanishes: its replicas return to absent and get reassigned
        // to node a within the next tick.
        let node_b = NodeId::from("node-b");
        let lost: Vec<_> = maintainer
            .controller
            .replication_db()
            .get_by_node(&node_b)
            .iter()
            .map(|replica| replica.table_id())
            .collect();
        assert!(!lost.is_empty());
        maintainer.env.node_manager.remove_node(&node_b);
        maintainer.handle_event(Event::Period);
        maintainer.controller.operator_controller().execute();
        let requests = schedule_requests(&mc);
        assert!(requests
            .iter()
            .all(|(node, _)| node == &NodeId::from("node-a")));
        ack_creates_as_working(&mut maintainer, &requests, 1500);

        let dist = distribution(&maintainer);
        assert_eq!(dist["node-a"], 4);
        assert!(!dist.contains_key("node-b"));
        assert_eq!(maintainer.checkpoint_ts(), 1500);

        maintainer.force_checkpoint_due();
        maintainer.handle_event(Event::Period);
        assert_eq!(maintainer.checkpoint_ts(), 1500);
    }

    #[test]
    fn test_cascade_remove_closes_every_node() {
        let (mut maintainer, mc) = new_maintainer(&[101], &["node-a", "node-b"], 50);
        bootstrap(&mut maintainer, &mc, &[101]);
        let gauge = maintainer
            .env
            .metrics
            .maintainer_count
            .with_label_values(&["default", "feed"]);
        assert_eq!(gauge.get(), 1);

        maintainer.handle_event(message(
            "coordinator",
            MessagePayload::RemoveMaintainerRequest(rivulet_pb::RemoveMaintainerRequest {
                changefeed_id: "default/feed".to_owned(),
                cascade: true,
            }),
        ));
        let close_targets: HashSet<NodeId> = mc
            .take()
            .into_iter()
            .filter(|msg| matches!(msg.payload, MessagePayload::MaintainerCloseRequest(_)))
            .map(|msg| msg.target)
            .collect();
        assert_eq!(close_targets.len(), 2);
        assert_eq!(maintainer.state(), ComponentState::Working);

        maintainer.handle_event(message(
            "node-a",
            MessagePayload::MaintainerCloseResponse(MaintainerCloseResponse {
                changefeed_id: "default/feed".to_owned(),
                success: true,
            }),
        ));
        mc.take();
        // Still waiting for node b; the tick keeps resending to it alone.
        maintainer.handle_event(Event::Period);
        let resent: Vec<NodeId> = mc
            .take()
            .into_iter()
            .filter(|msg| matches!(msg.payload, MessagePayload::MaintainerCloseRequest(_)))
            .map(|msg| msg.target)
            .collect();
        assert_eq!(resent, vec![NodeId::from("node-b")]);

        maintainer.handle_event(message(
            "node-b",
            MessagePayload::MaintainerCloseResponse(MaintainerCloseResponse {
                changefeed_id: "default/feed".to_owned(),
                success: true,
            }),
        ));
        assert_eq!(maintainer.state(), ComponentState::Stopped);
        assert_eq!(gauge.get(), 0);

        // Further events are ignored and the gauge is not decremented again.
        maintainer.handle_event(Event::Period);
        assert_eq!(gauge.get(), 0);
    }
}
