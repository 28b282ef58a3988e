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

use std::sync::Arc;

use prometheus::core::{AtomicI64, AtomicU64, GenericCounterVec, GenericGaugeVec};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, Registry,
};

/// All control-plane metrics, labelled by changefeed namespace and name.
#[derive(Debug)]
pub struct MetaMetrics {
    pub registry: Registry,

    pub changefeed_checkpoint_ts: GenericGaugeVec<AtomicI64>,
    pub changefeed_checkpoint_ts_lag: GenericGaugeVec<AtomicI64>,
    pub changefeed_resolved_ts: GenericGaugeVec<AtomicI64>,
    pub changefeed_resolved_ts_lag: GenericGaugeVec<AtomicI64>,
    pub changefeed_status: GenericGaugeVec<AtomicI64>,
    /// Number of running maintainers on this node.
    pub maintainer_count: GenericGaugeVec<AtomicI64>,
    pub table_count: GenericGaugeVec<AtomicI64>,
    /// Replica count per scheduling state, labelled (namespace, id, state).
    pub table_state_count: GenericGaugeVec<AtomicI64>,
    pub created_operator_count: GenericCounterVec<AtomicU64>,
    pub finished_operator_count: GenericCounterVec<AtomicU64>,
    pub operator_duration: HistogramVec,
    pub handle_event_duration: HistogramVec,
}

impl MetaMetrics {
    pub fn new(registry: Registry) -> Self {
        let changefeed_checkpoint_ts = register_int_gauge_vec_with_registry!(
            "changefeed_checkpoint_ts",
            "The checkpoint of a changefeed, physical milliseconds",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let changefeed_checkpoint_ts_lag = register_int_gauge_vec_with_registry!(
            "changefeed_checkpoint_ts_lag",
            "Checkpoint lag of a changefeed in seconds",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let changefeed_resolved_ts = register_int_gauge_vec_with_registry!(
            "changefeed_resolved_ts",
            "The resolved ts of a changefeed, physical milliseconds",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let changefeed_resolved_ts_lag = register_int_gauge_vec_with_registry!(
            "changefeed_resolved_ts_lag",
            "Resolved ts lag of a changefeed in seconds",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let changefeed_status = register_int_gauge_vec_with_registry!(
            "changefeed_status",
            "Component state of a changefeed maintainer",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let maintainer_count = register_int_gauge_vec_with_registry!(
            "maintainer_count",
            "Number of maintainers running on this node",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let table_count = register_int_gauge_vec_with_registry!(
            "maintainer_table_count",
            "Number of replicas owned by a maintainer",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();
        let table_state_count = register_int_gauge_vec_with_registry!(
            "maintainer_table_state_count",
            "Number of replicas per scheduling state",
            &["namespace", "changefeed", "state"],
            registry
        )
        .unwrap();
        let created_operator_count = register_int_counter_vec_with_registry!(
            "maintainer_created_operator_count",
            "Operators created, by type",
            &["namespace", "changefeed", "type"],
            registry
        )
        .unwrap();
        let finished_operator_count = register_int_counter_vec_with_registry!(
            "maintainer_finished_operator_count",
            "Operators finished, by type",
            &["namespace", "changefeed", "type"],
            registry
        )
        .unwrap();
        let operator_duration = register_histogram_vec_with_registry!(
            "maintainer_operator_duration_seconds",
            "Time from operator creation to finish",
            &["namespace", "changefeed", "type"],
            registry
        )
        .unwrap();
        let handle_event_duration = register_histogram_vec_with_registry!(
            "maintainer_handle_event_duration_seconds",
            "Time spent handling one maintainer event",
            &["namespace", "changefeed"],
            registry
        )
        .unwrap();

        Self {
            registry,
            changefeed_checkpoint_ts,
            changefeed_checkpoint_ts_lag,
            changefeed_resolved_ts,
            changefeed_resolved_ts_lag,
            changefeed_status,
            maintainer_count,
            table_count,
            table_state_count,
            created_operator_count,
            finished_operator_count,
            operator_duration,
            handle_event_duration,
        }
    }

    pub fn for_test() -> Arc<Self> {
        Arc::new(Self::new(Registry::new()))
    }

    /// Drop every per-changefeed series when a maintainer closes.
    pub fn remove_changefeed(&self, namespace: &str, changefeed: &str) {
        let labels = &[namespace, changefeed];
        let _ = self.changefeed_checkpoint_ts.remove_label_values(labels);
        let _ = self.changefeed_checkpoint_ts_lag.remove_label_values(labels);
        let _ = self.changefeed_resolved_ts.remove_label_values(labels);
        let _ = self.changefeed_resolved_ts_lag.remove_label_values(labels);
        let _ = self.changefeed_status.remove_label_values(labels);
        let _ = self.table_count.remove_label_values(labels);
        let _ = self.handle_event_duration.remove_label_values(labels);
    }
}

impl Default for MetaMetrics {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}
