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

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub rules: Vec<String>,
}

/// Knobs of the per-changefeed scheduling machinery.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Max operators dispatched per executor round.
    pub batch_size: usize,
    /// Max new replicas the basic scheduler creates per tick.
    pub add_table_batch_size: usize,
    /// Minimum interval between balance passes, in milliseconds.
    pub check_balance_interval_ms: u64,
    /// Allow one table's spans to live on several nodes (enables split).
    pub enable_table_across_nodes: bool,
    /// Split a replica whose event rate exceeds this, bytes per second.
    pub split_event_size_threshold: f32,
    /// Merge neighbours whose event rate is each below this.
    pub merge_event_size_low_water: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            add_table_batch_size: 50,
            check_balance_interval_ms: 60_000,
            enable_table_across_nodes: false,
            split_event_size_threshold: 2048.0 * 1024.0,
            merge_event_size_low_water: 128.0 * 1024.0,
        }
    }
}

/// The changefeed definition owned by the coordinator. The subset a
/// dispatcher manager needs is serialized into the bootstrap request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangefeedConfig {
    pub namespace: String,
    pub name: String,
    pub sink_uri: String,
    pub start_ts: u64,
    #[serde(default)]
    pub target_ts: u64,
    #[serde(default)]
    pub force_replicate: bool,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub enable_sync_point: bool,
    #[serde(default)]
    pub sync_point_interval_ms: u64,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl ChangefeedConfig {
    pub fn changefeed_id(&self) -> crate::id::ChangefeedId {
        crate::id::ChangefeedId::new(self.namespace.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip_with_defaults() {
        let json =
            r#"{"namespace":"default","name":"feed","sink_uri":"mysql://h:4000","start_ts":1000}"#;
        let config: ChangefeedConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.scheduler.batch_size,
            SchedulerConfig::default().batch_size
        );
        let back: ChangefeedConfig =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(config, back);
    }
}
