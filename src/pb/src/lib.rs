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

//! Wire messages exchanged between the coordinator, the per-changefeed
//! maintainers and the dispatcher managers on worker nodes.
//!
//! The RPC transport itself lives outside this workspace; only the message
//! shapes and their field numbering are defined here, as hand-rolled
//! [`prost::Message`] types.

/// Progress of one changefeed or one dispatcher.
///
/// `checkpoint_ts <= resolved_ts` always holds for a well-formed watermark.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Watermark {
    #[prost(uint64, tag = "1")]
    pub checkpoint_ts: u64,
    #[prost(uint64, tag = "2")]
    pub resolved_ts: u64,
}

impl Watermark {
    pub fn new(ts: u64) -> Self {
        Self {
            checkpoint_ts: ts,
            resolved_ts: ts,
        }
    }

    /// The identity of [`Watermark::update_min`]: both fields at `u64::MAX`.
    pub fn max_sentinel() -> Self {
        Self {
            checkpoint_ts: u64::MAX,
            resolved_ts: u64::MAX,
        }
    }

    /// Fold another watermark in, keeping the minimum of both fields.
    pub fn update_min(&mut self, other: Watermark) {
        self.checkpoint_ts = self.checkpoint_ts.min(other.checkpoint_ts);
        self.resolved_ts = self.resolved_ts.min(other.resolved_ts);
    }
}

/// A half-open key range `[start_key, end_key)` within one table.
#[derive(Clone, PartialEq, Eq, Hash, ::prost::Message)]
pub struct TableSpan {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: ::prost::alloc::vec::Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ComponentState {
    Absent = 0,
    Preparing = 1,
    Prepared = 2,
    Working = 3,
    Stopped = 4,
}

/// Per-dispatcher progress reported inside a heartbeat.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableSpanStatus {
    /// Dispatcher id, 16 raw uuid bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(enumeration = "ComponentState", tag = "2")]
    pub component_status: i32,
    #[prost(uint64, tag = "3")]
    pub checkpoint_ts: u64,
    /// Measured sink traffic, used by the split scheduler.
    #[prost(float, tag = "4")]
    pub event_size_per_second: f32,
}

/// A user-visible error or warning carried in heartbeats and statuses.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct RunningError {
    #[prost(string, tag = "1")]
    pub time: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub node: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub code: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
}

/// Unsolicited per-node report, ~1 Hz, from a dispatcher manager to the
/// maintainer of the named changefeed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartBeatRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub watermark: ::core::option::Option<Watermark>,
    #[prost(message, repeated, tag = "3")]
    pub statuses: ::prost::alloc::vec::Vec<TableSpanStatus>,
    #[prost(message, optional, tag = "4")]
    pub warning: ::core::option::Option<RunningError>,
    #[prost(message, optional, tag = "5")]
    pub err: ::core::option::Option<RunningError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum InfluenceType {
    Normal = 0,
    Db = 1,
    All = 2,
}

/// The set of tables a blocking event concerns.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct InfluencedTables {
    #[prost(enumeration = "InfluenceType", tag = "1")]
    pub influence_type: i32,
    /// Set iff `influence_type == Normal`.
    #[prost(int64, repeated, tag = "2")]
    pub table_ids: ::prost::alloc::vec::Vec<i64>,
    /// Set iff `influence_type == Db`.
    #[prost(int64, tag = "3")]
    pub schema_id: i64,
}

/// A table to be created by the maintainer as a DDL side effect.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Table {
    #[prost(int64, tag = "1")]
    pub schema_id: i64,
    #[prost(int64, tag = "2")]
    pub table_id: i64,
    #[prost(string, tag = "3")]
    pub schema_name: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub table_name: ::prost::alloc::string::String,
}

/// Schema rebinding produced by cross-database renames.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct SchemaIdChange {
    #[prost(int64, tag = "1")]
    pub table_id: i64,
    #[prost(int64, tag = "2")]
    pub old_schema_id: i64,
    #[prost(int64, tag = "3")]
    pub new_schema_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum BlockStage {
    None = 0,
    Waiting = 1,
    Writing = 2,
    Done = 3,
}

/// One dispatcher's view of a blocking (or side-effect-only) event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct State {
    #[prost(bool, tag = "1")]
    pub is_blocked: bool,
    #[prost(uint64, tag = "2")]
    pub block_ts: u64,
    #[prost(message, optional, tag = "3")]
    pub block_tables: ::core::option::Option<InfluencedTables>,
    #[prost(message, optional, tag = "4")]
    pub need_dropped_tables: ::core::option::Option<InfluencedTables>,
    #[prost(message, repeated, tag = "5")]
    pub need_added_tables: ::prost::alloc::vec::Vec<Table>,
    #[prost(message, repeated, tag = "6")]
    pub updated_schemas: ::prost::alloc::vec::Vec<SchemaIdChange>,
    #[prost(bool, tag = "7")]
    pub is_sync_point: bool,
    #[prost(enumeration = "BlockStage", tag = "8")]
    pub stage: i32,
}

/// Dispatcher -> maintainer: report of a blocking event at some stage.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockStatusRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    /// Dispatcher id, 16 raw uuid bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "3")]
    pub state: ::core::option::Option<State>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum Action {
    Write = 0,
    Pass = 1,
}

/// Maintainer -> dispatcher: the verdict for one blocking event.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct DispatcherAction {
    #[prost(enumeration = "Action", tag = "1")]
    pub action: i32,
    #[prost(uint64, tag = "2")]
    pub commit_ts: u64,
    #[prost(bool, tag = "3")]
    pub is_sync_point: bool,
}

impl DispatcherAction {
    pub fn action(&self) -> Action {
        Action::try_from(self.action).unwrap_or(Action::Write)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub commit_ts: u64,
    #[prost(bool, tag = "2")]
    pub is_sync_point: bool,
}

/// Maintainer -> dispatcher: an ack for a received block status, an action
/// verdict, or both. Targets every dispatcher listed in `dispatcher_ids`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatcherStatus {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub dispatcher_ids: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
    #[prost(message, optional, tag = "2")]
    pub ack: ::core::option::Option<Ack>,
    #[prost(message, optional, tag = "3")]
    pub action: ::core::option::Option<DispatcherAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum ScheduleAction {
    Create = 0,
    Remove = 1,
}

/// The dispatcher-side identity and bounds of a scheduled span.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DispatcherConfig {
    /// Dispatcher id, 16 raw uuid bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub dispatcher_id: ::prost::alloc::vec::Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub span: ::core::option::Option<TableSpan>,
    #[prost(int64, tag = "3")]
    pub schema_id: i64,
    #[prost(uint64, tag = "4")]
    pub start_ts: u64,
}

/// Maintainer -> node: create or remove one dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleDispatcherRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "2")]
    pub config: ::core::option::Option<DispatcherConfig>,
    #[prost(enumeration = "ScheduleAction", tag = "3")]
    pub schedule_action: i32,
}

impl ScheduleDispatcherRequest {
    pub fn schedule_action(&self) -> ScheduleAction {
        ScheduleAction::try_from(self.schedule_action).unwrap_or(ScheduleAction::Create)
    }
}

/// Maintainer -> node: report every dispatcher you already own for this
/// changefeed. `config` is the JSON-encoded dispatcher-facing changefeed
/// config, opaque to the control plane.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerBootstrapRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub config: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BootstrapTableSpan {
    /// Dispatcher id, 16 raw uuid bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub id: ::prost::alloc::vec::Vec<u8>,
    #[prost(int64, tag = "2")]
    pub schema_id: i64,
    #[prost(message, optional, tag = "3")]
    pub span: ::core::option::Option<TableSpan>,
    #[prost(enumeration = "ComponentState", tag = "4")]
    pub component_status: i32,
    #[prost(uint64, tag = "5")]
    pub checkpoint_ts: u64,
}

impl BootstrapTableSpan {
    pub fn component_status(&self) -> ComponentState {
        ComponentState::try_from(self.component_status).unwrap_or(ComponentState::Absent)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerBootstrapResponse {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub spans: ::prost::alloc::vec::Vec<BootstrapTableSpan>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerCloseRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerCloseResponse {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub success: bool,
}

/// Coordinator -> node owning the maintainer.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RemoveMaintainerRequest {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(bool, tag = "2")]
    pub cascade: bool,
}

/// Coordinator -> maintainer -> node of the DDL-span dispatcher.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckpointTsMessage {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub checkpoint_ts: u64,
}

/// Maintainer -> coordinator: periodic changefeed status.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MaintainerStatus {
    #[prost(string, tag = "1")]
    pub changefeed_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub feed_state: ::prost::alloc::string::String,
    #[prost(enumeration = "ComponentState", tag = "3")]
    pub state: i32,
    #[prost(uint64, tag = "4")]
    pub checkpoint_ts: u64,
    #[prost(message, repeated, tag = "5")]
    pub warning: ::prost::alloc::vec::Vec<RunningError>,
    #[prost(message, repeated, tag = "6")]
    pub err: ::prost::alloc::vec::Vec<RunningError>,
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_watermark_min_merge() {
        let mut w = Watermark::max_sentinel();
        w.update_min(Watermark {
            checkpoint_ts: 100,
            resolved_ts: 200,
        });
        w.update_min(Watermark {
            checkpoint_ts: 150,
            resolved_ts: 180,
        });
        assert_eq!(w.checkpoint_ts, 100);
        assert_eq!(w.resolved_ts, 180);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let req = HeartBeatRequest {
            changefeed_id: "default/feed".into(),
            watermark: Some(Watermark::new(42)),
            statuses: vec![TableSpanStatus {
                id: vec![1; 16],
                component_status: ComponentState::Working as i32,
                checkpoint_ts: 42,
                event_size_per_second: 1.5,
            }],
            warning: None,
            err: None,
        };
        let bytes = req.encode_to_vec();
        let decoded = HeartBeatRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, decoded);
        assert_eq!(
            decoded.statuses[0].component_status(),
            ComponentState::Working
        );
    }
}
