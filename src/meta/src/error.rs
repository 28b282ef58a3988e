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

use std::backtrace::Backtrace;
use std::sync::Arc;

use rivulet_common::filter::FilterError;
use rivulet_common::NodeId;

pub type MetaResult<T> = std::result::Result<T, MetaError>;

#[derive(thiserror::Error, Debug)]
enum MetaErrorInner {
    /// Invalid filter rules or sink URI; the changefeed fails, no retry.
    #[error("invalid changefeed config: {0}")]
    InvalidConfig(String),

    /// The upstream time/placement service is unreachable; retried forever.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("node {0} is not alive")]
    NodeNotAlive(NodeId),

    #[error("table {0} is not registered")]
    TableNotRegistered(i64),

    #[error("schema {0} not found")]
    SchemaNotFound(i64),

    #[error("start ts {start_ts} is smaller than gc ts {gc_ts}")]
    StartTsBelowGc { start_ts: u64, gc_ts: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(anyhow::Error),
}

/// The cheap-to-clone error type of the control plane. Carries the backtrace
/// of its creation site.
#[derive(thiserror::Error, Clone)]
#[error("{inner}")]
pub struct MetaError {
    inner: Arc<MetaErrorInner>,
    backtrace: Arc<Backtrace>,
}

impl std::fmt::Debug for MetaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)?;
        writeln!(f)?;
        write!(f, "  backtrace of `MetaError`:\n{}", self.backtrace)?;
        Ok(())
    }
}

impl From<MetaErrorInner> for MetaError {
    fn from(inner: MetaErrorInner) -> Self {
        Self {
            inner: Arc::new(inner),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

impl MetaError {
    pub fn invalid_config(msg: impl ToString) -> Self {
        MetaErrorInner::InvalidConfig(msg.to_string()).into()
    }

    pub fn upstream_unavailable(msg: impl ToString) -> Self {
        MetaErrorInner::UpstreamUnavailable(msg.to_string()).into()
    }

    pub fn node_not_alive(node: NodeId) -> Self {
        MetaErrorInner::NodeNotAlive(node).into()
    }

    pub fn table_not_registered(table_id: i64) -> Self {
        MetaErrorInner::TableNotRegistered(table_id).into()
    }

    pub fn schema_not_found(schema_id: i64) -> Self {
        MetaErrorInner::SchemaNotFound(schema_id).into()
    }

    pub fn start_ts_below_gc(start_ts: u64, gc_ts: u64) -> Self {
        MetaErrorInner::StartTsBelowGc { start_ts, gc_ts }.into()
    }

    pub fn is_start_ts_below_gc(&self) -> bool {
        matches!(&*self.inner, MetaErrorInner::StartTsBelowGc { .. })
    }

    pub fn is_table_not_registered(&self) -> bool {
        matches!(&*self.inner, MetaErrorInner::TableNotRegistered(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(&*self.inner, MetaErrorInner::UpstreamUnavailable(_))
    }

    /// The short code surfaced to users via `RunningError.code`.
    pub fn code(&self) -> &'static str {
        match &*self.inner {
            MetaErrorInner::InvalidConfig(_) => "CDC:ErrInvalidChangefeedConfig",
            MetaErrorInner::UpstreamUnavailable(_) => "CDC:ErrUpstreamUnavailable",
            MetaErrorInner::NodeNotAlive(_) => "CDC:ErrNodeNotAlive",
            MetaErrorInner::TableNotRegistered(_) => "CDC:ErrTableNotRegistered",
            MetaErrorInner::SchemaNotFound(_) => "CDC:ErrSchemaNotFound",
            MetaErrorInner::StartTsBelowGc { .. } => "CDC:ErrStartTsBeforeGC",
            MetaErrorInner::Storage(_) => "CDC:ErrStorage",
            MetaErrorInner::Codec(_) => "CDC:ErrCodec",
            MetaErrorInner::Internal(_) => "CDC:ErrInternal",
        }
    }
}

impl From<anyhow::Error> for MetaError {
    fn from(e: anyhow::Error) -> Self {
        MetaErrorInner::Internal(e).into()
    }
}

impl From<rocksdb::Error> for MetaError {
    fn from(e: rocksdb::Error) -> Self {
        MetaErrorInner::Storage(e).into()
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaErrorInner::Codec(e).into()
    }
}

impl From<FilterError> for MetaError {
    fn from(e: FilterError) -> Self {
        MetaErrorInner::InvalidConfig(e.to_string()).into()
    }
}
