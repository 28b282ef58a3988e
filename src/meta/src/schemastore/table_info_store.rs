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

use parking_lot::{Condvar, Mutex};
use rivulet_common::ddl::ActionType;
use rivulet_common::table::TableInfo;
use rivulet_common::Ts;
use tracing::warn;

use super::ddl_event::PersistedDdlEvent;
use crate::{MetaError, MetaResult};

/// All schema versions of one registered table, ordered by version.
///
/// The store is built lazily from the kv snapshot plus the table's DDL
/// history. Readers block until that initialization finishes; DDLs arriving
/// during the build are buffered and folded in at the end.
pub struct VersionedTableInfoStore {
    table_id: i64,
    inner: Mutex<Inner>,
    initialized_cond: Condvar,
}

#[derive(Default)]
struct Inner {
    initialized: bool,
    /// `(version, info)` ascending by version.
    infos: Vec<(Ts, Arc<TableInfo>)>,
    /// DDLs received while the store was still being built.
    pending: Vec<PersistedDdlEvent>,
}

impl VersionedTableInfoStore {
    pub fn new(table_id: i64) -> Self {
        Self {
            table_id,
            inner: Mutex::new(Inner::default()),
            initialized_cond: Condvar::new(),
        }
    }

    pub fn table_id(&self) -> i64 {
        self.table_id
    }

    /// Block until the builder marks the store ready.
    pub fn wait_initialized(&self) {
        let mut inner = self.inner.lock();
        while !inner.initialized {
            self.initialized_cond.wait(&mut inner);
        }
    }

    /// The latest info with `version <= ts`.
    pub fn get_table_info(&self, ts: Ts) -> MetaResult<Arc<TableInfo>> {
        let mut inner = self.inner.lock();
        while !inner.initialized {
            self.initialized_cond.wait(&mut inner);
        }
        let idx = inner.infos.partition_point(|(version, _)| *version <= ts);
        if idx == 0 {
            return Err(MetaError::from(anyhow::anyhow!(
                "no table info of table {} at ts {}, earliest version {:?}",
                self.table_id,
                ts,
                inner.infos.first().map(|(v, _)| *v)
            )));
        }
        Ok(inner.infos[idx - 1].1.clone())
    }

    /// Seed the base version read from the kv snapshot. Builder-only.
    pub(super) fn add_initial_table_info(&self, info: TableInfo) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.initialized && inner.infos.is_empty());
        inner.infos.push((info.version, Arc::new(info)));
    }

    /// Apply one DDL from the live ingestion path. Buffered if the store is
    /// still building.
    pub(super) fn apply_ddl(&self, event: &PersistedDdlEvent) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            inner.pending.push(event.clone());
            return;
        }
        Self::do_apply(&mut inner, self.table_id, event);
    }

    /// Apply one DDL read back from disk during the build. Builder-only.
    pub(super) fn apply_ddl_from_persist_storage(&self, event: &PersistedDdlEvent) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.initialized);
        Self::do_apply(&mut inner, self.table_id, event);
    }

    /// Fold in buffered DDLs and release waiting readers.
    pub(super) fn set_initialized(&self) {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        for event in &pending {
            Self::do_apply(&mut inner, self.table_id, event);
        }
        inner.initialized = true;
        self.initialized_cond.notify_all();
    }

    /// Drop versions no longer readable below `gc_ts`, keeping the newest one
    /// at or below it as the new base.
    pub(super) fn gc(&self, gc_ts: Ts) {
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return;
        }
        let idx = inner.infos.partition_point(|(version, _)| *version <= gc_ts);
        if idx > 1 {
            inner.infos.drain(..idx - 1);
        }
    }

    fn do_apply(inner: &mut Inner, table_id: i64, event: &PersistedDdlEvent) {
        if let Some((last, _)) = inner.infos.last() {
            // Replayed history overlaps with live ingestion; versions only
            // ever move forward.
            if event.finished_ts <= *last {
                return;
            }
        }
        match event.action {
            ActionType::DropTable => {
                // The final version stays readable until gc passes it.
            }
            _ => {
                let Some(info) = &event.table_info else {
                    warn!(
                        table_id,
                        action = ?event.action,
                        finished_ts = event.finished_ts,
                        "ddl event without table info, skip"
                    );
                    return;
                };
                let mut info = info.clone();
                info.version = event.finished_ts;
                inner.infos.push((event.finished_ts, Arc::new(info)));
            }
        }
    }
}
