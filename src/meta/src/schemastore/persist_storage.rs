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

//! The durable schema store: a kv snapshot of the schema at `gc_ts`, the
//! ordered DDL event log above it, and the progress metadata. Serves
//! point-in-time table sets and versioned table infos to maintainers and
//! dispatchers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rivulet_common::filter::Filter;
use rivulet_common::table::{Table, TableInfo};
use rivulet_common::Ts;
use rocksdb::{Options, WriteBatch, DB};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::ddl_event::{
    fill_influenced_tables, fill_schema_name, should_skip_ddl, update_ddl_history,
    update_schema_maps, BasicDatabaseInfo, BasicTableInfo, DdlEvent, PersistedDdlEvent,
};
use super::disk::{self, TableSnapRecord, UpperBoundMeta};
use super::table_info_store::VersionedTableInfoStore;
use crate::{MetaError, MetaResult};

const DATA_DIR: &str = "schema_store";
const GC_INTERVAL: Duration = Duration::from_secs(300);
const UPPER_BOUND_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Asks the upstream placement service how far GC may advance.
pub trait GcSafepointProvider: Send + Sync {
    fn gc_safepoint(&self) -> MetaResult<Ts>;
}

/// Fetches the full schema snapshot from the upstream store when the on-disk
/// data is not reusable.
pub trait SchemaSnapshotLoader: Send + Sync {
    fn load_snapshot(&self, snap_ts: Ts) -> MetaResult<SchemaSnapshot>;
}

pub struct SchemaSnapshot {
    pub databases: Vec<DatabaseSnapshotEntry>,
    pub tables: Vec<TableSnapshotEntry>,
}

pub struct DatabaseSnapshotEntry {
    pub schema_id: i64,
    pub name: String,
}

pub struct TableSnapshotEntry {
    pub schema_id: i64,
    pub info: TableInfo,
}

struct StorageInner {
    gc_ts: Ts,
    upper_bound: UpperBoundMeta,
    upper_bound_changed: bool,
    table_map: HashMap<i64, BasicTableInfo>,
    /// All live databases; entries leave only through drop-schema DDLs.
    database_map: HashMap<i64, BasicDatabaseInfo>,
    /// Per table, the sorted finished ts of its DDL events.
    tables_ddl_history: HashMap<i64, Vec<Ts>>,
    /// Finished ts of events that may create, drop or rename tables.
    table_trigger_ddl_history: Vec<Ts>,
    /// Only tables currently used by dispatchers.
    table_info_store_map: HashMap<i64, Arc<VersionedTableInfoStore>>,
    table_registered_count: HashMap<i64, usize>,
}

/// The persistent schema storage. One per process, shared by every
/// changefeed.
///
/// Readers take a rocksdb snapshot while holding the in-memory lock and
/// release the lock before touching disk, so slow disk reads never stall
/// ingestion.
pub struct PersistentStorage {
    db: Arc<DB>,
    inner: RwLock<StorageInner>,
}

impl PersistentStorage {
    /// Open the store under `root`. Reuses the on-disk data when its range
    /// still covers the upstream gc safepoint, otherwise rebuilds from a
    /// fresh upstream snapshot at the safepoint.
    pub fn new(
        root: &Path,
        gc_safepoint: Ts,
        loader: &dyn SchemaSnapshotLoader,
    ) -> MetaResult<Self> {
        let path = root.join(DATA_DIR);
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, &path)?;
        let gc_ts = disk::read_gc_ts(&db)?;
        let upper_bound = disk::read_upper_bound(&db)?;
        if let Some(gc_ts) = gc_ts {
            assert!(
                gc_safepoint >= gc_ts,
                "gc safe point should never go back, safepoint {gc_safepoint}, gc ts {gc_ts}"
            );
        }

        let reusable = match (gc_ts, upper_bound) {
            (Some(_), Some(upper_bound)) => gc_safepoint < upper_bound.resolved_ts,
            _ => false,
        };

        if reusable {
            let gc_ts = gc_ts.unwrap();
            let upper_bound = upper_bound.unwrap();
            info!(gc_ts, ?upper_bound, "schema store initialize from disk");
            Self::initialize_from_disk(db, gc_ts, upper_bound)
        } else {
            // Stale data range; start over from the upstream snapshot.
            drop(db);
            DB::destroy(&opts, &path)?;
            let db = DB::open(&opts, &path)?;
            info!(
                snap_ts = gc_safepoint,
                "schema store initialize from upstream snapshot"
            );
            let snapshot = loader.load_snapshot(gc_safepoint)?;
            Self::initialize_from_snapshot(db, snapshot, gc_safepoint)
        }
    }

    fn initialize_from_disk(db: DB, gc_ts: Ts, upper_bound: UpperBoundMeta) -> MetaResult<Self> {
        let snap = db.snapshot();
        let mut database_map = disk::load_databases_in_kv_snap(&snap, gc_ts)?;
        let mut table_map = disk::load_tables_in_kv_snap(&snap, gc_ts)?;

        let mut tables_ddl_history: HashMap<i64, Vec<Ts>> = HashMap::new();
        let mut table_trigger_ddl_history = Vec::new();
        let events = disk::scan_ddl_events(&snap, gc_ts, upper_bound.finished_ddl_ts)?;
        for event in &events {
            if should_skip_ddl(event, &database_map, &table_map) {
                continue;
            }
            update_ddl_history(
                event,
                &database_map,
                &table_map,
                &mut tables_ddl_history,
                &mut table_trigger_ddl_history,
            );
            update_schema_maps(event, &mut database_map, &mut table_map);
        }
        drop(snap);

        Ok(Self {
            db: Arc::new(db),
            inner: RwLock::new(StorageInner {
                gc_ts,
                upper_bound,
                upper_bound_changed: false,
                table_map,
                database_map,
                tables_ddl_history,
                table_trigger_ddl_history,
                table_info_store_map: HashMap::new(),
                table_registered_count: HashMap::new(),
            }),
        })
    }

    fn initialize_from_snapshot(db: DB, snapshot: SchemaSnapshot, snap_ts: Ts) -> MetaResult<Self> {
        let mut database_map: HashMap<i64, BasicDatabaseInfo> = HashMap::new();
        for database in &snapshot.databases {
            database_map.insert(
                database.schema_id,
                BasicDatabaseInfo {
                    name: database.name.clone(),
                    tables: Default::default(),
                },
            );
        }
        let mut table_map = HashMap::new();
        let mut records = HashMap::new();
        for table in snapshot.tables {
            let table_id = table.info.id;
            let Some(database) = database_map.get_mut(&table.schema_id) else {
                return Err(MetaError::schema_not_found(table.schema_id));
            };
            database.tables.insert(table_id);
            table_map.insert(
                table_id,
                BasicTableInfo {
                    schema_id: table.schema_id,
                    name: table.info.name.clone(),
                    in_kv_snap: true,
                },
            );
            let mut info = table.info;
            info.version = snap_ts;
            records.insert(
                table_id,
                TableSnapRecord {
                    schema_id: table.schema_id,
                    info,
                },
            );
        }

        let upper_bound = UpperBoundMeta {
            finished_ddl_ts: 0,
            schema_version: 0,
            resolved_ts: snap_ts,
        };
        let mut batch = WriteBatch::default();
        disk::write_schema_snapshot(&mut batch, snap_ts, &database_map, &records)?;
        disk::write_gc_ts(&mut batch, snap_ts);
        db.write(batch)?;
        disk::write_upper_bound(&db, &upper_bound)?;

        info!(
            databases = database_map.len(),
            tables = table_map.len(),
            snap_ts,
            "schema store initialized from upstream snapshot"
        );
        Ok(Self {
            db: Arc::new(db),
            inner: RwLock::new(StorageInner {
                gc_ts: snap_ts,
                upper_bound,
                upper_bound_changed: false,
                table_map,
                database_map,
                tables_ddl_history: HashMap::new(),
                table_trigger_ddl_history: Vec::new(),
                table_info_store_map: HashMap::new(),
                table_registered_count: HashMap::new(),
            }),
        })
    }

    /// All physical tables visible at `snap_ts`, after the filter. The caller
    /// must ensure `snap_ts` is at or below the resolved ts.
    pub fn get_all_physical_tables(&self, snap_ts: Ts, filter: &Filter) -> MetaResult<Vec<Table>> {
        let snap = self.db.snapshot();
        let gc_ts = {
            let inner = self.inner.read();
            if snap_ts < inner.gc_ts {
                return Err(MetaError::start_ts_below_gc(snap_ts, inner.gc_ts));
            }
            inner.gc_ts
        };

        let mut database_map = disk::load_databases_in_kv_snap(&snap, gc_ts)?;
        let mut table_map = disk::load_tables_in_kv_snap(&snap, gc_ts)?;
        for event in disk::scan_ddl_events(&snap, gc_ts, snap_ts)? {
            if should_skip_ddl(&event, &database_map, &table_map) {
                continue;
            }
            update_schema_maps(&event, &mut database_map, &mut table_map);
        }

        let mut tables = Vec::with_capacity(table_map.len());
        for (table_id, basic) in &table_map {
            let schema_name = database_map
                .get(&basic.schema_id)
                .map(|database| database.name.clone())
                .unwrap_or_default();
            if filter.should_ignore_table(&schema_name, &basic.name) {
                continue;
            }
            tables.push(Table {
                schema_id: basic.schema_id,
                schema_name,
                table_id: *table_id,
                table_name: basic.name.clone(),
            });
        }
        tables.sort_by_key(|table| table.table_id);
        Ok(tables)
    }

    /// Reference-count a versioned info store for the table. The first
    /// registration builds the store from disk; concurrent registrations
    /// block until the build finishes.
    pub fn register_table(&self, table_id: i64, start_ts: Ts) -> MetaResult<()> {
        let (store, build) = {
            let mut inner = self.inner.write();
            if start_ts < inner.gc_ts {
                return Err(MetaError::start_ts_below_gc(start_ts, inner.gc_ts));
            }
            *inner.table_registered_count.entry(table_id).or_default() += 1;
            match inner.table_info_store_map.get(&table_id) {
                Some(store) => (store.clone(), false),
                None => {
                    let store = Arc::new(VersionedTableInfoStore::new(table_id));
                    inner.table_info_store_map.insert(table_id, store.clone());
                    (store, true)
                }
            }
        };

        if build {
            self.build_versioned_table_info_store(&store)
        } else {
            store.wait_initialized();
            Ok(())
        }
    }

    pub fn unregister_table(&self, table_id: i64) -> MetaResult<()> {
        let mut inner = self.inner.write();
        let count = inner.table_registered_count.entry(table_id).or_default();
        *count = count.saturating_sub(1);
        if *count == 0 {
            inner.table_registered_count.remove(&table_id);
            if inner.table_info_store_map.remove(&table_id).is_none() {
                return Err(MetaError::table_not_registered(table_id));
            }
        }
        Ok(())
    }

    /// The latest table info with `version <= ts`.
    pub fn get_table_info(&self, table_id: i64, ts: Ts) -> MetaResult<Arc<TableInfo>> {
        let store = {
            let inner = self.inner.read();
            inner
                .table_info_store_map
                .get(&table_id)
                .cloned()
                .ok_or_else(|| MetaError::table_not_registered(table_id))?
        };
        store.get_table_info(ts)
    }

    /// DDL events of one table with `finished_ts` in `(start, end]`,
    /// ascending. Stateless with respect to read position.
    pub fn fetch_table_ddl_events(
        &self,
        table_id: i64,
        start: Ts,
        end: Ts,
    ) -> MetaResult<Vec<DdlEvent>> {
        let (snap, target_ts) = {
            let inner = self.inner.read();
            if start < inner.gc_ts {
                return Err(MetaError::start_ts_below_gc(start, inner.gc_ts));
            }
            let Some(history) = inner.tables_ddl_history.get(&table_id) else {
                return Ok(Vec::new());
            };
            let idx = history.partition_point(|ts| *ts <= start);
            let target_ts: Vec<Ts> = history[idx..]
                .iter()
                .copied()
                .take_while(|ts| *ts <= end)
                .collect();
            if target_ts.is_empty() {
                return Ok(Vec::new());
            }
            (self.db.snapshot(), target_ts)
        };

        let mut events = Vec::with_capacity(target_ts.len());
        for ts in target_ts {
            let raw = disk::read_ddl_event(&snap, ts)?;
            events.push(DdlEvent::from_persisted(&raw));
        }
        Ok(events)
    }

    /// Up to `limit` table-topology DDL events in `(start, ∞)`, after the
    /// filter. Pagination is by the last returned `finished_ts`.
    pub fn fetch_table_trigger_ddl_events(
        &self,
        filter: &Filter,
        start: Ts,
        limit: usize,
    ) -> MetaResult<Vec<DdlEvent>> {
        {
            let inner = self.inner.read();
            if start < inner.gc_ts {
                return Err(MetaError::start_ts_below_gc(start, inner.gc_ts));
            }
        }

        let snap = self.db.snapshot();
        let mut events = Vec::new();
        let mut next_start_ts = start;
        loop {
            let target_ts: Vec<Ts> = {
                let inner = self.inner.read();
                let history = &inner.table_trigger_ddl_history;
                let idx = history.partition_point(|ts| *ts <= next_start_ts);
                history[idx..]
                    .iter()
                    .copied()
                    .take(limit - events.len())
                    .collect()
            };
            if target_ts.is_empty() {
                return Ok(events);
            }
            for ts in &target_ts {
                let raw = disk::read_ddl_event(&snap, *ts)?;
                let table_name = raw
                    .table_info
                    .as_ref()
                    .map(|info| info.name.as_str())
                    .unwrap_or(&raw.table_name);
                if filter.should_discard_ddl(raw.action, &raw.schema_name, table_name) {
                    continue;
                }
                events.push(DdlEvent::from_persisted(&raw));
            }
            if events.len() >= limit {
                return Ok(events);
            }
            next_start_ts = *target_ts.last().unwrap();
        }
    }

    /// Ingest events already ordered by `finished_ts`: fill in the schema
    /// name and influence fields, update the in-memory maps and histories,
    /// feed registered info stores, then append everything to disk. Events
    /// skipped as duplicates are still persisted so that replay after a
    /// restart skips them again.
    pub fn apply_sorted_ddls(&self, mut events: Vec<PersistedDdlEvent>) -> MetaResult<()> {
        {
            let mut inner = self.inner.write();
            let inner = &mut *inner;
            for event in &mut events {
                fill_schema_name(event, &inner.database_map);
                fill_influenced_tables(event, &inner.table_map);
                if should_skip_ddl(event, &inner.database_map, &inner.table_map) {
                    continue;
                }
                update_ddl_history(
                    event,
                    &inner.database_map,
                    &inner.table_map,
                    &mut inner.tables_ddl_history,
                    &mut inner.table_trigger_ddl_history,
                );
                update_schema_maps(event, &mut inner.database_map, &mut inner.table_map);
                Self::update_registered_store(&inner.table_info_store_map, event);
            }
        }
        disk::write_ddl_events(&self.db, &events)
    }

    fn update_registered_store(
        stores: &HashMap<i64, Arc<VersionedTableInfoStore>>,
        event: &PersistedDdlEvent,
    ) {
        use rivulet_common::ddl::ActionType;
        let applies = matches!(
            event.action,
            ActionType::DropTable | ActionType::TruncateTable
        ) || event.action.is_table_info_only();
        if !applies {
            return;
        }
        if let Some(store) = stores.get(&event.table_id) {
            store.apply_ddl(event);
        }
    }

    fn build_versioned_table_info_store(
        &self,
        store: &Arc<VersionedTableInfoStore>,
    ) -> MetaResult<()> {
        let table_id = store.table_id();
        // Snapshot before reading gc ts, so gc cannot delete data under us.
        let snap = self.db.snapshot();
        let (kv_snap_version, in_kv_snap, history) = {
            let inner = self.inner.read();
            let Some(basic) = inner.table_map.get(&table_id) else {
                panic!("table {table_id} not found when building info store");
            };
            (
                inner.gc_ts,
                basic.in_kv_snap,
                inner
                    .tables_ddl_history
                    .get(&table_id)
                    .cloned()
                    .unwrap_or_default(),
            )
        };

        if in_kv_snap {
            let record = disk::read_table_in_kv_snap(&snap, kv_snap_version, table_id)?
                .ok_or_else(|| {
                    MetaError::from(anyhow::anyhow!(
                        "table {table_id} missing from kv snapshot at {kv_snap_version}"
                    ))
                })?;
            let mut info = record.info;
            info.version = kv_snap_version;
            store.add_initial_table_info(info);
        }
        for ts in history {
            let event = disk::read_ddl_event(&snap, ts)?;
            store.apply_ddl_from_persist_storage(&event);
        }
        store.set_initialized();
        Ok(())
    }

    pub fn update_upper_bound(&self, upper_bound: UpperBoundMeta) {
        let mut inner = self.inner.write();
        inner.upper_bound = upper_bound;
        inner.upper_bound_changed = true;
    }

    pub fn get_upper_bound(&self) -> UpperBoundMeta {
        self.inner.read().upper_bound
    }

    pub fn get_gc_ts(&self) -> Ts {
        self.inner.read().gc_ts
    }

    /// Flush the upper bound if it changed since the last flush.
    pub fn persist_upper_bound_once(&self) -> MetaResult<()> {
        let upper_bound = {
            let mut inner = self.inner.write();
            if !inner.upper_bound_changed {
                return Ok(());
            }
            inner.upper_bound_changed = false;
            inner.upper_bound
        };
        disk::write_upper_bound(&self.db, &upper_bound)
    }

    /// Advance the on-disk data range to `gc_ts`: write a fresh kv snapshot
    /// of the surviving schema, prune in-memory histories and stores, then
    /// delete the obsolete keys.
    pub fn do_gc(&self, gc_ts: Ts) -> MetaResult<()> {
        let (old_gc_ts, table_map, database_map, histories) = {
            let inner = self.inner.read();
            assert!(
                gc_ts <= inner.upper_bound.resolved_ts,
                "gc safe point {gc_ts} is larger than resolved ts {}",
                inner.upper_bound.resolved_ts
            );
            if gc_ts <= inner.gc_ts {
                return Ok(());
            }
            (
                inner.gc_ts,
                inner.table_map.clone(),
                inner.database_map.clone(),
                inner.tables_ddl_history.clone(),
            )
        };

        let start = std::time::Instant::now();
        let snap = self.db.snapshot();
        let mut records = HashMap::with_capacity(table_map.len());
        for (table_id, basic) in &table_map {
            let history = histories
                .get(table_id)
                .map(|history| {
                    history
                        .iter()
                        .copied()
                        .take_while(|ts| *ts <= gc_ts)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            match Self::build_table_record_at(&snap, old_gc_ts, *table_id, basic, &history)? {
                Some(record) => {
                    records.insert(*table_id, record);
                }
                None => {
                    warn!(table_id, "no table info below gc ts, skip in snapshot");
                }
            }
        }
        let mut batch = WriteBatch::default();
        disk::write_schema_snapshot(&mut batch, gc_ts, &database_map, &records)?;
        disk::write_gc_ts(&mut batch, gc_ts);
        self.db.write(batch).map_err(MetaError::from)?;
        drop(snap);

        {
            let mut inner = self.inner.write();
            inner.gc_ts = gc_ts;
            for table_id in records.keys() {
                if let Some(basic) = inner.table_map.get_mut(table_id) {
                    basic.in_kv_snap = true;
                }
            }
            let live: std::collections::HashSet<i64> = inner.table_map.keys().copied().collect();
            inner.tables_ddl_history.retain(|table_id, history| {
                if !live.contains(table_id) {
                    return false;
                }
                let idx = history.partition_point(|ts| *ts <= gc_ts);
                history.drain(..idx);
                !history.is_empty()
            });
            let idx = inner
                .table_trigger_ddl_history
                .partition_point(|ts| *ts <= gc_ts);
            inner.table_trigger_ddl_history.drain(..idx);
            for store in inner.table_info_store_map.values() {
                store.gc(gc_ts);
            }
        }

        disk::clean_obsolete_data(&self.db, old_gc_ts, gc_ts)?;
        info!(
            gc_ts,
            duration = ?start.elapsed(),
            "schema store gc finished"
        );
        Ok(())
    }

    /// Rebuild one table's snapshot record at `gc_ts` from the previous
    /// snapshot plus the DDL history in between. Schema binding and name come
    /// from the live map so renames are reflected.
    fn build_table_record_at(
        snap: &rocksdb::SnapshotWithThreadMode<'_, DB>,
        old_gc_ts: Ts,
        table_id: i64,
        basic: &BasicTableInfo,
        history: &[Ts],
    ) -> MetaResult<Option<TableSnapRecord>> {
        use rivulet_common::ddl::ActionType;

        let mut info = if basic.in_kv_snap {
            disk::read_table_in_kv_snap(snap, old_gc_ts, table_id)?.map(|mut record| {
                record.info.version = old_gc_ts;
                record.info
            })
        } else {
            None
        };
        for ts in history {
            let event = disk::read_ddl_event(snap, *ts)?;
            if event.action == ActionType::DropTable {
                continue;
            }
            if let Some(event_info) = event.table_info {
                if event_info.id == table_id {
                    let mut event_info = event_info;
                    event_info.version = *ts;
                    info = Some(event_info);
                }
            }
        }
        Ok(info.map(|mut info| {
            info.schema_id = basic.schema_id;
            info.name = basic.name.clone();
            TableSnapRecord {
                schema_id: basic.schema_id,
                info,
            }
        }))
    }

    /// Periodic GC against the upstream safepoint.
    pub fn start_gc_loop(
        self: &Arc<Self>,
        provider: Arc<dyn GcSafepointProvider>,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let storage = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown_rx => {
                        info!("schema store gc loop is shutting down");
                        return;
                    }
                }
                let storage = storage.clone();
                let provider = provider.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let safepoint = provider.gc_safepoint()?;
                    storage.do_gc(safepoint)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "schema store gc failed"),
                    Err(e) => warn!(error = %e, "schema store gc task panicked"),
                }
            }
        });
        (join_handle, shutdown_tx)
    }

    /// Periodic upper-bound flush, at most every 5 s and only when changed.
    pub fn start_upper_bound_flush_loop(
        self: &Arc<Self>,
    ) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let storage = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPPER_BOUND_FLUSH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = &mut shutdown_rx => {
                        info!("schema store upper bound flush loop is shutting down");
                        return;
                    }
                }
                let storage = storage.clone();
                let result =
                    tokio::task::spawn_blocking(move || storage.persist_upper_bound_once()).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "flush upper bound failed"),
                    Err(e) => warn!(error = %e, "flush upper bound task panicked"),
                }
            }
        });
        (join_handle, shutdown_tx)
    }
}

#[cfg(test)]
mod tests {
    use rivulet_common::config::FilterConfig;
    use rivulet_common::ddl::ActionType;

    use super::*;

    struct FixtureLoader;

    impl SchemaSnapshotLoader for FixtureLoader {
        fn load_snapshot(&self, snap_ts: Ts) -> MetaResult<SchemaSnapshot> {
            Ok(SchemaSnapshot {
                databases: vec![DatabaseSnapshotEntry {
                    schema_id: 1,
                    name: "app".to_owned(),
                }],
                tables: vec![
                    TableSnapshotEntry {
                        schema_id: 1,
                        info: TableInfo::new(101, 1, "app", "orders", snap_ts),
                    },
                    TableSnapshotEntry {
                        schema_id: 1,
                        info: TableInfo::new(102, 1, "app", "users", snap_ts),
                    },
                ],
            })
        }
    }

    fn all_filter() -> Filter {
        Filter::new(&FilterConfig::default(), false).unwrap()
    }

    fn storage(root: &Path) -> PersistentStorage {
        PersistentStorage::new(root, 1000, &FixtureLoader).unwrap()
    }

    fn ddl(action: ActionType, table_id: i64, finished_ts: Ts) -> PersistedDdlEvent {
        PersistedDdlEvent {
            id: finished_ts as i64,
            action,
            schema_id: 1,
            table_id,
            schema_name: String::new(),
            table_name: String::new(),
            query: format!("{action:?} {table_id}"),
            schema_version: finished_ts as i64,
            finished_ts,
            table_info: None,
            blocked_tables: None,
            need_added_tables: Vec::new(),
            need_dropped_tables: None,
            updated_schemas: Vec::new(),
        }
    }

    fn create_table(table_id: i64, name: &str, finished_ts: Ts) -> PersistedDdlEvent {
        let mut e = ddl(ActionType::CreateTable, table_id, finished_ts);
        e.table_info = Some(TableInfo::new(table_id, 1, "app", name, finished_ts));
        e
    }

    fn add_column(table_id: i64, name: &str, finished_ts: Ts) -> PersistedDdlEvent {
        let mut e = ddl(ActionType::AddColumn, table_id, finished_ts);
        e.table_info = Some(TableInfo::new(table_id, 1, "app", name, finished_ts));
        e
    }

    #[test]
    fn test_cold_start_physical_tables() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let tables = storage.get_all_physical_tables(1000, &all_filter()).unwrap();
        assert_eq!(
            tables.iter().map(|t| t.table_id).collect::<Vec<_>>(),
            vec![101, 102]
        );

        let filtered = Filter::new(
            &FilterConfig {
                rules: vec!["app.orders".to_owned()],
            },
            false,
        )
        .unwrap();
        let tables = storage.get_all_physical_tables(1000, &filtered).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_name, "orders");

        assert!(storage
            .get_all_physical_tables(999, &all_filter())
            .is_err());
    }

    #[test]
    fn test_ddl_events_are_fetched_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let mut truncate = ddl(ActionType::TruncateTable, 103, 4000);
        truncate.table_info = Some(TableInfo::new(104, 1, "app", "t", 4000));
        storage
            .apply_sorted_ddls(vec![
                create_table(103, "t", 2000),
                add_column(103, "t", 3000),
                truncate,
            ])
            .unwrap();

        let events = storage.fetch_table_ddl_events(103, 1000, u64::MAX).unwrap();
        let ts: Vec<Ts> = events.iter().map(|e| e.finished_ts).collect();
        assert_eq!(ts, vec![2000, 3000, 4000]);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));

        // (start, end] bounds.
        let events = storage.fetch_table_ddl_events(103, 2000, 3000).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].finished_ts, 3000);

        // The table set follows the truncate boundary.
        let at_3999: Vec<i64> = storage
            .get_all_physical_tables(3999, &all_filter())
            .unwrap()
            .iter()
            .map(|t| t.table_id)
            .collect();
        assert!(at_3999.contains(&103) && !at_3999.contains(&104));
        let at_4000: Vec<i64> = storage
            .get_all_physical_tables(4000, &all_filter())
            .unwrap()
            .iter()
            .map(|t| t.table_id)
            .collect();
        assert!(!at_4000.contains(&103) && at_4000.contains(&104));
    }

    #[test]
    fn test_register_table_serves_versioned_infos() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        assert!(storage.register_table(101, 999).is_err());
        storage.register_table(101, 1000).unwrap();

        assert_eq!(storage.get_table_info(101, 1500).unwrap().version, 1000);
        storage
            .apply_sorted_ddls(vec![add_column(101, "orders", 2000)])
            .unwrap();
        assert_eq!(storage.get_table_info(101, 2000).unwrap().version, 2000);

        // Second registration is counted.
        storage.register_table(101, 1500).unwrap();
        storage.unregister_table(101).unwrap();
        assert!(storage.get_table_info(101, 1500).is_ok());
        storage.unregister_table(101).unwrap();
        assert!(storage.get_table_info(101, 1500).is_err());
    }

    #[test]
    fn test_trigger_events_pagination_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage
            .apply_sorted_ddls(vec![
                create_table(103, "a", 2000),
                create_table(104, "skip_b", 3000),
                add_column(103, "a", 3500),
                ddl(ActionType::DropTable, 103, 4000),
            ])
            .unwrap();

        let filter = Filter::new(
            &FilterConfig {
                rules: vec!["app.*".to_owned(), "!app.skip_*".to_owned()],
            },
            false,
        )
        .unwrap();
        // Column DDLs never enter the trigger history; the filtered create at
        // 3000 is dropped.
        let events = storage
            .fetch_table_trigger_ddl_events(&filter, 1000, 1)
            .unwrap();
        assert_eq!(events[0].finished_ts, 2000);
        let events = storage
            .fetch_table_trigger_ddl_events(&filter, 2000, 10)
            .unwrap();
        assert_eq!(
            events.iter().map(|e| e.finished_ts).collect::<Vec<_>>(),
            vec![4000]
        );
    }

    #[test]
    fn test_restart_from_disk_serves_same_responses() {
        let dir = tempfile::tempdir().unwrap();
        let before = {
            let storage = storage(dir.path());
            storage
                .apply_sorted_ddls(vec![
                    create_table(103, "t", 2000),
                    add_column(103, "t", 3000),
                ])
                .unwrap();
            storage.update_upper_bound(UpperBoundMeta {
                finished_ddl_ts: 3000,
                schema_version: 3000,
                resolved_ts: 3500,
            });
            storage.persist_upper_bound_once().unwrap();
            (
                storage.fetch_table_ddl_events(103, 1000, u64::MAX).unwrap(),
                storage.get_all_physical_tables(3000, &all_filter()).unwrap(),
            )
        };

        let storage = storage(dir.path());
        assert_eq!(
            storage.get_upper_bound(),
            UpperBoundMeta {
                finished_ddl_ts: 3000,
                schema_version: 3000,
                resolved_ts: 3500,
            }
        );
        assert_eq!(
            storage.fetch_table_ddl_events(103, 1000, u64::MAX).unwrap(),
            before.0
        );
        assert_eq!(
            storage.get_all_physical_tables(3000, &all_filter()).unwrap(),
            before.1
        );
    }

    #[test]
    fn test_gc_advances_data_range() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        storage
            .apply_sorted_ddls(vec![
                create_table(103, "t", 2000),
                add_column(103, "t", 3000),
            ])
            .unwrap();
        storage.update_upper_bound(UpperBoundMeta {
            finished_ddl_ts: 3000,
            schema_version: 3000,
            resolved_ts: 5000,
        });
        storage.persist_upper_bound_once().unwrap();

        storage.do_gc(2500).unwrap();
        assert_eq!(storage.get_gc_ts(), 2500);
        // A second pass at the same safepoint is a no-op.
        storage.do_gc(2500).unwrap();

        assert!(storage.fetch_table_ddl_events(103, 1000, u64::MAX).is_err());
        let events = storage.fetch_table_ddl_events(103, 2500, u64::MAX).unwrap();
        assert_eq!(
            events.iter().map(|e| e.finished_ts).collect::<Vec<_>>(),
            vec![3000]
        );
        // The new snapshot carries the table created at 2000.
        let tables = storage.get_all_physical_tables(2500, &all_filter()).unwrap();
        assert!(tables.iter().any(|t| t.table_id == 103));
        assert!(storage.get_all_physical_tables(2400, &all_filter()).is_err());
        // Registered stores survive from the new base version.
        storage.register_table(103, 2500).unwrap();
        assert_eq!(storage.get_table_info(103, 2500).unwrap().version, 2500);
        assert_eq!(storage.get_table_info(103, 3000).unwrap().version, 3000);
    }
}
