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

//! Key layout and codec of the schema store's rocksdb keyspace.
//!
//! ```text
//! 0x01 | snap_ts(BE) | 0x01 | table_id(BE)   -> TableSnapRecord (json)
//! 0x01 | snap_ts(BE) | 0x02 | schema_id(BE)  -> DatabaseSnapRecord (json)
//! 0x02 | finished_ts(BE)                     -> PersistedDdlEvent (json)
//! 0x03 'g'                                   -> gc_ts (BE)
//! 0x03 'u'                                   -> UpperBoundMeta (json)
//! ```
//!
//! Big-endian timestamps keep the natural iteration order of each keyspace.

use std::collections::{HashMap, HashSet};

use rivulet_common::table::TableInfo;
use rivulet_common::Ts;
use rocksdb::{DBAccess, DBIteratorWithThreadMode, Direction, IteratorMode, WriteBatch, DB};
use serde::{Deserialize, Serialize};

use super::ddl_event::{BasicDatabaseInfo, BasicTableInfo, PersistedDdlEvent};
use crate::{MetaError, MetaResult};

const PREFIX_KV_SNAPSHOT: u8 = 0x01;
const PREFIX_DDL_EVENT: u8 = 0x02;
const PREFIX_META: u8 = 0x03;

const SNAPSHOT_SUB_TABLE: u8 = 0x01;
const SNAPSHOT_SUB_DB: u8 = 0x02;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct TableSnapRecord {
    pub schema_id: i64,
    pub info: TableInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(super) struct DatabaseSnapRecord {
    pub name: String,
    pub tables: Vec<i64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpperBoundMeta {
    pub finished_ddl_ts: Ts,
    pub schema_version: i64,
    pub resolved_ts: Ts,
}

pub(super) fn snapshot_table_key(snap_ts: Ts, table_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(18);
    key.push(PREFIX_KV_SNAPSHOT);
    key.extend_from_slice(&snap_ts.to_be_bytes());
    key.push(SNAPSHOT_SUB_TABLE);
    key.extend_from_slice(&(table_id as u64).to_be_bytes());
    key
}

pub(super) fn snapshot_db_key(snap_ts: Ts, schema_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(18);
    key.push(PREFIX_KV_SNAPSHOT);
    key.extend_from_slice(&snap_ts.to_be_bytes());
    key.push(SNAPSHOT_SUB_DB);
    key.extend_from_slice(&(schema_id as u64).to_be_bytes());
    key
}

pub(super) fn ddl_event_key(finished_ts: Ts) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(PREFIX_DDL_EVENT);
    key.extend_from_slice(&finished_ts.to_be_bytes());
    key
}

pub(super) fn gc_ts_key() -> Vec<u8> {
    vec![PREFIX_META, b'g']
}

pub(super) fn upper_bound_key() -> Vec<u8> {
    vec![PREFIX_META, b'u']
}

pub(super) fn read_gc_ts(db: &DB) -> MetaResult<Option<Ts>> {
    let Some(raw) = db.get(gc_ts_key())? else {
        return Ok(None);
    };
    let bytes: [u8; 8] = raw
        .as_slice()
        .try_into()
        .map_err(|_| MetaError::from(anyhow::anyhow!("malformed gc ts value")))?;
    Ok(Some(Ts::from_be_bytes(bytes)))
}

pub(super) fn write_gc_ts(batch: &mut WriteBatch, gc_ts: Ts) {
    batch.put(gc_ts_key(), gc_ts.to_be_bytes());
}

pub(super) fn read_upper_bound(db: &DB) -> MetaResult<Option<UpperBoundMeta>> {
    let Some(raw) = db.get(upper_bound_key())? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

pub(super) fn write_upper_bound(db: &DB, upper_bound: &UpperBoundMeta) -> MetaResult<()> {
    db.put(upper_bound_key(), serde_json::to_vec(upper_bound)?)?;
    Ok(())
}

pub(super) fn write_ddl_events(db: &DB, events: &[PersistedDdlEvent]) -> MetaResult<()> {
    let mut batch = WriteBatch::default();
    for event in events {
        batch.put(ddl_event_key(event.finished_ts), serde_json::to_vec(event)?);
    }
    db.write(batch)?;
    Ok(())
}

pub(super) fn read_ddl_event<D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'_, D>,
    finished_ts: Ts,
) -> MetaResult<PersistedDdlEvent> {
    let raw = reader.get(ddl_event_key(finished_ts))?.ok_or_else(|| {
        MetaError::from(anyhow::anyhow!("ddl event at ts {finished_ts} not found"))
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Write one kv snapshot of the schema at `snap_ts` into `batch`.
pub(super) fn write_schema_snapshot(
    batch: &mut WriteBatch,
    snap_ts: Ts,
    databases: &HashMap<i64, BasicDatabaseInfo>,
    tables: &HashMap<i64, TableSnapRecord>,
) -> MetaResult<()> {
    for (schema_id, database) in databases {
        let record = DatabaseSnapRecord {
            name: database.name.clone(),
            tables: database.tables.iter().copied().collect(),
        };
        batch.put(
            snapshot_db_key(snap_ts, *schema_id),
            serde_json::to_vec(&record)?,
        );
    }
    for (table_id, record) in tables {
        batch.put(
            snapshot_table_key(snap_ts, *table_id),
            serde_json::to_vec(record)?,
        );
    }
    Ok(())
}

fn scan_snapshot_sub<'a, D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'a, D>,
    snap_ts: Ts,
    sub: u8,
) -> DBIteratorWithThreadMode<'a, D> {
    let mut start = Vec::with_capacity(10);
    start.push(PREFIX_KV_SNAPSHOT);
    start.extend_from_slice(&snap_ts.to_be_bytes());
    start.push(sub);
    reader.iterator(IteratorMode::From(start.as_slice(), Direction::Forward))
}

fn in_snapshot_sub(key: &[u8], snap_ts: Ts, sub: u8) -> bool {
    key.len() == 18
        && key[0] == PREFIX_KV_SNAPSHOT
        && key[1..9] == snap_ts.to_be_bytes()
        && key[9] == sub
}

pub(super) fn load_databases_in_kv_snap<D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'_, D>,
    snap_ts: Ts,
) -> MetaResult<HashMap<i64, BasicDatabaseInfo>> {
    let mut databases = HashMap::new();
    for item in scan_snapshot_sub(reader, snap_ts, SNAPSHOT_SUB_DB) {
        let (key, value) = item?;
        if !in_snapshot_sub(&key, snap_ts, SNAPSHOT_SUB_DB) {
            break;
        }
        let schema_id = u64::from_be_bytes(key[10..18].try_into().unwrap()) as i64;
        let record: DatabaseSnapRecord = serde_json::from_slice(&value)?;
        databases.insert(
            schema_id,
            BasicDatabaseInfo {
                name: record.name,
                tables: record.tables.into_iter().collect::<HashSet<_>>(),
            },
        );
    }
    Ok(databases)
}

pub(super) fn load_tables_in_kv_snap<D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'_, D>,
    snap_ts: Ts,
) -> MetaResult<HashMap<i64, BasicTableInfo>> {
    let mut tables = HashMap::new();
    for item in scan_snapshot_sub(reader, snap_ts, SNAPSHOT_SUB_TABLE) {
        let (key, value) = item?;
        if !in_snapshot_sub(&key, snap_ts, SNAPSHOT_SUB_TABLE) {
            break;
        }
        let table_id = u64::from_be_bytes(key[10..18].try_into().unwrap()) as i64;
        let record: TableSnapRecord = serde_json::from_slice(&value)?;
        tables.insert(
            table_id,
            BasicTableInfo {
                schema_id: record.schema_id,
                name: record.info.name.clone(),
                in_kv_snap: true,
            },
        );
    }
    Ok(tables)
}

pub(super) fn read_table_in_kv_snap<D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'_, D>,
    snap_ts: Ts,
    table_id: i64,
) -> MetaResult<Option<TableSnapRecord>> {
    let Some(raw) = reader.get(snapshot_table_key(snap_ts, table_id))? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Scan the DDL event log in `(start, end]`, in `finished_ts` order.
pub(super) fn scan_ddl_events<D: DBAccess>(
    reader: &rocksdb::SnapshotWithThreadMode<'_, D>,
    start: Ts,
    end: Ts,
) -> MetaResult<Vec<PersistedDdlEvent>> {
    let mut events = Vec::new();
    let from = ddl_event_key(start.saturating_add(1));
    for item in reader.iterator(IteratorMode::From(from.as_slice(), Direction::Forward)) {
        let (key, value) = item?;
        if key.len() != 9 || key[0] != PREFIX_DDL_EVENT {
            break;
        }
        let ts = Ts::from_be_bytes(key[1..9].try_into().unwrap());
        if ts > end {
            break;
        }
        events.push(serde_json::from_slice(&value)?);
    }
    Ok(events)
}

/// Delete the kv snapshot at `old_snap_ts` and every DDL event with
/// `finished_ts <= gc_ts`. Keys are collected first; the batches stay small
/// because GC runs frequently relative to DDL volume.
pub(super) fn clean_obsolete_data(db: &DB, old_snap_ts: Ts, gc_ts: Ts) -> MetaResult<()> {
    let mut batch = WriteBatch::default();
    let snap = db.snapshot();
    if old_snap_ts < gc_ts {
        for sub in [SNAPSHOT_SUB_TABLE, SNAPSHOT_SUB_DB] {
            for item in scan_snapshot_sub(&snap, old_snap_ts, sub) {
                let (key, _) = item?;
                if !in_snapshot_sub(&key, old_snap_ts, sub) {
                    break;
                }
                batch.delete(key);
            }
        }
    }
    let from = ddl_event_key(0);
    for item in snap.iterator(IteratorMode::From(from.as_slice(), Direction::Forward)) {
        let (key, _) = item?;
        if key.len() != 9 || key[0] != PREFIX_DDL_EVENT {
            break;
        }
        let ts = Ts::from_be_bytes(key[1..9].try_into().unwrap());
        if ts > gc_ts {
            break;
        }
        batch.delete(key);
    }
    db.write(batch)?;
    Ok(())
}
