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

//! The persisted DDL event and the pure apply pipeline over the in-memory
//! schema maps: schema-name fill-in, influence computation, duplicate
//! detection, DDL-history and table/database map updates.

use std::collections::{HashMap, HashSet};

use rivulet_common::ddl::ActionType;
use rivulet_common::table::{Table, TableInfo};
use rivulet_common::Ts;
use rivulet_pb::{InfluenceType, InfluencedTables, SchemaIdChange};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Short record kept in memory for every live table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicTableInfo {
    pub schema_id: i64,
    pub name: String,
    /// Whether the table is present in the kv snapshot at `gc_ts`, or only in
    /// the DDL history above it.
    pub in_kv_snap: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicDatabaseInfo {
    pub name: String,
    pub tables: HashSet<i64>,
}

/// The set of tables a DDL influences.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableInfluence {
    Normal { table_ids: Vec<i64> },
    Db { schema_id: i64 },
    All,
}

impl TableInfluence {
    pub fn to_pb(&self) -> InfluencedTables {
        match self {
            TableInfluence::Normal { table_ids } => InfluencedTables {
                influence_type: InfluenceType::Normal as i32,
                table_ids: table_ids.clone(),
                schema_id: 0,
            },
            TableInfluence::Db { schema_id } => InfluencedTables {
                influence_type: InfluenceType::Db as i32,
                table_ids: Vec::new(),
                schema_id: *schema_id,
            },
            TableInfluence::All => InfluencedTables {
                influence_type: InfluenceType::All as i32,
                table_ids: Vec::new(),
                schema_id: 0,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedSchema {
    pub table_id: i64,
    pub old_schema_id: i64,
    pub new_schema_id: i64,
}

impl UpdatedSchema {
    pub fn to_pb(&self) -> SchemaIdChange {
        SchemaIdChange {
            table_id: self.table_id,
            old_schema_id: self.old_schema_id,
            new_schema_id: self.new_schema_id,
        }
    }
}

/// One upstream DDL job as appended to the schema store, keyed on disk by
/// `finished_ts`. The influence fields are computed on ingestion and
/// persisted with the event so that replay is cheap.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedDdlEvent {
    /// Upstream job id, for logging only.
    pub id: i64,
    pub action: ActionType,
    pub schema_id: i64,
    pub table_id: i64,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default)]
    pub table_name: String,
    pub query: String,
    pub schema_version: i64,
    pub finished_ts: Ts,
    /// The table info produced by this DDL. Carries the new table id for
    /// truncate.
    #[serde(default)]
    pub table_info: Option<TableInfo>,
    #[serde(default)]
    pub blocked_tables: Option<TableInfluence>,
    #[serde(default)]
    pub need_added_tables: Vec<Table>,
    #[serde(default)]
    pub need_dropped_tables: Option<TableInfluence>,
    #[serde(default)]
    pub updated_schemas: Vec<UpdatedSchema>,
}

/// The view served to dispatchers and the maintainer.
#[derive(Clone, Debug, PartialEq)]
pub struct DdlEvent {
    pub action: ActionType,
    pub schema_id: i64,
    pub table_id: i64,
    pub schema_name: String,
    pub table_name: String,
    pub query: String,
    pub table_info: Option<TableInfo>,
    pub finished_ts: Ts,
    pub blocked_tables: Option<TableInfluence>,
    pub need_added_tables: Vec<Table>,
    pub need_dropped_tables: Option<TableInfluence>,
    pub updated_schemas: Vec<UpdatedSchema>,
}

impl DdlEvent {
    pub fn from_persisted(raw: &PersistedDdlEvent) -> Self {
        Self {
            action: raw.action,
            schema_id: raw.schema_id,
            table_id: raw.table_id,
            schema_name: raw.schema_name.clone(),
            table_name: raw
                .table_info
                .as_ref()
                .map(|info| info.name.clone())
                .unwrap_or_else(|| raw.table_name.clone()),
            query: raw.query.clone(),
            table_info: raw.table_info.clone(),
            finished_ts: raw.finished_ts,
            blocked_tables: raw.blocked_tables.clone(),
            need_added_tables: raw.need_added_tables.clone(),
            need_dropped_tables: raw.need_dropped_tables.clone(),
            updated_schemas: raw.updated_schemas.clone(),
        }
    }
}

/// Fill `schema_name` from the live database map. Create/drop schema carry
/// their own name; everything else resolves through its schema id.
pub(super) fn fill_schema_name(
    event: &mut PersistedDdlEvent,
    database_map: &HashMap<i64, BasicDatabaseInfo>,
) {
    match event.action {
        ActionType::CreateSchema | ActionType::DropSchema => {
            // The event carries the database name from upstream.
        }
        _ => {
            let Some(database) = database_map.get(&event.schema_id) else {
                panic!(
                    "database not found, schemaID {}, query {}",
                    event.schema_id, event.query
                );
            };
            event.schema_name = database.name.clone();
        }
    }
}

/// The fixed action table mapping a DDL to the tables it blocks, adds and
/// drops.
pub(super) fn fill_influenced_tables(
    event: &mut PersistedDdlEvent,
    table_map: &HashMap<i64, BasicTableInfo>,
) {
    match event.action {
        ActionType::CreateSchema => {}
        ActionType::DropSchema => {
            event.need_dropped_tables = Some(TableInfluence::Db {
                schema_id: event.schema_id,
            });
        }
        ActionType::CreateTable => {
            event.need_added_tables = vec![Table {
                schema_id: event.schema_id,
                schema_name: event.schema_name.clone(),
                table_id: event.table_id,
                table_name: event
                    .table_info
                    .as_ref()
                    .map(|info| info.name.clone())
                    .unwrap_or_default(),
            }];
        }
        ActionType::DropTable => {
            event.need_dropped_tables = Some(TableInfluence::Normal {
                table_ids: vec![event.table_id],
            });
        }
        ActionType::TruncateTable => {
            let new_table_id = event
                .table_info
                .as_ref()
                .map(|info| info.id)
                .unwrap_or_default();
            event.need_dropped_tables = Some(TableInfluence::Normal {
                table_ids: vec![event.table_id],
            });
            event.need_added_tables = vec![Table {
                schema_id: event.schema_id,
                schema_name: event.schema_name.clone(),
                table_id: new_table_id,
                table_name: event
                    .table_info
                    .as_ref()
                    .map(|info| info.name.clone())
                    .unwrap_or_default(),
            }];
        }
        ActionType::RenameTable => {
            event.blocked_tables = Some(TableInfluence::Normal {
                table_ids: vec![event.table_id],
            });
            if let Some(old) = table_map.get(&event.table_id) {
                if old.schema_id != event.schema_id {
                    event.updated_schemas = vec![UpdatedSchema {
                        table_id: event.table_id,
                        old_schema_id: old.schema_id,
                        new_schema_id: event.schema_id,
                    }];
                }
            }
        }
        ActionType::CreateView => {
            event.blocked_tables = Some(TableInfluence::All);
        }
        ActionType::AddTablePartition | ActionType::ExchangeTablePartition => {
            // Partition reorganization side effects are not modelled yet.
            warn!(query = %event.query, "partition ddl, table-level side effects ignored");
        }
        action if action.is_table_info_only() => {}
        action => {
            panic!("unknown ddl type {:?}, query {}", action, event.query);
        }
    }
}

/// Replayed events may recreate schemas or tables that already exist; those
/// are skipped in memory but still persisted.
pub(super) fn should_skip_ddl(
    event: &PersistedDdlEvent,
    database_map: &HashMap<i64, BasicDatabaseInfo>,
    table_map: &HashMap<i64, BasicTableInfo>,
) -> bool {
    match event.action {
        ActionType::CreateSchema if database_map.contains_key(&event.schema_id) => {
            warn!(
                query = %event.query,
                schema_id = event.schema_id,
                finished_ts = event.finished_ts,
                "database already exists, ignore DDL"
            );
            true
        }
        ActionType::CreateTable if table_map.contains_key(&event.table_id) => {
            warn!(
                query = %event.query,
                table_id = event.table_id,
                finished_ts = event.finished_ts,
                "table already exists, ignore DDL"
            );
            true
        }
        _ => false,
    }
}

/// Append the event to the per-table histories and, for topology-changing
/// actions, the table-trigger history.
pub(super) fn update_ddl_history(
    event: &PersistedDdlEvent,
    database_map: &HashMap<i64, BasicDatabaseInfo>,
    table_map: &HashMap<i64, BasicTableInfo>,
    tables_ddl_history: &mut HashMap<i64, Vec<Ts>>,
    table_trigger_ddl_history: &mut Vec<Ts>,
) {
    let mut add_table_history = |table_id: i64| {
        tables_ddl_history
            .entry(table_id)
            .or_default()
            .push(event.finished_ts);
    };

    match event.action {
        ActionType::CreateSchema | ActionType::CreateView => {
            table_trigger_ddl_history.push(event.finished_ts);
            for table_id in table_map.keys() {
                add_table_history(*table_id);
            }
        }
        ActionType::DropSchema => {
            table_trigger_ddl_history.push(event.finished_ts);
            if let Some(database) = database_map.get(&event.schema_id) {
                for table_id in &database.tables {
                    add_table_history(*table_id);
                }
            }
        }
        ActionType::CreateTable | ActionType::DropTable => {
            table_trigger_ddl_history.push(event.finished_ts);
            add_table_history(event.table_id);
        }
        ActionType::TruncateTable => {
            add_table_history(event.table_id);
            if let Some(info) = &event.table_info {
                add_table_history(info.id);
            }
        }
        ActionType::RenameTable => {
            table_trigger_ddl_history.push(event.finished_ts);
            add_table_history(event.table_id);
        }
        ActionType::AddTablePartition | ActionType::ExchangeTablePartition => {}
        action if action.is_table_info_only() => {
            add_table_history(event.table_id);
        }
        action => {
            panic!("unknown ddl type {:?}, query {}", action, event.query);
        }
    }
}

/// Apply the event to the live table and database maps.
pub(super) fn update_schema_maps(
    event: &PersistedDdlEvent,
    database_map: &mut HashMap<i64, BasicDatabaseInfo>,
    table_map: &mut HashMap<i64, BasicTableInfo>,
) {
    let table_name = event
        .table_info
        .as_ref()
        .map(|info| info.name.clone())
        .unwrap_or_else(|| event.table_name.clone());

    let create_table =
        |database_map: &mut HashMap<i64, BasicDatabaseInfo>,
         table_map: &mut HashMap<i64, BasicTableInfo>,
         schema_id: i64,
         table_id: i64,
         name: String| {
            let Some(database) = database_map.get_mut(&schema_id) else {
                panic!(
                    "database not found, schemaID {}, tableID {}, query {}",
                    schema_id, table_id, event.query
                );
            };
            database.tables.insert(table_id);
            table_map.insert(
                table_id,
                BasicTableInfo {
                    schema_id,
                    name,
                    in_kv_snap: false,
                },
            );
        };
    let drop_table = |database_map: &mut HashMap<i64, BasicDatabaseInfo>,
                      table_map: &mut HashMap<i64, BasicTableInfo>,
                      schema_id: i64,
                      table_id: i64| {
        if let Some(database) = database_map.get_mut(&schema_id) {
            database.tables.remove(&table_id);
        }
        table_map.remove(&table_id);
    };

    match event.action {
        ActionType::CreateSchema => {
            database_map.insert(
                event.schema_id,
                BasicDatabaseInfo {
                    name: event.schema_name.clone(),
                    tables: HashSet::new(),
                },
            );
        }
        ActionType::DropSchema => {
            if let Some(database) = database_map.remove(&event.schema_id) {
                for table_id in database.tables {
                    table_map.remove(&table_id);
                }
            }
        }
        ActionType::CreateTable => {
            create_table(
                database_map,
                table_map,
                event.schema_id,
                event.table_id,
                table_name,
            );
        }
        ActionType::DropTable => {
            drop_table(database_map, table_map, event.schema_id, event.table_id);
        }
        ActionType::TruncateTable => {
            let new_table_id = event
                .table_info
                .as_ref()
                .map(|info| info.id)
                .unwrap_or_default();
            drop_table(database_map, table_map, event.schema_id, event.table_id);
            create_table(
                database_map,
                table_map,
                event.schema_id,
                new_table_id,
                table_name,
            );
        }
        ActionType::RenameTable => {
            let old_schema_id = match table_map.get(&event.table_id) {
                Some(info) => info.schema_id,
                None => {
                    panic!(
                        "table not found on rename, tableID {}, query {}",
                        event.table_id, event.query
                    );
                }
            };
            if old_schema_id != event.schema_id {
                if let Some(database) = database_map.get_mut(&old_schema_id) {
                    database.tables.remove(&event.table_id);
                }
                let Some(database) = database_map.get_mut(&event.schema_id) else {
                    panic!(
                        "database not found on rename, schemaID {}, query {}",
                        event.schema_id, event.query
                    );
                };
                database.tables.insert(event.table_id);
            }
            let info = table_map.get_mut(&event.table_id).unwrap();
            info.schema_id = event.schema_id;
            info.name = table_name;
        }
        ActionType::CreateView => {}
        ActionType::AddTablePartition | ActionType::ExchangeTablePartition => {}
        action if action.is_table_info_only() => {}
        action => {
            panic!("unknown ddl type {:?}, query {}", action, event.query);
        }
    }
}
