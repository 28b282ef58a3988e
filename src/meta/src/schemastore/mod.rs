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

//! Durable, ordered log of upstream DDL jobs plus a kv snapshot of the
//! schema, served as point-in-time table sets and per-table versioned infos.

mod ddl_event;
mod disk;
mod persist_storage;
mod table_info_store;

pub use ddl_event::{
    BasicDatabaseInfo, BasicTableInfo, DdlEvent, PersistedDdlEvent, TableInfluence, UpdatedSchema,
};
pub use disk::UpperBoundMeta;
pub use persist_storage::{
    DatabaseSnapshotEntry, GcSafepointProvider, PersistentStorage, SchemaSnapshot,
    SchemaSnapshotLoader, TableSnapshotEntry,
};
pub use table_info_store::VersionedTableInfoStore;
