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

use crate::ts::Ts;

/// A physical table visible to a changefeed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub schema_id: i64,
    pub schema_name: String,
    pub table_id: i64,
    pub table_name: String,
}

impl Table {
    pub fn to_pb(&self) -> rivulet_pb::Table {
        rivulet_pb::Table {
            schema_id: self.schema_id,
            table_id: self.table_id,
            schema_name: self.schema_name.clone(),
            table_name: self.table_name.clone(),
        }
    }

    pub fn from_pb(t: &rivulet_pb::Table) -> Self {
        Self {
            schema_id: t.schema_id,
            schema_name: t.schema_name.clone(),
            table_id: t.table_id,
            table_name: t.table_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub column_type: String,
    #[serde(default)]
    pub nullable: bool,
}

/// One version of a table's schema, valid from `version` (the finish
/// timestamp of the DDL that produced it) until the next version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub id: i64,
    pub schema_id: i64,
    pub schema_name: String,
    pub name: String,
    /// Finished ts of the DDL this version comes from; the kv-snapshot ts for
    /// the initial version.
    pub version: Ts,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

impl TableInfo {
    pub fn new(id: i64, schema_id: i64, schema_name: impl Into<String>, name: impl Into<String>, version: Ts) -> Self {
        Self {
            id,
            schema_id,
            schema_name: schema_name.into(),
            name: name.into(),
            version,
            columns: Vec::new(),
        }
    }
}
