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

/// Kind of an upstream DDL job. The set mirrors the upstream schema-change
/// actions the control plane has to order against row changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    CreateSchema,
    DropSchema,
    CreateTable,
    DropTable,
    TruncateTable,
    RenameTable,
    CreateView,
    AddColumn,
    DropColumn,
    ModifyColumn,
    AddIndex,
    DropIndex,
    AddForeignKey,
    DropForeignKey,
    RebaseAutoId,
    SetDefaultValue,
    ShardRowId,
    ModifyTableComment,
    RenameIndex,
    AddTablePartition,
    ExchangeTablePartition,
}

impl ActionType {
    /// Actions that only rewrite one table's schema, with no effect on the
    /// table topology.
    pub fn is_table_info_only(self) -> bool {
        matches!(
            self,
            ActionType::AddColumn
                | ActionType::DropColumn
                | ActionType::ModifyColumn
                | ActionType::AddIndex
                | ActionType::DropIndex
                | ActionType::AddForeignKey
                | ActionType::DropForeignKey
                | ActionType::RebaseAutoId
                | ActionType::SetDefaultValue
                | ActionType::ShardRowId
                | ActionType::ModifyTableComment
                | ActionType::RenameIndex
        )
    }
}
