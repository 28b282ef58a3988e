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

use rivulet_common::span::total_span;
use rivulet_pb::ComponentState;
use tracing::info;

use super::Scheduler;
use crate::maintainer::operator::OperatorController;
use crate::maintainer::replica::ReplicationDb;

/// Merges a table split into several spans back into one when every span's
/// event rate sits below the low-water mark.
pub struct MergeScheduler {
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    low_water: f32,
}

impl MergeScheduler {
    pub fn new(
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        low_water: f32,
    ) -> Self {
        Self {
            db,
            operator_controller,
            low_water,
        }
    }
}

impl Scheduler for MergeScheduler {
    fn name(&self) -> &'static str {
        "merge-scheduler"
    }

    fn schedule(&self) {
        if self.operator_controller.operator_size() > 0 {
            return;
        }
        let mut table_ids: Vec<i64> = self.db.covered_table_ids().into_iter().collect();
        table_ids.sort_unstable();
        for table_id in table_ids {
            let spans = self.db.spans_of_table(table_id);
            if spans.len() < 2 {
                continue;
            }
            let all_quiet = spans.iter().all(|replica| {
                replica.component_status() == ComponentState::Working
                    && replica.event_size_per_second() < self.low_water
            });
            if !all_quiet {
                continue;
            }
            // Merging needs the whole table drained together; spans must be
            // contiguous over the full range.
            let total = total_span(table_id);
            let contiguous = spans.first().unwrap().span().start_key == total.start_key
                && spans.last().unwrap().span().end_key == total.end_key
                && spans
                    .windows(2)
                    .all(|pair| pair[0].span().end_key == pair[1].span().start_key);
            if !contiguous {
                continue;
            }
            info!(table_id, spans = spans.len(), "merge quiet table spans");
            self.operator_controller
                .add_merge_split_operator(spans, vec![total]);
            // One table per pass keeps the disruption bounded.
            return;
        }
    }
}
