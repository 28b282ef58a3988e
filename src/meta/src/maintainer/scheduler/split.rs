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

use rivulet_common::span;
use rivulet_pb::TableSpan;
use tracing::info;

use super::Scheduler;
use crate::maintainer::operator::{OperatorController, SplitDispatcherOperator};
use crate::maintainer::replica::ReplicationDb;

/// Computes the boundaries a span is cut along. Real deployments slice on
/// region boundaries from the placement service; the default slices the key
/// range evenly.
pub trait SpanSplitter: Send + Sync {
    fn split(&self, target: &TableSpan, parts: usize) -> Vec<TableSpan>;
}

#[derive(Default)]
pub struct EvenSpanSplitter;

impl SpanSplitter for EvenSpanSplitter {
    fn split(&self, target: &TableSpan, parts: usize) -> Vec<TableSpan> {
        span::evenly_split_span(target, parts)
    }
}

/// Splits a replica whose measured event rate stays above the threshold so
/// the pieces can spread across nodes.
pub struct SplitScheduler {
    db: Arc<ReplicationDb>,
    operator_controller: Arc<OperatorController>,
    splitter: Arc<dyn SpanSplitter>,
    threshold: f32,
    batch_size: usize,
}

impl SplitScheduler {
    pub fn new(
        db: Arc<ReplicationDb>,
        operator_controller: Arc<OperatorController>,
        splitter: Arc<dyn SpanSplitter>,
        threshold: f32,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            operator_controller,
            splitter,
            threshold,
            batch_size,
        }
    }
}

impl Scheduler for SplitScheduler {
    fn name(&self) -> &'static str {
        "split-scheduler"
    }

    fn schedule(&self) {
        let mut submitted = 0;
        for replica in self.db.all_replicas() {
            if submitted >= self.batch_size {
                return;
            }
            if span::is_ddl_span(replica.span()) {
                continue;
            }
            let rate = replica.event_size_per_second();
            if rate <= self.threshold {
                continue;
            }
            let Some(node) = replica.node() else {
                continue;
            };
            let parts = ((rate / self.threshold).ceil() as usize).clamp(2, 8);
            let new_spans = self.splitter.split(replica.span(), parts);
            if new_spans.len() <= 1 {
                continue;
            }
            info!(
                dispatcher = %replica.id(),
                table_id = replica.table_id(),
                rate,
                parts = new_spans.len(),
                "split overloaded replica"
            );
            if self
                .operator_controller
                .add_operator(Arc::new(SplitDispatcherOperator::new(
                    self.db.clone(),
                    replica,
                    node,
                    new_spans,
                )))
            {
                submitted += 1;
            }
        }
    }
}
