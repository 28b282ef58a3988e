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

//! Stateless scheduling policies, run in a fixed priority order on every
//! controller tick: fill, balance, split, merge.

mod balance;
mod basic;
mod merge;
mod split;

pub use balance::BalanceScheduler;
pub use basic::{round_robin_pairs, stray_keys, BasicScheduler};
pub use merge::MergeScheduler;
pub use split::{EvenSpanSplitter, SpanSplitter, SplitScheduler};

/// One scheduling policy. Implementations inspect the replication db and
/// submit operators; they hold no state that outlives a tick beyond rate
/// limiting.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &'static str;

    fn schedule(&self);
}
