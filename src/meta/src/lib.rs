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

//! The control plane of the CDC cluster.
//!
//! One coordinator per cluster owns the set of changefeeds and elects a
//! [`maintainer::Maintainer`] per changefeed on one of the worker nodes. The
//! maintainer schedules the changefeed's table spans onto nodes, advances the
//! changefeed checkpoint, and coordinates blocking schema changes across the
//! dispatchers through the barrier protocol. The [`schemastore`] keeps the
//! ordered DDL history on disk and serves versioned table snapshots.

#![warn(clippy::dbg_macro)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::inconsistent_struct_constructor)]
#![warn(clippy::await_holding_lock)]
#![deny(unused_must_use)]

pub mod bootstrap;
pub mod coordinator;
mod error;
pub mod maintainer;
pub mod manager;
pub mod messaging;
pub mod metrics;
pub mod schemastore;

pub use error::{MetaError, MetaResult};
