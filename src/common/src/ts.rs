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

//! Upstream TSO timestamps: physical milliseconds in the high bits, a logical
//! counter in the low 18. All comparisons are plain `u64` ordering; 0 means
//! "unset".

use std::time::{SystemTime, UNIX_EPOCH};

pub type Ts = u64;

const LOGICAL_BITS: u32 = 18;

pub fn compose_ts(physical_ms: u64, logical: u64) -> Ts {
    (physical_ms << LOGICAL_BITS) | (logical & ((1 << LOGICAL_BITS) - 1))
}

/// The physical millisecond part of a TSO timestamp.
pub fn extract_physical(ts: Ts) -> u64 {
    ts >> LOGICAL_BITS
}

/// Wall-clock now as TSO physical milliseconds, for lag metrics only.
pub fn current_physical() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_extract() {
        let ts = compose_ts(1_700_000_000_000, 5);
        assert_eq!(extract_physical(ts), 1_700_000_000_000);
        assert!(compose_ts(1, 0) > compose_ts(0, (1 << LOGICAL_BITS) - 1));
    }
}
