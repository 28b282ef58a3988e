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

//! Table span helpers. A span is a half-open byte range `[start, end)` inside
//! one table's keyspace; the full-table range is `t{id}_` .. `t{id+1}_` with
//! the id encoded big-endian so that span order follows table order.

use rivulet_pb::TableSpan;

/// The span of the table-trigger (DDL) dispatcher. It does not correspond to
/// any physical table.
pub const DDL_SPAN_TABLE_ID: i64 = 0;

fn table_prefix(table_id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    key.push(b't');
    key.extend_from_slice(&table_id.to_be_bytes());
    key.push(b'_');
    key
}

/// The complete span covering every row of `table_id`.
pub fn total_span(table_id: i64) -> TableSpan {
    TableSpan {
        table_id,
        start_key: table_prefix(table_id),
        end_key: table_prefix(table_id + 1),
    }
}

pub fn ddl_span() -> TableSpan {
    TableSpan {
        table_id: DDL_SPAN_TABLE_ID,
        start_key: Vec::new(),
        end_key: Vec::new(),
    }
}

pub fn is_ddl_span(span: &TableSpan) -> bool {
    span.table_id == DDL_SPAN_TABLE_ID
}

/// Whether `span` covers its whole table.
pub fn is_complete_span(span: &TableSpan) -> bool {
    let total = total_span(span.table_id);
    span.start_key == total.start_key && span.end_key == total.end_key
}

/// Order spans by `(table_id, start_key)`; the ordering key of the span
/// indices.
pub fn span_order_key(span: &TableSpan) -> (i64, Vec<u8>) {
    (span.table_id, span.start_key.clone())
}

/// Slice the whole table range of `table_id` into `parts` contiguous spans.
///
/// The boundary byte ranges are synthetic: real deployments slice on region
/// boundaries supplied by the placement service, which stays behind the
/// `SpanSplitter` seam of the scheduler.
pub fn evenly_split_span(span: &TableSpan, parts: usize) -> Vec<TableSpan> {
    if parts <= 1 {
        return vec![span.clone()];
    }
    let mut spans = Vec::with_capacity(parts);
    let mut start = span.start_key.clone();
    for i in 1..=parts {
        let end = if i == parts {
            span.end_key.clone()
        } else {
            // Inner boundaries extend the start key, keeping byte order.
            let mut key = span.start_key.clone();
            key.push((i * (u8::MAX as usize) / parts) as u8);
            key
        };
        spans.push(TableSpan {
            table_id: span.table_id,
            start_key: std::mem::take(&mut start),
            end_key: end.clone(),
        });
        start = end;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_span() {
        assert!(is_complete_span(&total_span(101)));
        let mut partial = total_span(101);
        partial.end_key.pop();
        assert!(!is_complete_span(&partial));
    }

    #[test]
    fn test_span_order_follows_table_order() {
        assert!(span_order_key(&total_span(101)) < span_order_key(&total_span(102)));
    }

    #[test]
    fn test_evenly_split_covers_table() {
        let spans = evenly_split_span(&total_span(7), 3);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].start_key, total_span(7).start_key);
        assert_eq!(spans[2].end_key, total_span(7).end_key);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_key, pair[1].start_key);
            assert!(pair[0].start_key < pair[0].end_key);
        }
    }
}
