//! Text formats for tracker output.
//!
//! Everything here is a pure function of its arguments: no tracker access, no
//! I/O, and identical input always produces identical bytes.

use std::fmt::{self, Display, Formatter, Write};

use serde::Serialize;

use crate::block::BlockInfo;

/// Header row of [`live_allocs_csv`].
pub const CSV_HEADER: &str = "ptr,size,alloc_id,thread_id,t_ns,callsite";

/// Tag carried by every message envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Summary,
    LiveAllocs,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Summary => "SUMMARY",
            MessageKind::LiveAllocs => "LIVE_ALLOCS",
        }
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct SummaryPayload {
    bytes_in_use: usize,
    peak: usize,
    alloc_count: usize,
}

#[derive(Serialize)]
struct LiveAllocsPayload<'a> {
    blocks: &'a [BlockInfo],
}

// Serializing plain structs of numbers and strings into a `String` cannot
// fail; fall back to an empty object rather than panicking inside the host.
fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("{}"))
}

/// `{"bytes_in_use":N,"peak":N,"alloc_count":N}`
pub fn summary_json(bytes_in_use: usize, peak: usize, alloc_count: usize) -> String {
    to_json(&SummaryPayload {
        bytes_in_use,
        peak,
        alloc_count,
    })
}

/// `{"blocks":[{"ptr":"..","size":..,..},..]}` with blocks in the order given.
pub fn live_allocs_json(blocks: &[BlockInfo]) -> String {
    to_json(&LiveAllocsPayload { blocks })
}

/// [`CSV_HEADER`] followed by one row per block, in the order given.
///
/// Only the callsite column is free text; it is quoted when it contains a
/// comma, quote, or line break so every row keeps exactly six columns.
pub fn live_allocs_csv(blocks: &[BlockInfo]) -> String {
    let mut out = String::with_capacity(CSV_HEADER.len() + 1 + blocks.len() * 64);
    out.push_str(CSV_HEADER);
    out.push('\n');
    for b in blocks {
        let _ = write!(
            out,
            "{},{},{},{},{},",
            b.ptr, b.size, b.alloc_id, b.thread_id, b.t_ns
        );
        push_csv_field(&mut out, &b.callsite);
        out.push('\n');
    }
    out
}

fn push_csv_field(out: &mut String, field: &str) {
    if !field.contains(|c: char| matches!(c, ',' | '"' | '\n' | '\r')) {
        out.push_str(field);
        return;
    }
    out.push('"');
    for c in field.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
}

/// Wraps an already-serialized JSON object: `{"type":"KIND","payload":PAYLOAD}`.
pub fn message_json(kind: MessageKind, payload: &str) -> String {
    let mut out = String::with_capacity(payload.len() + 32);
    out.push_str("{\"type\":\"");
    out.push_str(kind.as_str());
    out.push_str("\",\"payload\":");
    out.push_str(payload);
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn block(id: u64, callsite: &str) -> BlockInfo {
        BlockInfo {
            ptr: 1000 + id as usize,
            size: 16,
            alloc_id: id,
            thread_id: 2,
            t_ns: 500,
            callsite: callsite.to_owned(),
            file: "f.rs".to_owned(),
            line: 3,
            type_name: "T".to_owned(),
        }
    }

    #[test]
    fn summary_shape() {
        assert_eq!(
            summary_json(10, 20, 3),
            r#"{"bytes_in_use":10,"peak":20,"alloc_count":3}"#
        );
    }

    #[test]
    fn envelope_shape() {
        let msg = message_json(MessageKind::Summary, &summary_json(1, 2, 3));
        assert_eq!(
            msg,
            r#"{"type":"SUMMARY","payload":{"bytes_in_use":1,"peak":2,"alloc_count":3}}"#
        );
        let msg = message_json(MessageKind::LiveAllocs, &live_allocs_json(&[]));
        assert_eq!(msg, r#"{"type":"LIVE_ALLOCS","payload":{"blocks":[]}}"#);
    }

    #[test]
    fn csv_header_is_stable() {
        for blocks in [vec![], vec![block(1, "a,b\n\"c\"")]] {
            let csv = live_allocs_csv(&blocks);
            let header: Vec<&str> = csv.lines().next().unwrap().split(',').collect();
            assert_eq!(
                header,
                ["ptr", "size", "alloc_id", "thread_id", "t_ns", "callsite"]
            );
        }
    }

    #[test]
    fn csv_rows_keep_supplied_order() {
        let blocks = [block(7, "x.rs:1"), block(3, "y.rs:2")];
        let csv = live_allocs_csv(&blocks);
        assert_eq!(
            csv,
            "ptr,size,alloc_id,thread_id,t_ns,callsite\n\
             1007,16,7,2,500,x.rs:1\n\
             1003,16,3,2,500,y.rs:2\n"
        );
    }

    #[test]
    fn csv_quotes_structural_characters() {
        let csv = live_allocs_csv(&[block(1, "we\"ird,file.rs:9")]);
        assert!(csv.ends_with(",\"we\"\"ird,file.rs:9\"\n"));
    }

    #[test]
    fn json_escapes_free_text() {
        let mut b = block(1, "bad\"name\nfile.rs:1");
        b.file = "C:\\src\\x.rs".to_owned();
        b.type_name = "Vec<\"T\">".to_owned();
        let json = live_allocs_json(&[b]);
        let v: Value = serde_json::from_str(&json).unwrap();
        let blocks = v["blocks"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["callsite"], "bad\"name\nfile.rs:1");
        assert_eq!(blocks[0]["file"], "C:\\src\\x.rs");
        assert_eq!(blocks[0]["type_name"], "Vec<\"T\">");
        assert_eq!(blocks[0]["ptr"], "1001");
        assert!(!json.contains('\n'));
    }

    #[test]
    fn json_field_order_matches_protocol() {
        let json = live_allocs_json(&[block(5, "f.rs:3")]);
        assert_eq!(
            json,
            r#"{"blocks":[{"ptr":"1005","size":16,"alloc_id":5,"thread_id":2,"t_ns":500,"callsite":"f.rs:3","file":"f.rs","line":3,"type_name":"T"}]}"#
        );
    }

    #[test]
    fn output_is_deterministic() {
        let blocks = [block(1, "a.rs:1"), block(2, "b.rs:2")];
        assert_eq!(live_allocs_json(&blocks), live_allocs_json(&blocks));
        assert_eq!(live_allocs_csv(&blocks), live_allocs_csv(&blocks));
    }
}
