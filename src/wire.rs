//! The line protocol spoken between the transport and a consumer.
//!
//! Outbound (profiler to consumer): one JSON envelope per line,
//! `{"type":"SUMMARY"|"LIVE_ALLOCS","payload":{..}}`.
//! Inbound (consumer to profiler): plain text lines; only `SNAPSHOT` means
//! anything.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockInfo;

pub const SNAPSHOT_COMMAND: &str = "SNAPSHOT";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub bytes_in_use: u64,
    pub peak: u64,
    pub alloc_count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveAllocs {
    pub blocks: Vec<BlockInfo>,
}

/// A decoded outbound frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Frame {
    #[serde(rename = "SUMMARY")]
    Summary(Summary),
    #[serde(rename = "LIVE_ALLOCS")]
    LiveAllocs(LiveAllocs),
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Frame {
    /// Decodes one line (with or without its trailing newline).
    pub fn parse(line: &str) -> Result<Frame, WireError> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}

/// A command a consumer may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Snapshot,
}

impl Command {
    /// Recognizes a command line. Surrounding whitespace is ignored; anything
    /// unrecognized yields `None`.
    pub fn parse(line: &str) -> Option<Command> {
        match line.trim() {
            SNAPSHOT_COMMAND => Some(Command::Snapshot),
            _ => None,
        }
    }

    /// The command as it goes on the wire, newline included.
    pub fn to_line(self) -> &'static str {
        match self {
            Command::Snapshot => "SNAPSHOT\n",
        }
    }
}
