//! Optional `HISTORY` section — build provenance across rebuilds.
//!
//! Grounded on `original_source/include/dwarfs/history.h`: the reference
//! tool keeps one entry per `mkdwarfs`/`--rebuild-metadata` invocation
//! (tool version, command line, timestamp), gated by `no_history`. This is
//! a feature the distilled spec dropped but the original carries; it is
//! additive and costs one small JSON-serialized section.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: u64,
    pub tool_version: String,
    pub command_line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct History {
    pub entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push(entry);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("History serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let mut h = History::new();
        h.push(HistoryEntry {
            timestamp: 1234,
            tool_version: "dwarfsrs 0.1.0".into(),
            command_line: "mkdwarfs -i src -o out.dwarfs".into(),
        });
        let bytes = h.to_bytes();
        let back = History::from_bytes(&bytes).unwrap();
        assert_eq!(back.entries.len(), 1);
        assert_eq!(back.entries[0].tool_version, "dwarfsrs 0.1.0");
    }
}
