//! Fragmentation of oversized payloads on the socket channel.
//!
//! A serialized message longer than the threshold is cut into ordered
//! fragments `{ "id", "chunk", "end" }` sharing one id. The receiver buffers
//! fragments per id and only parses the payload once `end` is seen.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{trace, warn};
use uuid::Uuid;

/// Default maximum payload size before fragmentation, in bytes.
pub const DEFAULT_CHUNK_THRESHOLD: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub chunk: String,
    pub end: bool,
}

impl Chunk {
    /// A JSON value is a chunk when it has exactly the chunk shape.
    pub fn from_value(value: &Value) -> Option<Chunk> {
        let map = value.as_object()?;
        if map.len() != 3 || !map.contains_key("chunk") {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }
}

/// Split `payload` into wire texts. A payload of at most `threshold` bytes is
/// returned unchanged as a single element.
pub fn split_payload(payload: String, threshold: usize) -> Vec<String> {
    if threshold == 0 || payload.len() <= threshold {
        return vec![payload];
    }

    let id = Uuid::new_v4().to_string();
    let mut parts = Vec::new();
    let mut rest = payload.as_str();
    while !rest.is_empty() {
        let cut = floor_char_boundary(rest, threshold);
        let (head, tail) = rest.split_at(cut);
        rest = tail;
        parts.push(Chunk {
            id: id.clone(),
            chunk: head.to_owned(),
            end: rest.is_empty(),
        });
    }
    trace!(%id, fragments = parts.len(), "payload fragmented");

    parts
        .into_iter()
        .filter_map(|c| serde_json::to_string(&c).ok())
        .collect()
}

/// Largest index `<= max` that falls on a char boundary, but never 0 so that
/// progress is guaranteed.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        // threshold smaller than the first char; take the whole char
        let mut j = max;
        while !s.is_char_boundary(j) {
            j += 1;
        }
        j
    } else {
        i
    }
}

/// Largest payload a single chunk id may grow to.
pub const MAX_CHUNKED_PAYLOAD: usize = 64 * 1024 * 1024;
/// Largest amount of partial data buffered across all ids.
pub const MAX_BUFFERED: usize = 256 * 1024 * 1024;

/// Buffers incoming fragments until their payload is complete.
///
/// A payload that outgrows its limit, or would push the total over the
/// buffer limit, is dropped; its remaining fragments are ignored up to and
/// including the one marked `end`.
#[derive(Debug)]
pub struct ChunkAssembler {
    buffers: HashMap<String, String>,
    dropped: HashSet<String>,
    buffered: usize,
    max_payload: usize,
    max_buffered: usize,
}

impl Default for ChunkAssembler {
    fn default() -> Self {
        Self::with_limits(MAX_CHUNKED_PAYLOAD, MAX_BUFFERED)
    }
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_payload: usize, max_buffered: usize) -> Self {
        Self {
            buffers: HashMap::new(),
            dropped: HashSet::new(),
            buffered: 0,
            max_payload,
            max_buffered,
        }
    }

    /// Feed one fragment. Returns the full payload text once the last
    /// fragment of its id arrives.
    pub fn push(&mut self, chunk: Chunk) -> Option<String> {
        if self.dropped.contains(&chunk.id) {
            if chunk.end {
                self.dropped.remove(&chunk.id);
            }
            return None;
        }

        let held = self.buffers.get(&chunk.id).map_or(0, String::len);
        let size = chunk.chunk.len();
        if held + size > self.max_payload || self.buffered + size > self.max_buffered {
            warn!(
                id = %chunk.id,
                payload = held + size,
                buffered = self.buffered,
                "chunked payload over the buffer limit, dropping it"
            );
            self.discard(&chunk.id);
            if !chunk.end {
                self.dropped.insert(chunk.id);
            }
            return None;
        }

        self.buffered += size;
        let buffer = self.buffers.entry(chunk.id.clone()).or_default();
        buffer.push_str(&chunk.chunk);
        if chunk.end {
            let full = self.buffers.remove(&chunk.id);
            if let Some(full) = &full {
                self.buffered -= full.len();
            }
            full
        } else {
            None
        }
    }

    fn discard(&mut self, id: &str) {
        if let Some(partial) = self.buffers.remove(id) {
            self.buffered -= partial.len();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    /// Bytes of partial payloads currently held.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Drop every partial payload, e.g. after a disconnect.
    pub fn clear(&mut self) {
        if !self.buffers.is_empty() {
            warn!(partial = self.buffers.len(), "dropping incomplete chunked payloads");
        }
        self.buffers.clear();
        self.dropped.clear();
        self.buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::Request;
    use serde_json::json;

    fn request_of_len(target: usize) -> String {
        // pad a string param until the serialized request has exactly `target` bytes
        let base = serde_json::to_string(&Request::notification(
            "graph_on_change",
            Some(json!({"pad": ""})),
        ))
        .unwrap();
        let pad = "x".repeat(target - base.len());
        let s = serde_json::to_string(&Request::notification(
            "graph_on_change",
            Some(json!({"pad": pad})),
        ))
        .unwrap();
        assert_eq!(s.len(), target);
        s
    }

    #[test]
    fn payload_at_threshold_is_not_fragmented() {
        let payload = request_of_len(200);
        let parts = split_payload(payload.clone(), 200);
        assert_eq!(parts, vec![payload]);
    }

    #[test]
    fn one_byte_over_threshold_gives_two_fragments() {
        let payload = request_of_len(201);
        let parts = split_payload(payload.clone(), 200);
        assert_eq!(parts.len(), 2);

        let mut assembler = ChunkAssembler::new();
        let first: Chunk = serde_json::from_str(&parts[0]).unwrap();
        let second: Chunk = serde_json::from_str(&parts[1]).unwrap();
        assert_eq!(first.id, second.id);
        assert!(!first.end && second.end);
        assert!(assembler.push(first).is_none());
        let whole = assembler.push(second).unwrap();

        let original: Value = serde_json::from_str(&payload).unwrap();
        let rebuilt: Value = serde_json::from_str(&whole).unwrap();
        assert_eq!(original, rebuilt);
        assert_eq!(assembler.in_flight(), 0);
    }

    #[test]
    fn fragments_respect_char_boundaries() {
        let payload = "ąęść".repeat(10);
        let parts = split_payload(payload.clone(), 5);
        let mut assembler = ChunkAssembler::new();
        let mut whole = None;
        for p in parts {
            let c: Chunk = serde_json::from_str(&p).unwrap();
            assert!(c.chunk.len() <= 5);
            whole = assembler.push(c);
        }
        assert_eq!(whole.unwrap(), payload);
    }

    #[test]
    fn interleaved_ids_are_kept_apart() {
        let mut assembler = ChunkAssembler::new();
        let part = |id: &str, chunk: &str, end| Chunk { id: id.into(), chunk: chunk.into(), end };
        assert!(assembler.push(part("a", "{\"x\":", false)).is_none());
        assert!(assembler.push(part("b", "[1,", false)).is_none());
        assert_eq!(assembler.push(part("b", "2]", true)).unwrap(), "[1,2]");
        assert_eq!(assembler.push(part("a", "1}", true)).unwrap(), "{\"x\":1}");
    }

    #[test]
    fn oversized_payload_is_dropped_with_its_tail() {
        let mut assembler = ChunkAssembler::with_limits(8, 100);
        let part = |id: &str, chunk: &str, end| Chunk { id: id.into(), chunk: chunk.into(), end };

        assert!(assembler.push(part("big", "12345", false)).is_none());
        assert!(assembler.push(part("big", "67890", false)).is_none());
        assert_eq!(assembler.in_flight(), 0);
        assert_eq!(assembler.buffered(), 0);
        // the rest of the dropped payload never comes out
        assert!(assembler.push(part("big", "1", true)).is_none());

        // the id is usable again afterwards
        assert_eq!(assembler.push(part("big", "[]", true)).unwrap(), "[]");
    }

    #[test]
    fn total_buffered_data_is_capped() {
        let mut assembler = ChunkAssembler::with_limits(8, 10);
        let part = |id: &str, chunk: &str, end| Chunk { id: id.into(), chunk: chunk.into(), end };

        assert!(assembler.push(part("a", "123456", false)).is_none());
        assert!(assembler.push(part("b", "123456", false)).is_none());
        assert_eq!(assembler.in_flight(), 1);
        assert_eq!(assembler.buffered(), 6);

        assert_eq!(assembler.push(part("a", "78", true)).unwrap(), "12345678");
        assert_eq!(assembler.buffered(), 0);
        assert!(assembler.push(part("b", "x", true)).is_none());
    }

    #[test]
    fn chunk_shape_detection() {
        assert!(Chunk::from_value(&json!({"id": "a", "chunk": "{", "end": false})).is_some());
        assert!(Chunk::from_value(&json!({"jsonrpc": "2.0", "method": "x", "id": "a"})).is_none());
    }
}
