//! Sorted dispatch table mapping message tags to handlers.
//!
//! The table is built once at reactor construction, sorted ascending by
//! tag, and looked up with a binary search on every frame. Entries carry
//! per-tag invocation counters for operator observability; a single
//! shared entry accumulates everything arriving under unknown tags.

use wirehub_core::error::{ErrorKind, Result};

use crate::reactor::{ConnId, Reactor};

/// A protocol handler. Receives the reactor, the connection the frame
/// arrived on, the tag and a payload slice bounded to exactly the
/// declared length. Payloads are raw bytes with no terminator; handlers
/// must never read past the slice.
pub type Handler = fn(&mut Reactor, ConnId, u16, &[u8]);

#[derive(Debug)]
struct DispatchEntry {
    tag: u16,
    handler: Handler,
    exempt: bool,
    count: u64,
    bytes: u64,
}

/// The process-wide command table, owned by the reactor.
#[derive(Debug)]
pub struct DispatchTable {
    entries: Vec<DispatchEntry>,
    unknown_tag: u16,
    unknown_count: u64,
    unknown_bytes: u64,
}

impl DispatchTable {
    /// Builds a table from `(tag, handler, flood-exempt)` triples.
    /// Entries are sorted by tag; duplicates are rejected.
    pub fn new(mut entries: Vec<(u16, Handler, bool)>) -> Result<DispatchTable> {
        entries.sort_by_key(|entry| entry.0);
        for pair in entries.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(ErrorKind::ProtocolViolation(format!(
                    "duplicate dispatch entry for tag {}",
                    pair[0].0
                )));
            }
        }
        Ok(DispatchTable {
            entries: entries
                .into_iter()
                .map(|(tag, handler, exempt)| DispatchEntry {
                    tag,
                    handler,
                    exempt,
                    count: 0,
                    bytes: 0,
                })
                .collect(),
            unknown_tag: 0,
            unknown_count: 0,
            unknown_bytes: 0,
        })
    }

    /// Binary-searches the table for `tag`.
    pub fn position(&self, tag: u16) -> Option<usize> {
        self.entries.binary_search_by_key(&tag, |entry| entry.tag).ok()
    }

    /// The handler and exemption flag at `index`.
    pub fn entry(&self, index: usize) -> (Handler, bool) {
        let entry = &self.entries[index];
        (entry.handler, entry.exempt)
    }

    /// Bumps the invocation counters at `index` after a dispatch.
    pub fn record(&mut self, index: usize, payload_len: usize) {
        let entry = &mut self.entries[index];
        entry.count += 1;
        entry.bytes += payload_len as u64;
    }

    /// Accounts a frame that matched no entry.
    pub fn note_unknown(&mut self, tag: u16, payload_len: usize) {
        self.unknown_tag = tag;
        self.unknown_count += 1;
        self.unknown_bytes += payload_len as u64;
    }

    /// The counters for `tag`, if a handler is registered for it.
    pub fn counters(&self, tag: u16) -> Option<(u64, u64)> {
        self.position(tag).map(|index| {
            let entry = &self.entries[index];
            (entry.count, entry.bytes)
        })
    }

    /// The most recent unknown tag and the shared unknown counters.
    pub fn unknown(&self) -> (u16, u64, u64) {
        (self.unknown_tag, self.unknown_count, self.unknown_bytes)
    }

    /// Every entry's `(tag, count, bytes)` row, in tag order.
    pub fn rows(&self) -> Vec<(u16, u64, u64)> {
        self.entries.iter().map(|entry| (entry.tag, entry.count, entry.bytes)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut Reactor, _: ConnId, _: u16, _: &[u8]) {}

    #[test]
    fn test_lookup_after_unsorted_registration() {
        let table = DispatchTable::new(vec![
            (750, noop as Handler, false),
            (2, noop as Handler, false),
            (10010, noop as Handler, false),
            (205, noop as Handler, true),
        ])
        .unwrap();

        for tag in [2u16, 205, 750, 10010] {
            assert!(table.position(tag).is_some(), "tag {}", tag);
        }
        assert!(table.position(3).is_none());
        assert!(table.position(0).is_none());
        assert!(table.position(65535).is_none());
    }

    #[test]
    fn test_duplicate_tags_rejected() {
        let result =
            DispatchTable::new(vec![(2, noop as Handler, false), (2, noop as Handler, true)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_counters_accumulate() {
        let mut table = DispatchTable::new(vec![(2, noop as Handler, false)]).unwrap();
        let index = table.position(2).unwrap();
        table.record(index, 10);
        table.record(index, 5);
        assert_eq!(table.counters(2), Some((2, 15)));
    }

    #[test]
    fn test_unknown_counter_shared() {
        let mut table = DispatchTable::new(vec![(2, noop as Handler, false)]).unwrap();
        table.note_unknown(9999, 3);
        table.note_unknown(1234, 7);
        assert_eq!(table.unknown(), (1234, 2, 10));
        assert_eq!(table.counters(2), Some((0, 0)));
    }

    #[test]
    fn test_exempt_flag_preserved() {
        let table = DispatchTable::new(vec![
            (751, noop as Handler, true),
            (205, noop as Handler, false),
        ])
        .unwrap();
        assert!(table.entry(table.position(751).unwrap()).1);
        assert!(!table.entry(table.position(205).unwrap()).1);
    }
}
