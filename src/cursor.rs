//! Trail decoding.
//!
//! A [`Cursor`] borrows an open [`Db`], is positioned on one trail with
//! [`Cursor::seek`], and yields that trail's events in timestamp order. The
//! decode buffer is reused across events, so steady-state iteration does no
//! heap work. An attached [`EventFilter`] suppresses non-matching events
//! before they are yielded.
//!
//! [`MultiCursor`] merges any number of positioned cursors into one stream
//! ordered by `(timestamp, source index)`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::bits::{read_bits, read_bits64, read_varint};
use crate::db::Db;
use crate::error::Result;
use crate::filter::EventFilter;
use crate::item::{Item, ITEM_SENTINEL};

/// One decoded event: a timestamp plus the event's non-empty items.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Event {
    pub timestamp: u64,
    pub items: Vec<Item>,
}

/// Single-trail decoder. One owner at a time; create as many per reader as
/// needed.
pub struct Cursor<'db> {
    db: &'db Db,
    pos: u64,
    end: u64,
    ts: u64,
    first: bool,
    filter: Option<EventFilter>,
    event: Event,
}

impl<'db> Cursor<'db> {
    pub(crate) fn new(db: &'db Db) -> Self {
        Cursor {
            db,
            pos: 0,
            end: 0,
            ts: 0,
            first: true,
            filter: None,
            event: Event::default(),
        }
    }

    /// Position on the first event of `trail_id` and reset the timestamp
    /// accumulator.
    pub fn seek(&mut self, trail_id: u64) -> Result<()> {
        let (start, end) = self.db.trail_bounds(trail_id)?;
        self.pos = start;
        self.end = end;
        self.ts = 0;
        self.first = true;
        Ok(())
    }

    /// Attach (or clear) the event filter applied by `next` and `peek`.
    pub fn set_filter(&mut self, filter: Option<EventFilter>) {
        self.filter = filter;
    }

    /// Decode the next matching event of the current trail.
    pub fn next(&mut self) -> Option<&Event> {
        if self.decode_event() {
            Some(&self.event)
        } else {
            None
        }
    }

    /// Whether `next` would yield at least one more event. Leaves the
    /// cursor position unchanged; the decode buffer is clobbered.
    pub fn peek(&mut self) -> bool {
        let (pos, ts, first) = (self.pos, self.ts, self.first);
        let got = self.decode_event();
        self.pos = pos;
        self.ts = ts;
        self.first = first;
        got
    }

    pub(crate) fn current_event(&self) -> &Event {
        &self.event
    }

    fn decode_event(&mut self) -> bool {
        let trails = self.db.trails_bytes();
        let decoder = self.db.decoder();
        loop {
            if self.pos >= self.end {
                return false;
            }
            let (delta, used) = read_varint(trails, self.pos);
            self.pos += used as u64;
            self.ts = if self.first { delta } else { self.ts + delta };
            self.first = false;
            self.event.items.clear();
            loop {
                let entry = decoder.entry(read_bits(trails, self.pos, 16));
                if !entry.is_valid() {
                    // Unreachable on streams validated at open.
                    debug_assert!(false, "invalid codeword");
                    self.pos = self.end;
                    return false;
                }
                self.pos += entry.len as u64;
                if entry.is_item() {
                    if entry.a == ITEM_SENTINEL {
                        break;
                    }
                    self.event.items.push(entry.a);
                } else if entry.is_bigram() {
                    self.event.items.push(entry.a);
                    self.event.items.push(entry.b);
                } else {
                    let item = read_bits64(trails, self.pos, 64);
                    self.pos += 64;
                    self.event.items.push(item);
                }
            }
            self.event.timestamp = self.ts;
            match &self.filter {
                Some(f) if !f.match_items(&self.event.items) => continue,
                _ => return true,
            }
        }
    }
}

/// Time-ordered merge over several positioned cursors.
///
/// Sources advance independently; the merged stream is non-decreasing in
/// `(timestamp, source index)`. A source whose trail is exhausted drops out.
pub struct MultiCursor<'db> {
    cursors: Vec<Cursor<'db>>,
    heap: BinaryHeap<Reverse<(u64, usize)>>,
    primed: bool,
    last: Option<usize>,
}

impl<'db> MultiCursor<'db> {
    /// Merge `cursors`, each already positioned (and optionally filtered).
    pub fn new(cursors: Vec<Cursor<'db>>) -> Self {
        MultiCursor {
            heap: BinaryHeap::with_capacity(cursors.len()),
            cursors,
            primed: false,
            last: None,
        }
    }

    /// The next `(source index, event)` in merge order.
    pub fn next(&mut self) -> Option<(usize, &Event)> {
        if !self.primed {
            self.primed = true;
            for i in 0..self.cursors.len() {
                if self.cursors[i].next().is_some() {
                    self.heap
                        .push(Reverse((self.cursors[i].current_event().timestamp, i)));
                }
            }
        } else if let Some(l) = self.last.take() {
            if self.cursors[l].next().is_some() {
                self.heap
                    .push(Reverse((self.cursors[l].current_event().timestamp, l)));
            }
        }
        let Reverse((_, src)) = self.heap.pop()?;
        self.last = Some(src);
        Some((src, self.cursors[src].current_event()))
    }

    /// Tear down, handing the cursors back.
    pub fn into_cursors(self) -> Vec<Cursor<'db>> {
        self.cursors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Encoder;
    use crate::item::{item_field, item_val, make_item};
    use crate::uuids::Uuid;

    fn uuid(n: u8) -> Uuid {
        let mut u = [0u8; 16];
        u[0] = n;
        u
    }

    fn event_values(db: &Db, ev: &Event) -> Vec<(u32, String)> {
        ev.items
            .iter()
            .map(|&it| {
                (
                    item_field(it),
                    String::from_utf8(db.value(item_field(it), item_val(it)).unwrap().to_vec())
                        .unwrap(),
                )
            })
            .collect()
    }

    fn build_sample(path: &std::path::Path) {
        let mut enc = Encoder::new(path, &["user", "action"]).unwrap();
        // Out-of-order ingest; equal timestamps keep insertion order.
        enc.add(&uuid(1), 30, &[b"alice", b"close"]).unwrap();
        enc.add(&uuid(1), 10, &[b"alice", b"open"]).unwrap();
        enc.add(&uuid(1), 10, &[b"alice", b"save"]).unwrap();
        enc.add(&uuid(2), 20, &[b"bob", b"open"]).unwrap();
        enc.finalize().unwrap();
    }

    #[test]
    fn yields_sorted_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        let alice = db.get_trail_id(&uuid(1)).unwrap();
        let mut c = db.cursor();
        c.seek(alice).unwrap();
        let mut got = Vec::new();
        while let Some(ev) = c.next() {
            got.push((ev.timestamp, event_values(&db, ev)));
        }
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, 10);
        assert_eq!(got[1].0, 10);
        assert_eq!(got[2].0, 30);
        // Stable sort: "open" was ingested before "save" at t=10.
        assert_eq!(got[0].1[1].1, "open");
        assert_eq!(got[1].1[1].1, "save");
        assert_eq!(got[2].1[1].1, "close");
    }

    #[test]
    fn cursor_is_reusable_across_trails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        let mut c = db.cursor();
        for t in 0..db.num_trails() {
            c.seek(t).unwrap();
            assert!(c.next().is_some());
        }
        // Re-seek decodes from scratch.
        c.seek(0).unwrap();
        assert_eq!(c.next().unwrap().timestamp, 10);
    }

    #[test]
    fn filter_suppresses_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        let open = db.get_item(2, b"open").unwrap();
        let mut f = EventFilter::new();
        f.add_term(open, false);

        let alice = db.get_trail_id(&uuid(1)).unwrap();
        let mut c = db.cursor();
        c.set_filter(Some(f));
        c.seek(alice).unwrap();
        let mut stamps = Vec::new();
        while let Some(ev) = c.next() {
            assert!(ev.items.contains(&open));
            stamps.push(ev.timestamp);
        }
        assert_eq!(stamps, vec![10]);
    }

    #[test]
    fn peek_does_not_consume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        let mut c = db.cursor();
        c.seek(db.get_trail_id(&uuid(2)).unwrap()).unwrap();
        assert!(c.peek());
        assert!(c.peek());
        assert_eq!(c.next().unwrap().timestamp, 20);
        assert!(!c.peek());
        assert!(c.next().is_none());
    }

    #[test]
    fn peek_respects_filter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        // A term that matches nothing in this store.
        let mut f = EventFilter::new();
        f.add_term(make_item(1, 0x1234), false);
        let mut c = db.cursor();
        c.set_filter(Some(f));
        c.seek(0).unwrap();
        assert!(!c.peek());
        assert!(c.next().is_none());
    }

    #[test]
    fn multicursor_merges_by_time_then_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        let mut enc = Encoder::new(&path, &["f"]).unwrap();
        enc.add(&uuid(1), 10, &[b"a"]).unwrap();
        enc.add(&uuid(1), 30, &[b"b"]).unwrap();
        enc.add(&uuid(2), 10, &[b"c"]).unwrap();
        enc.add(&uuid(2), 20, &[b"d"]).unwrap();
        enc.finalize().unwrap();
        let db = Db::open(&path).unwrap();

        let mut c1 = db.cursor();
        c1.seek(db.get_trail_id(&uuid(1)).unwrap()).unwrap();
        let mut c2 = db.cursor();
        c2.seek(db.get_trail_id(&uuid(2)).unwrap()).unwrap();

        let mut merged = MultiCursor::new(vec![c1, c2]);
        let mut got = Vec::new();
        while let Some((src, ev)) = merged.next() {
            got.push((src, ev.timestamp));
        }
        // t=10 tie resolves to source 0 first.
        assert_eq!(got, vec![(0, 10), (1, 10), (1, 20), (0, 30)]);
    }

    #[test]
    fn multicursor_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        build_sample(&path);
        let db = Db::open(&path).unwrap();
        let mut c = db.cursor();
        c.seek(0).unwrap();
        // Exhaust it first.
        while c.next().is_some() {}
        let mut merged = MultiCursor::new(vec![c]);
        assert!(merged.next().is_none());
    }
}
