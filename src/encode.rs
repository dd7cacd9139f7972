//! Two-pass store construction.
//!
//! [`Encoder`] ingests `(uuid, timestamp, values)` tuples, buffering events
//! in a flat arena keyed by transient group id. `finalize` then runs:
//!
//! * pass 1: stable-sort events per trail by timestamp, stream items and
//!   adjacent item pairs through frequency counters (sampling trails when
//!   the corpus is very large), and build the canonical Huffman codebook;
//! * pass 2: emit every trail in UUID order as varint timestamp deltas plus
//!   codewords, recording per-trail bit offsets in the table of contents.
//!
//! The encoder is single-writer: one owner mutates it, and `finalize`
//! consumes it. Nothing touches the filesystem until `finalize`.

use std::path::{Path, PathBuf};

use log::debug;

use crate::bits::BitBuf;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::huffman::{Codebook, SymbolStats};
use crate::item::{make_item, Item, MAX_WIDE_FIELD};
use crate::lexicon::LexiconBuilder;
use crate::sections::{
    lexicon_section, write_directory, write_package, SECTION_CODEBOOK, SECTION_FIELDS,
    SECTION_INFO, SECTION_TOC, SECTION_TRAILS, SECTION_UUIDS, VERSION,
};
use crate::uuids::{Uuid, UuidMap};
use crate::{MAX_FIELDNAME_LENGTH, MAX_NUM_FIELDS, MAX_TIMEDELTA};

/// Above this many events, pass 1 samples trails instead of counting all.
const SAMPLE_THRESHOLD: u64 = 10_000_000;

/// Build options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderOptions {
    /// Write one package file instead of a directory of sections.
    pub package: bool,
}

struct EventRow {
    group: u64,
    timestamp: u64,
    item_off: usize,
    item_len: u32,
}

/// Store builder. See the module docs for the lifecycle.
pub struct Encoder {
    path: PathBuf,
    opts: EncoderOptions,
    field_names: Vec<String>,
    lexicons: Vec<LexiconBuilder>,
    uuids: UuidMap,
    rows: Vec<EventRow>,
    items: Vec<Item>,
    min_timestamp: u64,
    max_timestamp: u64,
}

fn validate_field_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_FIELDNAME_LENGTH || name == "time" {
        return Err(Error::InvalidFieldName);
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_')
    {
        return Err(Error::InvalidFieldName);
    }
    Ok(())
}

impl Encoder {
    /// Start a build writing a directory layout at `path`.
    pub fn new(path: impl AsRef<Path>, field_names: &[&str]) -> Result<Encoder> {
        Encoder::with_options(path, field_names, EncoderOptions::default())
    }

    /// Start a build with explicit options.
    pub fn with_options(
        path: impl AsRef<Path>,
        field_names: &[&str],
        opts: EncoderOptions,
    ) -> Result<Encoder> {
        if field_names.len() > MAX_NUM_FIELDS {
            return Err(Error::TooManyFields);
        }
        debug_assert!(MAX_NUM_FIELDS < MAX_WIDE_FIELD as usize);
        for (i, name) in field_names.iter().enumerate() {
            validate_field_name(name)?;
            if field_names[..i].contains(name) {
                return Err(Error::DuplicateField);
            }
        }
        Ok(Encoder {
            path: path.as_ref().to_owned(),
            opts,
            field_names: field_names.iter().map(|s| s.to_string()).collect(),
            lexicons: field_names.iter().map(|_| LexiconBuilder::new()).collect(),
            uuids: UuidMap::new(),
            rows: Vec::new(),
            items: Vec::new(),
            min_timestamp: u64::MAX,
            max_timestamp: 0,
        })
    }

    /// Shrink every field's narrow-domain bound. Exercising the overflow
    /// path with the real bound would need 16M distinct values per field.
    #[cfg(test)]
    pub(crate) fn shrink_narrow_bound(&mut self, bound: u64) {
        self.lexicons = self
            .field_names
            .iter()
            .map(|_| LexiconBuilder::with_narrow_bound(bound))
            .collect();
    }

    /// Number of user fields.
    pub fn num_fields(&self) -> usize {
        self.field_names.len()
    }

    /// Buffer one event. `values` holds at most one byte string per user
    /// field, in field order; missing trailing fields default to the empty
    /// value.
    pub fn add(&mut self, uuid: &Uuid, timestamp: u64, values: &[&[u8]]) -> Result<()> {
        if values.len() > self.field_names.len() {
            return Err(Error::UnknownField);
        }
        let item_off = self.items.len();
        for (i, value) in values.iter().enumerate() {
            let val = self.lexicons[i].insert(value)?;
            if val > 0 {
                self.items.push(make_item(i as u32 + 1, val));
            }
        }
        let group = self.uuids.insert_or_get(uuid);
        self.rows.push(EventRow {
            group,
            timestamp,
            item_off,
            item_len: (self.items.len() - item_off) as u32,
        });
        self.min_timestamp = self.min_timestamp.min(timestamp);
        self.max_timestamp = self.max_timestamp.max(timestamp);
        Ok(())
    }

    /// Re-emit every event of `db` through [`Encoder::add`], remapping its
    /// items through this build's lexicons. Every user field of `db` must
    /// exist here (by name); event order within a trail is preserved.
    pub fn append(&mut self, db: &Db) -> Result<()> {
        let mut field_map = Vec::with_capacity(db.num_fields() as usize);
        for f in 1..db.num_fields() as u32 {
            let name = db.field_name(f)?;
            let idx = self
                .field_names
                .iter()
                .position(|n| n == name)
                .ok_or(Error::UnknownField)?;
            field_map.push(idx);
        }
        let empty: &[u8] = b"";
        let mut values: Vec<&[u8]> = vec![empty; self.field_names.len()];
        let mut cursor = db.cursor();
        for trail_id in 0..db.num_trails() {
            let uuid = *db.get_uuid(trail_id)?;
            cursor.seek(trail_id)?;
            while let Some(event) = cursor.next() {
                values.iter_mut().for_each(|v| *v = empty);
                for &it in event.items.iter() {
                    let f = crate::item::item_field(it);
                    let bytes = db.value(f, crate::item::item_val(it))?;
                    values[field_map[f as usize - 1]] = bytes;
                }
                let timestamp = event.timestamp;
                self.add(&uuid, timestamp, &values)?;
            }
        }
        Ok(())
    }

    /// Run both passes and write the store.
    pub fn finalize(self) -> Result<()> {
        let num_events = self.rows.len() as u64;
        let num_trails = self.uuids.len();
        let (uuid_bytes, trail_of_group) = self.uuids.finalize();

        // Stable sort: ties on timestamp keep ingestion order.
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by_key(|&i| {
            let row = &self.rows[i];
            (trail_of_group[row.group as usize], row.timestamp)
        });

        let row_items = |i: usize| -> &[Item] {
            let row = &self.rows[i];
            &self.items[row.item_off..row.item_off + row.item_len as usize]
        };

        // Pass 1: model.
        let sample_rate = if num_events > SAMPLE_THRESHOLD {
            num_events / SAMPLE_THRESHOLD + 1
        } else {
            1
        };
        let mut stats = SymbolStats::new();
        for &i in &order {
            let trail = trail_of_group[self.rows[i].group as usize];
            if trail % sample_rate == 0 {
                stats.count_event(row_items(i));
            }
        }
        let codebook = Codebook::build(&stats, num_events);
        let codes = codebook.encoder();

        // Pass 2: emit.
        let mut buf = BitBuf::new();
        let mut toc = Vec::with_capacity(num_trails as usize + 1);
        let mut at = 0usize;
        for trail_id in 0..num_trails {
            toc.push(buf.bit_pos());
            let mut prev_ts = 0u64;
            let mut first = true;
            while at < order.len()
                && trail_of_group[self.rows[order[at]].group as usize] == trail_id
            {
                let row = &self.rows[order[at]];
                // The first event's absolute timestamp is its delta from
                // zero, so one bound covers both.
                let delta = if first {
                    row.timestamp
                } else {
                    row.timestamp - prev_ts
                };
                if delta > MAX_TIMEDELTA {
                    return Err(Error::TimestampTooLarge);
                }
                buf.put_varint(delta);
                prev_ts = row.timestamp;
                first = false;

                let items = row_items(order[at]);
                let mut i = 0;
                while i < items.len() {
                    if i + 1 < items.len() {
                        if let Some((pattern, len)) = codes.bigram(items[i], items[i + 1]) {
                            buf.put(pattern as u64, len as u32);
                            i += 2;
                            continue;
                        }
                    }
                    match codes.item(items[i]) {
                        Some((pattern, len)) => buf.put(pattern as u64, len as u32),
                        None => {
                            let (pattern, len) = codes.escape();
                            buf.put(pattern as u64, len as u32);
                            buf.put64(items[i]);
                        }
                    }
                    i += 1;
                }
                let (pattern, len) = codes
                    .item(crate::item::ITEM_SENTINEL)
                    .expect("sentinel is always in the codebook");
                buf.put(pattern as u64, len as u32);
                at += 1;
            }
            debug_assert!(!first, "every trail owns at least one event");
        }
        toc.push(buf.bit_pos());

        debug!(
            "encoded {} trails, {} events, {} codebook symbols, {} trail bits",
            num_trails,
            num_events,
            codebook.entries.len(),
            buf.bit_pos()
        );

        // Assemble sections in on-disk order.
        let num_fields_total = self.field_names.len() as u64 + 1;
        let mut sections: Vec<(String, Vec<u8>)> = Vec::new();
        sections.push((
            SECTION_INFO.to_owned(),
            self.build_info(num_trails, num_events, num_fields_total),
        ));
        sections.push((SECTION_FIELDS.to_owned(), self.build_fields()));
        for (i, lex) in self.lexicons.iter().enumerate() {
            sections.push((lexicon_section(i as u32 + 1), lex.finalize()?));
        }
        sections.push((SECTION_UUIDS.to_owned(), uuid_bytes));
        sections.push((SECTION_CODEBOOK.to_owned(), codebook.to_bytes()));
        sections.push((SECTION_TOC.to_owned(), build_toc(&toc)));
        sections.push((SECTION_TRAILS.to_owned(), buf.into_bytes()));

        if self.opts.package {
            write_package(&self.path, &sections)
        } else {
            write_directory(&self.path, &sections)
        }
    }

    fn build_info(&self, num_trails: u64, num_events: u64, num_fields: u64) -> Vec<u8> {
        let min_ts = if num_events == 0 { 0 } else { self.min_timestamp };
        let mut out = Vec::with_capacity(56 + num_fields.div_ceil(8) as usize);
        for word in [
            VERSION,
            num_trails,
            num_events,
            num_fields,
            min_ts,
            self.max_timestamp,
            0, // trails_per_page: stores are not paged; the index carries its own.
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        let mut bitmap = vec![0u8; num_fields.div_ceil(8) as usize];
        for (i, lex) in self.lexicons.iter().enumerate() {
            if lex.has_overflow() {
                let f = i + 1;
                bitmap[f / 8] |= 1 << (f % 8);
            }
        }
        out.extend_from_slice(&bitmap);
        out
    }

    fn build_fields(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for name in &self.field_names {
            out.extend_from_slice(&(name.len() as u32).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        out
    }
}

fn build_toc(offsets: &[u64]) -> Vec<u8> {
    let max = offsets.last().copied().unwrap_or(0);
    let wide = max > u32::MAX as u64;
    let width: u32 = if wide { 8 } else { 4 };
    let mut out = Vec::with_capacity(4 + offsets.len() * width as usize);
    out.extend_from_slice(&width.to_le_bytes());
    for &o in offsets {
        if wide {
            out.extend_from_slice(&o.to_le_bytes());
        } else {
            out.extend_from_slice(&(o as u32).to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u8) -> Uuid {
        let mut u = [0u8; 16];
        u[0] = n;
        u
    }

    #[test]
    fn field_name_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        assert_eq!(
            Encoder::new(&path, &["ok", "time"]).err(),
            Some(Error::InvalidFieldName)
        );
        assert_eq!(
            Encoder::new(&path, &[""]).err(),
            Some(Error::InvalidFieldName)
        );
        assert_eq!(
            Encoder::new(&path, &["has space"]).err(),
            Some(Error::InvalidFieldName)
        );
        assert_eq!(
            Encoder::new(&path, &["dup", "dup"]).err(),
            Some(Error::DuplicateField)
        );
        let long = "x".repeat(MAX_FIELDNAME_LENGTH + 1);
        assert_eq!(
            Encoder::new(&path, &[long.as_str()]).err(),
            Some(Error::InvalidFieldName)
        );
        assert!(Encoder::new(&path, &["a_1", "B2"]).is_ok());
    }

    #[test]
    fn too_many_values_in_one_event() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = Encoder::new(dir.path().join("t"), &["only"]).unwrap();
        assert_eq!(
            enc.add(&uuid(1), 0, &[b"a", b"b"]).err(),
            Some(Error::UnknownField)
        );
    }

    #[test]
    fn oversized_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = Encoder::new(dir.path().join("t"), &["v"]).unwrap();
        let big = vec![b'x'; crate::MAX_VALUE_SIZE + 1];
        assert_eq!(
            enc.add(&uuid(1), 0, &[&big]).err(),
            Some(Error::ValueTooLarge)
        );
    }

    #[test]
    fn empty_store_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        Encoder::new(&path, &["f"]).unwrap().finalize().unwrap();
        let db = Db::open(&path).unwrap();
        assert_eq!(db.num_trails(), 0);
        assert_eq!(db.num_events(), 0);
        assert_eq!(db.num_fields(), 2);
    }

    #[test]
    fn zero_field_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nofields");
        let mut enc = Encoder::new(&path, &[]).unwrap();
        enc.add(&uuid(1), 10, &[]).unwrap();
        enc.add(&uuid(1), 20, &[]).unwrap();
        enc.finalize().unwrap();
        let db = Db::open(&path).unwrap();
        assert_eq!(db.num_fields(), 1);
        assert_eq!(db.num_events(), 2);
        let mut c = db.cursor();
        c.seek(0).unwrap();
        let ts: Vec<u64> = std::iter::from_fn(|| c.next().map(|e| e.timestamp)).collect();
        assert_eq!(ts, vec![10, 20]);
    }

    #[test]
    fn overflow_past_narrow_bound_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ovf");
        let mut enc = Encoder::new(&path, &["normal", "wide"]).unwrap();
        enc.shrink_narrow_bound(8);
        let n = 20u32;
        for i in 0..n {
            enc.add(
                &uuid(1),
                i as u64,
                &[b"same", format!("value-{i}").as_bytes()],
            )
            .unwrap();
        }
        enc.finalize().unwrap();

        let db = Db::open(&path).unwrap();
        assert!(!db.field_has_overflow_vals(0).unwrap());
        assert!(!db.field_has_overflow_vals(1).unwrap());
        assert!(db.field_has_overflow_vals(2).unwrap());
        // Every value reads back intact, including those past the bound.
        let mut c = db.cursor();
        c.seek(0).unwrap();
        let mut seen = Vec::new();
        while let Some(ev) = c.next() {
            for &it in ev.items.iter() {
                if crate::item::item_field(it) == 2 {
                    seen.push(
                        String::from_utf8(
                            db.value(2, crate::item::item_val(it)).unwrap().to_vec(),
                        )
                        .unwrap(),
                    );
                }
            }
        }
        let expect: Vec<String> = (0..n).map(|i| format!("value-{i}")).collect();
        assert_eq!(seen, expect);
    }

    #[test]
    fn timestamp_delta_guard() {
        // Accumulated timestamps may pass the delta bound as long as every
        // step, including the first absolute one, stays within it.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide_ts");
        let mut enc = Encoder::new(&path, &["f"]).unwrap();
        enc.add(&uuid(1), MAX_TIMEDELTA, &[b"a"]).unwrap();
        enc.add(&uuid(1), 2 * MAX_TIMEDELTA, &[b"b"]).unwrap();
        enc.finalize().unwrap();
        let db = Db::open(&path).unwrap();
        assert_eq!(db.max_timestamp(), 2 * MAX_TIMEDELTA);
        let mut c = db.cursor();
        c.seek(0).unwrap();
        let ts: Vec<u64> = std::iter::from_fn(|| c.next().map(|e| e.timestamp)).collect();
        assert_eq!(ts, vec![MAX_TIMEDELTA, 2 * MAX_TIMEDELTA]);

        // An in-trail delta past the bound is a fatal build error.
        let path2 = dir.path().join("bad_delta");
        let mut enc = Encoder::new(&path2, &["f"]).unwrap();
        enc.add(&uuid(1), 0, &[b"a"]).unwrap();
        enc.add(&uuid(1), MAX_TIMEDELTA + 1, &[b"b"]).unwrap();
        assert_eq!(enc.finalize().err(), Some(Error::TimestampTooLarge));

        // So is a first absolute timestamp past the bound.
        let path3 = dir.path().join("bad_first");
        let mut enc = Encoder::new(&path3, &["f"]).unwrap();
        enc.add(&uuid(1), MAX_TIMEDELTA + 1, &[b"a"]).unwrap();
        assert_eq!(enc.finalize().err(), Some(Error::TimestampTooLarge));
    }
}
