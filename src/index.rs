//! Page-level posting-list index.
//!
//! Trails partition into at most 65 534 contiguous pages. For every item
//! the index records the set of pages whose trails contain at least one
//! event carrying that item; a CNF filter then evaluates to a page bitmap
//! and expands to candidate trail ids. The candidate set is always a
//! superset of the true match set, so scanning the candidates with the
//! filter attached is exact and usually far cheaper than a full scan.
//!
//! The build fans shard scans out across a fixed-size `rayon` pool of
//! `min(cores/2, shards)` workers; every shard covers a disjoint,
//! page-aligned trail range and opens its own reader, so no state is
//! shared while scanning. Page sets keep a packed small form, up to four
//! sorted 16-bit page numbers in one word, spilling to an ordered set
//! beyond that. The serial write phase merges shards in range order and
//! deduplicates identical page lists by content.
//!
//! File layout:
//!
//! ```text
//! version:u64  checksum:u64  trails_per_page:u64  field_offsets:u64[num_fields]
//! per field: width:u32  offsets:u(width*8)[num_items+1]  payload
//! ```
//!
//! Payload entries are `count:u16` then `count` ascending 1-based page
//! numbers; offsets are payload-relative. The checksum binds the index to
//! the exact store it was built from.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;
use rayon::prelude::*;
use xxhash_rust::xxh64::xxh64;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::filter::EventFilter;
use crate::item::{item_field, item_val, make_item, Field, Item};

/// Upper bound on pages per index.
pub const INDEX_NUM_PAGES: u64 = u16::MAX as u64 - 1;

/// Index format version.
pub const INDEX_VERSION: u64 = 1;

const NUM_SHARDS: usize = 8;
const CHECKSUM_SEED: u64 = 2016;
const HEADER_FIXED: usize = 24;

/// Checksum binding an index to its source store.
fn store_checksum(db: &Db) -> u64 {
    let mut data = [0u8; 48];
    for (i, word) in [
        db.num_trails(),
        db.num_events(),
        db.num_fields(),
        db.min_timestamp(),
        db.max_timestamp(),
        db.version(),
    ]
    .into_iter()
    .enumerate()
    {
        data[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
    }
    xxh64(&data, CHECKSUM_SEED)
}

/// Per-shard item to page-set maps.
#[derive(Default)]
struct ShardPages {
    small: HashMap<Item, u64>,
    large: HashMap<Item, BTreeSet<u16>>,
}

/// Record `page` in the packed small set. Pages arrive in non-decreasing
/// order. Returns `true` when the set is full and the page must spill.
fn add_page(word: &mut u64, page: u16) -> bool {
    debug_assert!(page != 0);
    let p = page as u64;
    for slot in 0..4 {
        let cur = (*word >> (slot * 16)) & 0xFFFF;
        if cur == p {
            return false;
        }
        if cur == 0 {
            *word |= p << (slot * 16);
            return false;
        }
    }
    true
}

impl ShardPages {
    fn record(&mut self, item: Item, page: u16) {
        let word = self.small.entry(item).or_insert(0);
        if add_page(word, page) {
            self.large.entry(item).or_default().insert(page);
        }
    }
}

fn scan_shard(
    db_path: &Path,
    trails_per_page: u64,
    start_trail: u64,
    end_trail: u64,
) -> Result<ShardPages> {
    let mut pages = ShardPages::default();
    if start_trail >= end_trail {
        return Ok(pages);
    }
    let db = Db::open(db_path)?;
    let mut cursor = db.cursor();
    for trail_id in start_trail..end_trail {
        let page = (1 + trail_id / trails_per_page) as u16;
        cursor.seek(trail_id)?;
        while let Some(event) = cursor.next() {
            for &item in event.items.iter() {
                pages.record(item, page);
            }
        }
    }
    Ok(pages)
}

/// Workers for `shards` independent scan jobs: half the machine, but
/// never more workers than shards.
fn shard_workers(shards: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores / 2).clamp(1, shards.max(1))
}

/// Build an index for the store at `db_path`, writing it to `index_path`.
pub fn create(db_path: &Path, index_path: &Path) -> Result<()> {
    let db = Db::open(db_path)?;
    let num_trails = db.num_trails();
    let trails_per_page = 1 + num_trails / INDEX_NUM_PAGES;
    let pages_per_shard = 1 + INDEX_NUM_PAGES / NUM_SHARDS as u64;

    // Page-aligned, disjoint trail ranges; each shard owns whole pages.
    let ranges: Vec<(u64, u64)> = (0..NUM_SHARDS as u64)
        .map(|shard| {
            let start = (shard * pages_per_shard * trails_per_page).min(num_trails);
            let end = ((shard + 1) * pages_per_shard * trails_per_page).min(num_trails);
            (start, end)
        })
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(shard_workers(NUM_SHARDS))
        .build()
        .map_err(|_| Error::OutOfMemory)?;
    let shards: Vec<ShardPages> = pool.install(|| {
        ranges
            .into_par_iter()
            .map(|(start, end)| scan_shard(db_path, trails_per_page, start, end))
            .collect::<Result<Vec<_>>>()
    })?;

    write_index(&db, index_path, trails_per_page, &shards)
}

/// Ascending page list of `item` across all shards.
fn gather_pages(shards: &[ShardPages], item: Item) -> Vec<u16> {
    let mut pages = Vec::new();
    for shard in shards {
        if let Some(&word) = shard.small.get(&item) {
            for slot in 0..4 {
                let p = ((word >> (slot * 16)) & 0xFFFF) as u16;
                if p != 0 {
                    pages.push(p);
                }
            }
            if let Some(set) = shard.large.get(&item) {
                pages.extend(set.iter().copied());
            }
        }
    }
    debug_assert!(pages.windows(2).all(|w| w[0] < w[1]));
    pages
}

fn write_index(
    db: &Db,
    index_path: &Path,
    trails_per_page: u64,
    shards: &[ShardPages],
) -> Result<()> {
    let num_fields = db.num_fields() as usize;
    let mut out =
        BufWriter::new(File::create(index_path).map_err(|_| Error::IoOpen)?);
    let wr = |out: &mut BufWriter<File>, bytes: &[u8]| -> Result<()> {
        out.write_all(bytes).map_err(|_| Error::IoWrite)
    };

    wr(&mut out, &INDEX_VERSION.to_le_bytes())?;
    wr(&mut out, &store_checksum(db).to_le_bytes())?;
    wr(&mut out, &trails_per_page.to_le_bytes())?;
    let mut field_offsets = vec![0u64; num_fields];
    for off in &field_offsets {
        wr(&mut out, &off.to_le_bytes())?;
    }

    let mut pos = (HEADER_FIXED + num_fields * 8) as u64;
    for f in 1..num_fields as Field {
        field_offsets[f as usize] = pos;
        let num_items = db.lexicon_size(f)?;
        let mut offsets = vec![0u64; num_items as usize + 1];
        let mut payload: Vec<u8> = Vec::new();
        let mut dedup: HashMap<Vec<u16>, u64> = HashMap::new();
        for v in 0..num_items {
            let pages = gather_pages(shards, make_item(f, v));
            offsets[v as usize] = match dedup.get(&pages) {
                Some(&off) => off,
                None => {
                    let off = payload.len() as u64;
                    payload.extend_from_slice(&(pages.len() as u16).to_le_bytes());
                    for &p in &pages {
                        payload.extend_from_slice(&p.to_le_bytes());
                    }
                    dedup.insert(pages, off);
                    off
                }
            };
        }
        offsets[num_items as usize] = payload.len() as u64;

        let wide = payload.len() as u64 > u32::MAX as u64;
        let width: u32 = if wide { 8 } else { 4 };
        wr(&mut out, &width.to_le_bytes())?;
        for &o in &offsets {
            if wide {
                wr(&mut out, &o.to_le_bytes())?;
            } else {
                wr(&mut out, &(o as u32).to_le_bytes())?;
            }
        }
        wr(&mut out, &payload)?;
        pos += 4 + (offsets.len() as u64) * width as u64 + payload.len() as u64;
    }

    // Patch the field offset table now that every field is placed.
    out.seek(SeekFrom::Start(HEADER_FIXED as u64))
        .map_err(|_| Error::IoWrite)?;
    for off in &field_offsets {
        wr(&mut out, &off.to_le_bytes())?;
    }
    out.flush().map_err(|_| Error::IoWrite)?;
    debug!(
        "index written: {} fields, {} trails/page",
        num_fields - 1,
        trails_per_page
    );
    Ok(())
}

struct FieldTable {
    /// Absolute position of the offset table.
    table: usize,
    width: u32,
    /// Absolute position of the payload.
    payload: usize,
    payload_len: u64,
    num_items: u64,
}

/// An open index bound to one store.
pub struct PageIndex {
    map: Mmap,
    fields: Vec<Option<FieldTable>>,
    trails_per_page: u64,
    num_trails: u64,
}

impl PageIndex {
    /// Conventional index locations: `<store>/index` for a directory
    /// store, `<store>.index` beside a package file.
    pub fn find(store_path: &Path) -> Option<PathBuf> {
        if store_path.is_dir() {
            let p = store_path.join("index");
            if p.is_file() {
                return Some(p);
            }
        }
        let mut name = store_path.as_os_str().to_owned();
        name.push(".index");
        let p = PathBuf::from(name);
        p.is_file().then_some(p)
    }

    /// Open `index_path` and verify it was built from `db`.
    pub fn open(db: &Db, index_path: &Path) -> Result<PageIndex> {
        let file = File::open(index_path).map_err(|_| Error::IoOpen)?;
        let map = unsafe { Mmap::map(&file) }.map_err(|_| Error::IoRead)?;
        let num_fields = db.num_fields() as usize;
        if map.len() < HEADER_FIXED + num_fields * 8 {
            return Err(Error::CorruptSection);
        }
        let word = |p: usize| u64::from_le_bytes(map[p..p + 8].try_into().unwrap());
        if word(0) != INDEX_VERSION {
            return Err(Error::VersionMismatch);
        }
        if word(8) != store_checksum(db) {
            return Err(Error::IndexChecksumMismatch);
        }
        let trails_per_page = word(16);
        if trails_per_page == 0 {
            return Err(Error::CorruptSection);
        }

        let mut fields = Vec::with_capacity(num_fields);
        fields.push(None); // the time field carries no posting lists
        for f in 1..num_fields as Field {
            let off = word(HEADER_FIXED + (f as usize) * 8) as usize;
            let num_items = db.lexicon_size(f)?;
            let table = off.checked_add(4).ok_or(Error::CorruptSection)?;
            let width = u32::from_le_bytes(
                map.get(off..table)
                    .ok_or(Error::CorruptSection)?
                    .try_into()
                    .unwrap(),
            );
            if width != 4 && width != 8 {
                return Err(Error::CorruptSection);
            }
            let table_len = (num_items as usize + 1)
                .checked_mul(width as usize)
                .ok_or(Error::CorruptSection)?;
            let payload = table.checked_add(table_len).ok_or(Error::CorruptSection)?;
            if payload > map.len() {
                return Err(Error::CorruptSection);
            }
            let ft = FieldTable {
                table,
                width,
                payload,
                payload_len: 0,
                num_items,
            };
            let payload_len = entry_offset(&map, &ft, num_items);
            if payload as u64 + payload_len > map.len() as u64 {
                return Err(Error::CorruptSection);
            }
            let ft = FieldTable {
                payload_len,
                ..ft
            };
            // Every entry must hold a self-consistent page list.
            for v in 0..num_items {
                let rel = entry_offset(&map, &ft, v);
                let at = payload as u64 + rel;
                let count = map
                    .get(at as usize..at as usize + 2)
                    .map(|s| u16::from_le_bytes(s.try_into().unwrap()))
                    .ok_or(Error::CorruptSection)? as u64;
                if at + 2 + count * 2 > payload as u64 + payload_len {
                    return Err(Error::CorruptSection);
                }
            }
            fields.push(Some(ft));
        }

        Ok(PageIndex {
            map,
            fields,
            trails_per_page,
            num_trails: db.num_trails(),
        })
    }

    /// Ascending 1-based page numbers holding `item`; empty when unknown.
    fn pages_of(&self, item: Item) -> &[u8] {
        let field = item_field(item) as usize;
        let val = item_val(item);
        let Some(Some(ft)) = self.fields.get(field) else {
            return &[];
        };
        if val >= ft.num_items {
            return &[];
        }
        let rel = entry_offset(&self.map, ft, val);
        let at = ft.payload + rel as usize;
        let count = u16::from_le_bytes(self.map[at..at + 2].try_into().unwrap()) as usize;
        &self.map[at + 2..at + 2 + count * 2]
    }

    /// Candidate trail ids for `filter`: every trail in every page that
    /// could match. Negated terms, and terms testing the empty value,
    /// cannot prune pages; a clause containing one passes all pages.
    pub fn match_candidates(&self, filter: &EventFilter) -> Vec<u64> {
        const WORDS: usize = (INDEX_NUM_PAGES as usize).div_ceil(64);
        let mut conjunction = vec![u64::MAX; WORDS];
        for clause in 0..filter.num_clauses() {
            let mut disjunction = vec![0u64; WORDS];
            let mut all_pages = false;
            for term in filter.clause_terms(clause) {
                if term.is_negative || item_val(term.item) == 0 {
                    all_pages = true;
                    break;
                }
                for pair in self.pages_of(term.item).chunks_exact(2) {
                    let page = u16::from_le_bytes(pair.try_into().unwrap());
                    let bit = page as usize - 1;
                    disjunction[bit / 64] |= 1 << (bit % 64);
                }
            }
            if all_pages {
                continue;
            }
            for (c, d) in conjunction.iter_mut().zip(&disjunction) {
                *c &= d;
            }
        }

        let mut candidates = Vec::new();
        for page in 0..INDEX_NUM_PAGES as usize {
            if conjunction[page / 64] & (1 << (page % 64)) != 0 {
                let start = page as u64 * self.trails_per_page;
                if start >= self.num_trails {
                    break;
                }
                let end = (start + self.trails_per_page).min(self.num_trails);
                candidates.extend(start..end);
            }
        }
        candidates
    }
}

/// Payload-relative offset of entry `v` in a field table.
fn entry_offset(map: &[u8], ft: &FieldTable, v: u64) -> u64 {
    let p = ft.table + v as usize * ft.width as usize;
    if ft.width == 4 {
        u32::from_le_bytes(map[p..p + 4].try_into().unwrap()) as u64
    } else {
        u64::from_le_bytes(map[p..p + 8].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::Encoder;
    use crate::uuids::Uuid;

    fn uuid(n: u64) -> Uuid {
        let mut u = [0u8; 16];
        u[..8].copy_from_slice(&n.to_be_bytes());
        u
    }

    /// 300 trails, one event per trail, field values cycling so each value
    /// clusters in a known set of trails.
    fn build_store(path: &Path) {
        let mut enc = Encoder::new(path, &["color", "shape"]).unwrap();
        for t in 0..300u64 {
            let color = format!("color{}", t % 7);
            let shape = format!("shape{}", t % 3);
            enc.add(&uuid(t), t, &[color.as_bytes(), shape.as_bytes()])
                .unwrap();
        }
        enc.finalize().unwrap();
    }

    fn brute_force(db: &Db, filter: &EventFilter) -> Vec<u64> {
        let mut hits = Vec::new();
        let mut c = db.cursor();
        for t in 0..db.num_trails() {
            c.seek(t).unwrap();
            while let Some(ev) = c.next() {
                if filter.match_items(&ev.items) {
                    hits.push(t);
                    break;
                }
            }
        }
        hits
    }

    #[test]
    fn shard_workers_never_exceed_shards() {
        assert!(shard_workers(NUM_SHARDS) >= 1);
        assert!(shard_workers(NUM_SHARDS) <= NUM_SHARDS);
        assert_eq!(shard_workers(1), 1);
        assert_eq!(shard_workers(0), 1);
    }

    #[test]
    fn add_page_packs_four_then_spills() {
        let mut w = 0u64;
        assert!(!add_page(&mut w, 1));
        assert!(!add_page(&mut w, 1));
        assert!(!add_page(&mut w, 2));
        assert!(!add_page(&mut w, 7));
        assert!(!add_page(&mut w, 9));
        assert!(!add_page(&mut w, 9));
        assert!(add_page(&mut w, 10));
        assert_eq!(w, 1 | (2 << 16) | (7 << 32) | (9 << 48));
    }

    #[test]
    fn candidates_are_a_superset() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s");
        build_store(&store);
        let idx_path = dir.path().join("s.index");
        create(&store, &idx_path).unwrap();

        let db = Db::open(&store).unwrap();
        let idx = PageIndex::open(&db, &idx_path).unwrap();

        let mut f = EventFilter::new();
        f.add_term(db.get_item(1, b"color3").unwrap(), false);
        f.new_clause();
        f.add_term(db.get_item(2, b"shape1").unwrap(), false);

        let candidates = idx.match_candidates(&f);
        let truth = brute_force(&db, &f);
        for t in &truth {
            assert!(candidates.contains(t), "trail {t} missing from candidates");
        }
    }

    #[test]
    fn negative_terms_never_prune() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s");
        build_store(&store);
        let idx_path = dir.path().join("idx");
        create(&store, &idx_path).unwrap();
        let db = Db::open(&store).unwrap();
        let idx = PageIndex::open(&db, &idx_path).unwrap();

        let mut f = EventFilter::new();
        f.add_term(db.get_item(1, b"color0").unwrap(), true);
        let candidates = idx.match_candidates(&f);
        assert_eq!(candidates.len() as u64, db.num_trails());
    }

    #[test]
    fn unknown_item_prunes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s");
        build_store(&store);
        let idx_path = dir.path().join("idx");
        create(&store, &idx_path).unwrap();
        let db = Db::open(&store).unwrap();
        let idx = PageIndex::open(&db, &idx_path).unwrap();

        // The overflow sentinel appears in no event.
        let mut f = EventFilter::new();
        f.add_term(db.get_item(1, b"no-such-color").unwrap(), false);
        assert!(idx.match_candidates(&f).is_empty());
    }

    #[test]
    fn checksum_binds_index_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let store_a = dir.path().join("a");
        let store_b = dir.path().join("b");
        build_store(&store_a);
        let mut enc = Encoder::new(&store_b, &["color", "shape"]).unwrap();
        enc.add(&uuid(1), 1, &[b"red", b"dot"]).unwrap();
        enc.finalize().unwrap();

        let idx_path = dir.path().join("a.index");
        create(&store_a, &idx_path).unwrap();
        let db_b = Db::open(&store_b).unwrap();
        assert_eq!(
            PageIndex::open(&db_b, &idx_path).err(),
            Some(Error::IndexChecksumMismatch)
        );
    }

    #[test]
    fn find_locates_conventional_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s");
        build_store(&store);
        assert_eq!(PageIndex::find(&store), None);
        let idx_path = dir.path().join("s.index");
        create(&store, &idx_path).unwrap();
        assert_eq!(PageIndex::find(&store), Some(idx_path.clone()));
        // A directory-internal index wins.
        let inner = store.join("index");
        std::fs::copy(&idx_path, &inner).unwrap();
        assert_eq!(PageIndex::find(&store), Some(inner));
    }

    #[test]
    fn index_build_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("s");
        build_store(&store);
        let p1 = dir.path().join("i1");
        let p2 = dir.path().join("i2");
        create(&store, &p1).unwrap();
        create(&store, &p2).unwrap();
        assert_eq!(std::fs::read(p1).unwrap(), std::fs::read(p2).unwrap());
    }
}
