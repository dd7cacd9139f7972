//! End-to-end: page index over a store large enough to span many pages.
//!
//! With more trails than pages, trails share pages and the index gets to
//! prove both of its properties: candidates are a superset of the true
//! match set, and selective filters shortlist far less than a full scan.

use std::path::Path;

use trailpack::index;
use trailpack::{Db, Encoder, EventFilter, PageIndex, Uuid};

/// More trails than index pages, so trails_per_page > 1.
const NUM_TRAILS: u64 = 70_000;
const TAGS: u64 = 977;
const GROUPS: u64 = 13;

fn uuid(n: u64) -> Uuid {
    let mut u = [0u8; 16];
    u[..8].copy_from_slice(&n.to_be_bytes());
    u
}

fn build_large(path: &Path) {
    let mut enc = Encoder::new(path, &["tag", "grp"]).unwrap();
    for t in 0..NUM_TRAILS {
        let tag = format!("tag{}", t % TAGS);
        let grp = format!("g{}", t % GROUPS);
        enc.add(&uuid(t), t, &[tag.as_bytes(), grp.as_bytes()])
            .unwrap();
    }
    enc.finalize().unwrap();
}

fn brute_force_trails(db: &Db, filter: &EventFilter) -> Vec<u64> {
    let mut cursor = db.cursor();
    cursor.set_filter(Some(filter.clone()));
    let mut hits = Vec::new();
    for t in 0..db.num_trails() {
        cursor.seek(t).unwrap();
        if cursor.peek() {
            hits.push(t);
        }
    }
    hits
}

struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn index_shortlists_and_never_drops_matches() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("large");
    build_large(&store);
    let index_path = dir.path().join("large.index");
    index::create(&store, &index_path).unwrap();

    let db = Db::open(&store).unwrap();
    assert_eq!(db.num_trails(), NUM_TRAILS);
    let idx = PageIndex::open(&db, &index_path).unwrap();
    let mut rng = XorShift(0x1DE7);

    for round in 0..8 {
        // Three positive clauses: tag AND grp AND (tag OR tag). Each tag
        // clause alone matches well under 10% of events.
        let mut filter = EventFilter::new();
        let t1 = format!("tag{}", rng.next() % TAGS);
        filter.add_term(db.get_item(1, t1.as_bytes()).unwrap(), false);
        filter.new_clause();
        let g = format!("g{}", rng.next() % GROUPS);
        filter.add_term(db.get_item(2, g.as_bytes()).unwrap(), false);
        filter.new_clause();
        let t2 = format!("tag{}", rng.next() % TAGS);
        let t3 = format!("tag{}", rng.next() % TAGS);
        filter.add_term(db.get_item(1, t2.as_bytes()).unwrap(), false);
        filter.add_term(db.get_item(1, t3.as_bytes()).unwrap(), false);

        let candidates = idx.match_candidates(&filter);
        let truth = brute_force_trails(&db, &filter);

        // Superset: every true match is shortlisted.
        let candidate_set: std::collections::HashSet<u64> =
            candidates.iter().copied().collect();
        for t in &truth {
            assert!(candidate_set.contains(t), "round {round}: trail {t} dropped");
        }

        // Selectivity: a filter this narrow must prune most of the corpus.
        assert!(
            (candidates.len() as f64) < 0.5 * NUM_TRAILS as f64,
            "round {round}: {} candidates of {NUM_TRAILS}",
            candidates.len()
        );
    }
}

#[test]
fn single_term_candidates_align_with_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("large");
    build_large(&store);
    let index_path = dir.path().join("idx");
    index::create(&store, &index_path).unwrap();

    let db = Db::open(&store).unwrap();
    let idx = PageIndex::open(&db, &index_path).unwrap();

    let mut filter = EventFilter::new();
    filter.add_term(db.get_item(1, b"tag17").unwrap(), false);
    let candidates = idx.match_candidates(&filter);
    let truth = brute_force_trails(&db, &filter);

    // tag17 hits ~NUM_TRAILS/TAGS trails; each drags in at most one page
    // (trails_per_page trails) of neighbours.
    let trails_per_page = 1 + NUM_TRAILS / index::INDEX_NUM_PAGES;
    assert!(!truth.is_empty());
    assert!(candidates.len() as u64 <= truth.len() as u64 * trails_per_page);
    for t in truth {
        assert!(candidates.contains(&t));
    }
}
