//! End-to-end: build stores, reopen them, and read every event back.
//!
//! Covers the tiny three-trail scenario, byte-exact round-tripping of
//! arbitrary ingests, read compatibility of the directory and package
//! layouts, and bit-identical output for identical builds.

use std::collections::BTreeMap;

use trailpack::{item_field, item_val, uuid_hex, Db, Encoder, EncoderOptions, Uuid};

fn uuid(n: u8) -> Uuid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

/// Small deterministic PRNG so failures reproduce.
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

// ─────────────────────────────────────────────────────────────────────────────
// Tiny store: three trails, two fields, three events each
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn tiny_store() {
    const EVENTS: [&str; 3] = ["open", "save", "close"];
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tiny");
    let mut enc = Encoder::new(&path, &["username", "action"]).unwrap();
    for i in 0..3u8 {
        let user = format!("user{i}");
        for (j, action) in EVENTS.iter().enumerate() {
            enc.add(
                &uuid(i),
                (10 * i as u64) + j as u64,
                &[user.as_bytes(), action.as_bytes()],
            )
            .unwrap();
        }
    }
    enc.finalize().unwrap();

    let db = Db::open(&path).unwrap();
    assert_eq!(db.num_trails(), 3);
    assert_eq!(db.num_events(), 9);
    assert_eq!(db.num_fields(), 3);

    // Each trail yields its three events in ingest order.
    let mut cursor = db.cursor();
    for i in 0..3u8 {
        let trail = db.get_trail_id(&uuid(i)).unwrap();
        cursor.seek(trail).unwrap();
        for (j, action) in EVENTS.iter().enumerate() {
            let ev = cursor.next().expect("missing event");
            assert_eq!(ev.timestamp, (10 * i as u64) + j as u64);
            let action_item = ev
                .items
                .iter()
                .find(|&&it| item_field(it) == 2)
                .expect("action item");
            assert_eq!(
                db.value(2, item_val(*action_item)).unwrap(),
                action.as_bytes()
            );
        }
        assert!(cursor.next().is_none());
    }

    // The username lexicon holds exactly the empty value plus user0..user2.
    let mut values: Vec<Vec<u8>> = (0..db.lexicon_size(1).unwrap())
        .map(|v| db.value(1, v).unwrap().to_vec())
        .collect();
    values.sort();
    let expect: Vec<Vec<u8>> = vec![
        b"".to_vec(),
        b"user0".to_vec(),
        b"user1".to_vec(),
        b"user2".to_vec(),
    ];
    assert_eq!(values, expect);
}

// ─────────────────────────────────────────────────────────────────────────────
// Round trip: what you write is what you get back
// ─────────────────────────────────────────────────────────────────────────────

type Ingest = Vec<(Uuid, u64, Vec<Vec<u8>>)>;

fn random_ingest(seed: u64, num_uuids: u8, num_events: usize) -> Ingest {
    let mut rng = XorShift(seed);
    let pools: [Vec<String>; 3] = [
        (0..5).map(|i| format!("alpha{i}")).collect(),
        (0..17).map(|i| format!("beta-value-{i}")).collect(),
        (0..3).map(|i| format!("g{i}")).collect(),
    ];
    (0..num_events)
        .map(|_| {
            let u = uuid((rng.next() % num_uuids as u64) as u8);
            let ts = rng.next() % 1000;
            let values: Vec<Vec<u8>> = pools
                .iter()
                .map(|pool| {
                    // Roughly one in four values is empty.
                    if rng.next() % 4 == 0 {
                        Vec::new()
                    } else {
                        pool[(rng.next() % pool.len() as u64) as usize]
                            .clone()
                            .into_bytes()
                    }
                })
                .collect();
            (u, ts, values)
        })
        .collect()
}

fn build_from(path: &std::path::Path, ingest: &Ingest, package: bool) {
    let mut enc = Encoder::with_options(
        path,
        &["one", "two", "three"],
        EncoderOptions { package },
    )
    .unwrap();
    for (u, ts, values) in ingest {
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        enc.add(u, *ts, &refs).unwrap();
    }
    enc.finalize().unwrap();
}

/// Events per trail, sorted by timestamp with ingest order preserved on
/// ties, as `(timestamp, [(field, value)])` with empties dropped.
fn expected_trails(ingest: &Ingest) -> BTreeMap<Uuid, Vec<(u64, Vec<(u32, Vec<u8>)>)>> {
    let mut trails: BTreeMap<Uuid, Vec<(u64, Vec<(u32, Vec<u8>)>)>> = BTreeMap::new();
    for (u, ts, values) in ingest {
        let items: Vec<(u32, Vec<u8>)> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_empty())
            .map(|(i, v)| (i as u32 + 1, v.clone()))
            .collect();
        trails.entry(*u).or_default().push((*ts, items));
    }
    for events in trails.values_mut() {
        events.sort_by_key(|(ts, _)| *ts);
    }
    trails
}

fn decoded_trails(db: &Db) -> BTreeMap<Uuid, Vec<(u64, Vec<(u32, Vec<u8>)>)>> {
    let mut trails = BTreeMap::new();
    let mut cursor = db.cursor();
    for t in 0..db.num_trails() {
        let u = *db.get_uuid(t).unwrap();
        cursor.seek(t).unwrap();
        let mut events = Vec::new();
        while let Some(ev) = cursor.next() {
            let items: Vec<(u32, Vec<u8>)> = ev
                .items
                .iter()
                .map(|&it| {
                    (
                        item_field(it),
                        db.value(item_field(it), item_val(it)).unwrap().to_vec(),
                    )
                })
                .collect();
            events.push((ev.timestamp, items));
        }
        trails.insert(u, events);
    }
    trails
}

#[test]
fn what_you_write_you_get_back() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = random_ingest(0x5EED, 40, 2500);
    let path = dir.path().join("rt");
    build_from(&path, &ingest, false);
    let db = Db::open(&path).unwrap();
    assert_eq!(db.num_events(), 2500);
    assert_eq!(decoded_trails(&db), expected_trails(&ingest));
}

#[test]
fn timestamps_are_monotone_per_trail() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = random_ingest(0xBEEF, 10, 800);
    let path = dir.path().join("mono");
    build_from(&path, &ingest, false);
    let db = Db::open(&path).unwrap();
    let mut cursor = db.cursor();
    for t in 0..db.num_trails() {
        cursor.seek(t).unwrap();
        let mut prev = 0u64;
        while let Some(ev) = cursor.next() {
            assert!(ev.timestamp >= prev);
            prev = ev.timestamp;
        }
    }
    assert_eq!(db.min_timestamp(), ingest.iter().map(|e| e.1).min().unwrap());
    assert_eq!(db.max_timestamp(), ingest.iter().map(|e| e.1).max().unwrap());
}

// ─────────────────────────────────────────────────────────────────────────────
// Layouts and stability
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn package_and_directory_read_identically() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = random_ingest(7, 12, 600);
    let as_dir = dir.path().join("as_dir");
    let as_pkg = dir.path().join("as_pkg");
    build_from(&as_dir, &ingest, false);
    build_from(&as_pkg, &ingest, true);

    let db_dir = Db::open(&as_dir).unwrap();
    let db_pkg = Db::open(&as_pkg).unwrap();
    assert_eq!(db_dir.num_trails(), db_pkg.num_trails());
    assert_eq!(decoded_trails(&db_dir), decoded_trails(&db_pkg));
}

#[test]
fn identical_builds_are_bit_identical() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = random_ingest(99, 25, 1500);
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    build_from(&a, &ingest, false);
    build_from(&b, &ingest, false);
    let mut names: Vec<String> = std::fs::read_dir(&a)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert!(!names.is_empty());
    for name in names {
        let bytes_a = std::fs::read(a.join(&name)).unwrap();
        let bytes_b = std::fs::read(b.join(&name)).unwrap();
        assert_eq!(bytes_a, bytes_b, "section {name} differs between builds");
    }

    // Package builds are byte-identical as whole files.
    let pa = dir.path().join("pa");
    let pb = dir.path().join("pb");
    build_from(&pa, &ingest, true);
    build_from(&pb, &ingest, true);
    assert_eq!(std::fs::read(pa).unwrap(), std::fs::read(pb).unwrap());
}

#[test]
fn uuid_bijection_over_many_trails() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = random_ingest(3, 200, 1000);
    let path = dir.path().join("bij");
    build_from(&path, &ingest, false);
    let db = Db::open(&path).unwrap();
    for t in 0..db.num_trails() {
        let u = *db.get_uuid(t).unwrap();
        assert_eq!(db.get_trail_id(&u).unwrap(), t, "uuid {}", uuid_hex(&u));
    }
    // Trail ids follow lexicographic UUID order.
    for t in 1..db.num_trails() {
        assert!(db.get_uuid(t - 1).unwrap() < db.get_uuid(t).unwrap());
    }
}
