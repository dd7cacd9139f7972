//! End-to-end: appending existing stores into a new build.
//!
//! `Encoder::append` replays a reader through the normal ingest path,
//! remapping items through the new build's lexicons. Interleaved adds and
//! appends must produce one correctly ordered trail per UUID, and merging
//! must be associative up to trail-id assignment.

use std::collections::BTreeMap;

use trailpack::{item_field, item_val, Db, Encoder, Uuid};

fn uuid(n: u8) -> Uuid {
    let mut u = [0u8; 16];
    u[0] = n;
    u
}

fn field1_values(db: &Db, trail: u64) -> (Vec<u64>, Vec<String>) {
    let mut cursor = db.cursor();
    cursor.seek(trail).unwrap();
    let mut stamps = Vec::new();
    let mut values = Vec::new();
    while let Some(ev) = cursor.next() {
        stamps.push(ev.timestamp);
        for &it in ev.items.iter() {
            if item_field(it) == 1 {
                values.push(
                    String::from_utf8(db.value(1, item_val(it)).unwrap().to_vec()).unwrap(),
                );
            }
        }
    }
    (stamps, values)
}

#[test]
fn append_interleaves_with_adds() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a");
    let path_b = dir.path().join("b");

    let mut a = Encoder::new(&path_a, &["letter", "digit"]).unwrap();
    a.add(&uuid(0), 5, &[b"a", b"1"]).unwrap();
    a.add(&uuid(0), 20, &[b"c", b"2"]).unwrap();
    a.add(&uuid(0), 40, &[b"e", b"3"]).unwrap();
    a.finalize().unwrap();

    let db_a = Db::open(&path_a).unwrap();
    let mut b = Encoder::new(&path_b, &["letter", "digit"]).unwrap();
    b.add(&uuid(0), 10, &[b"b", b"2"]).unwrap();
    b.add(&uuid(0), 30, &[b"d", b"2"]).unwrap();
    b.append(&db_a).unwrap();
    b.add(&uuid(1), 100, &[b"a", b"2"]).unwrap();
    b.finalize().unwrap();

    let db_b = Db::open(&path_b).unwrap();
    assert_eq!(db_b.num_trails(), 2);

    let t0 = db_b.get_trail_id(&uuid(0)).unwrap();
    let (stamps, values) = field1_values(&db_b, t0);
    assert_eq!(stamps, vec![5, 10, 20, 30, 40]);
    assert_eq!(values, vec!["a", "b", "c", "d", "e"]);

    let t1 = db_b.get_trail_id(&uuid(1)).unwrap();
    let (stamps, values) = field1_values(&db_b, t1);
    assert_eq!(stamps, vec![100]);
    assert_eq!(values, vec!["a"]);
}

#[test]
fn append_preserves_order_of_equal_timestamps() {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a");
    let path_b = dir.path().join("b");

    // Three events at the same timestamp; ingest order must survive the
    // append because the per-trail sort is stable.
    let mut a = Encoder::new(&path_a, &["seq"]).unwrap();
    for v in [&b"first"[..], b"second", b"third"] {
        a.add(&uuid(7), 50, &[v]).unwrap();
    }
    a.finalize().unwrap();

    let db_a = Db::open(&path_a).unwrap();
    let mut b = Encoder::new(&path_b, &["seq"]).unwrap();
    b.append(&db_a).unwrap();
    b.finalize().unwrap();

    let db_b = Db::open(&path_b).unwrap();
    let (stamps, values) = field1_values(&db_b, 0);
    assert_eq!(stamps, vec![50, 50, 50]);
    assert_eq!(values, vec!["first", "second", "third"]);
}

fn all_trails(db: &Db) -> BTreeMap<Uuid, Vec<(u64, Vec<(u32, Vec<u8>)>)>> {
    let mut out = BTreeMap::new();
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
        out.insert(u, events);
    }
    out
}

#[test]
fn merge_is_idempotent_across_groupings() {
    let dir = tempfile::tempdir().unwrap();
    let fields: [&str; 2] = ["k", "v"];
    let inputs: [(u8, &[(u64, &str, &str)]); 3] = [
        (1, &[(10, "x", "one"), (30, "y", "two")]),
        (2, &[(5, "x", "three"), (10, "z", "")]),
        (1, &[(20, "y", "four")]),
    ];

    let mut paths = Vec::new();
    for (i, (uid, events)) in inputs.iter().enumerate() {
        let path = dir.path().join(format!("in{i}"));
        let mut enc = Encoder::new(&path, &fields).unwrap();
        for (ts, k, v) in events.iter() {
            enc.add(&uuid(*uid), *ts, &[k.as_bytes(), v.as_bytes()])
                .unwrap();
        }
        enc.finalize().unwrap();
        paths.push(path);
    }

    // ((in0 + in1) + in2)
    let ab = dir.path().join("ab");
    let mut enc = Encoder::new(&ab, &fields).unwrap();
    enc.append(&Db::open(&paths[0]).unwrap()).unwrap();
    enc.append(&Db::open(&paths[1]).unwrap()).unwrap();
    enc.finalize().unwrap();
    let abc = dir.path().join("abc");
    let mut enc = Encoder::new(&abc, &fields).unwrap();
    enc.append(&Db::open(&ab).unwrap()).unwrap();
    enc.append(&Db::open(&paths[2]).unwrap()).unwrap();
    enc.finalize().unwrap();

    // (in0 + in1 + in2) in one pass
    let flat = dir.path().join("flat");
    let mut enc = Encoder::new(&flat, &fields).unwrap();
    for p in &paths {
        enc.append(&Db::open(p).unwrap()).unwrap();
    }
    enc.finalize().unwrap();

    assert_eq!(
        all_trails(&Db::open(&abc).unwrap()),
        all_trails(&Db::open(&flat).unwrap())
    );
}

#[test]
fn append_rejects_unknown_fields() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let mut enc = Encoder::new(&src, &["present", "missing"]).unwrap();
    enc.add(&uuid(1), 1, &[b"v", b"w"]).unwrap();
    enc.finalize().unwrap();

    let db = Db::open(&src).unwrap();
    let out = dir.path().join("out");
    let mut enc = Encoder::new(&out, &["present"]).unwrap();
    assert_eq!(enc.append(&db).err(), Some(trailpack::Error::UnknownField));
}
