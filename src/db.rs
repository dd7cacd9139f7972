//! Read-only store handle.
//!
//! [`Db::open`] accepts either layout: a directory of section files or a
//! single package file. Sections are memory-mapped; every structural
//! invariant a cursor later relies on is checked here, so decoding is
//! infallible. A `Db` is immutable after open and `Sync`: hand out as many
//! cursors as you like, one owner per cursor.

use std::fs::File;
use std::path::Path;

use log::debug;
use memmap2::Mmap;

use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::huffman::{Codebook, Decoder};
use crate::item::{make_item, overflow_item, Field, Item, Val, MAX_NARROW_FIELD};
use crate::lexicon::LexiconRef;
use crate::sections::{
    lexicon_section, read_package_toc, SECTION_CODEBOOK, SECTION_FIELDS, SECTION_INFO,
    SECTION_TOC, SECTION_TRAILS, SECTION_UUIDS, VERSION,
};
use crate::uuids::{Uuid, UuidsRef};
use crate::MAX_NUM_FIELDS;

enum Backing {
    Package(Mmap),
    /// One optional map per section; zero-length files stay unmapped.
    Dir(Vec<Option<Mmap>>),
}

#[derive(Clone, Copy, Default)]
struct SectionRef {
    map: usize,
    off: usize,
    len: usize,
}

/// An open store.
pub struct Db {
    backing: Backing,
    lexicons: Vec<SectionRef>,
    uuids: SectionRef,
    toc: SectionRef,
    trails: SectionRef,

    version: u64,
    num_trails: u64,
    num_events: u64,
    num_fields: u64,
    min_timestamp: u64,
    max_timestamp: u64,
    field_overflow: Vec<bool>,
    field_names: Vec<String>,
    toc_width: u32,
    decoder: Decoder,
}

/// Sections resolved during open, before the `Db` exists.
struct RawStore {
    backing: Backing,
    entries: Vec<(String, SectionRef)>,
}

impl RawStore {
    fn open_package(path: &Path) -> Result<RawStore> {
        let file = File::open(path).map_err(|_| Error::IoOpen)?;
        let map = unsafe { Mmap::map(&file) }.map_err(|_| Error::IoRead)?;
        let entries = read_package_toc(&map)?
            .into_iter()
            .map(|e| {
                (
                    e.name,
                    SectionRef {
                        map: 0,
                        off: e.offset as usize,
                        len: e.length as usize,
                    },
                )
            })
            .collect();
        Ok(RawStore {
            backing: Backing::Package(map),
            entries,
        })
    }

    fn open_dir(path: &Path) -> Result<RawStore> {
        let mut raw = RawStore {
            backing: Backing::Dir(Vec::new()),
            entries: Vec::new(),
        };
        for name in [
            SECTION_INFO,
            SECTION_FIELDS,
            SECTION_UUIDS,
            SECTION_CODEBOOK,
            SECTION_TOC,
            SECTION_TRAILS,
        ] {
            raw.map_dir_file(path, name)?;
        }
        Ok(raw)
    }

    fn map_dir_file(&mut self, dir: &Path, name: &str) -> Result<()> {
        let maps = match &mut self.backing {
            Backing::Dir(maps) => maps,
            Backing::Package(_) => unreachable!("package stores map everything up front"),
        };
        let file = File::open(dir.join(name)).map_err(|_| Error::IoOpen)?;
        let len = file.metadata().map_err(|_| Error::IoRead)?.len() as usize;
        let map = if len == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&file) }.map_err(|_| Error::IoRead)?)
        };
        maps.push(map);
        self.entries.push((
            name.to_owned(),
            SectionRef {
                map: maps.len() - 1,
                off: 0,
                len,
            },
        ));
        Ok(())
    }

    fn section(&self, name: &str) -> Result<SectionRef> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, s)| s)
            .ok_or(Error::CorruptSection)
    }

    fn bytes(&self, s: SectionRef) -> &[u8] {
        section_bytes(&self.backing, s)
    }
}

fn section_bytes(backing: &Backing, s: SectionRef) -> &[u8] {
    match backing {
        Backing::Package(map) => &map[s.off..s.off + s.len],
        Backing::Dir(maps) => maps[s.map].as_deref().unwrap_or(&[]),
    }
}

impl Db {
    /// Open a store at `path`, directory or package form.
    pub fn open(path: impl AsRef<Path>) -> Result<Db> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|_| Error::IoOpen)?;
        let mut raw = if meta.is_dir() {
            RawStore::open_dir(path)?
        } else if meta.is_file() {
            RawStore::open_package(path)?
        } else {
            return Err(Error::InvalidPath);
        };

        // info
        let info = raw.bytes(raw.section(SECTION_INFO)?);
        if info.len() < 56 {
            return Err(Error::CorruptSection);
        }
        let word = |i: usize| u64::from_le_bytes(info[i * 8..i * 8 + 8].try_into().unwrap());
        let version = word(0);
        if version != VERSION {
            return Err(Error::VersionMismatch);
        }
        let num_trails = word(1);
        let num_events = word(2);
        let num_fields = word(3);
        let min_timestamp = word(4);
        let max_timestamp = word(5);
        if num_fields == 0 || num_fields > MAX_NUM_FIELDS as u64 + 1 {
            return Err(Error::CorruptSection);
        }
        let bitmap_len = (num_fields as usize).div_ceil(8);
        if info.len() != 56 + bitmap_len {
            return Err(Error::CorruptSection);
        }
        let field_overflow: Vec<bool> = (0..num_fields as usize)
            .map(|f| info[56 + f / 8] & (1 << (f % 8)) != 0)
            .collect();

        // fields
        let field_names = parse_field_names(raw.bytes(raw.section(SECTION_FIELDS)?), num_fields)?;

        // lexicons, mapped on demand for directory stores
        let mut lexicons = Vec::with_capacity(num_fields as usize - 1);
        for f in 1..num_fields as u32 {
            let name = lexicon_section(f);
            if raw.section(&name).is_err() {
                if matches!(raw.backing, Backing::Package(_)) {
                    return Err(Error::CorruptSection);
                }
                raw.map_dir_file(path, &name)?;
            }
            let s = raw.section(&name)?;
            LexiconRef::parse(raw.bytes(s))?;
            lexicons.push(s);
        }

        // uuids
        let uuids = raw.section(SECTION_UUIDS)?;
        UuidsRef::parse(raw.bytes(uuids), num_trails)?;

        // codebook
        let codebook = Codebook::parse(raw.bytes(raw.section(SECTION_CODEBOOK)?))?;
        let decoder = codebook.decoder()?;

        // toc
        let toc = raw.section(SECTION_TOC)?;
        let toc_bytes = raw.bytes(toc);
        if toc_bytes.len() < 4 {
            return Err(Error::CorruptSection);
        }
        let toc_width = u32::from_le_bytes(toc_bytes[..4].try_into().unwrap());
        if toc_width != 4 && toc_width != 8 {
            return Err(Error::CorruptSection);
        }
        let want = (num_trails as usize)
            .checked_add(1)
            .and_then(|n| n.checked_mul(toc_width as usize))
            .and_then(|n| n.checked_add(4))
            .ok_or(Error::CorruptSection)?;
        if toc_bytes.len() != want {
            return Err(Error::CorruptSection);
        }

        // trails, with the bit-reader tail guard
        let trails = raw.section(SECTION_TRAILS)?;
        let trails_bytes = raw.bytes(trails);
        let read_off = |i: u64| -> u64 {
            let p = 4 + i as usize * toc_width as usize;
            if toc_width == 4 {
                u32::from_le_bytes(toc_bytes[p..p + 4].try_into().unwrap()) as u64
            } else {
                u64::from_le_bytes(toc_bytes[p..p + 8].try_into().unwrap())
            }
        };
        let mut prev = 0u64;
        for i in 0..=num_trails {
            let o = read_off(i);
            if o < prev {
                return Err(Error::CorruptSection);
            }
            prev = o;
        }
        let total_bits = read_off(num_trails);
        if (trails_bytes.len() as u64) < total_bits.div_ceil(8) + 7 {
            return Err(Error::CorruptSection);
        }

        debug!(
            "opened store: {} trails, {} events, {} fields",
            num_trails, num_fields, num_events
        );

        Ok(Db {
            lexicons,
            uuids,
            toc,
            trails,
            backing: raw.backing,
            version,
            num_trails,
            num_events,
            num_fields,
            min_timestamp,
            max_timestamp,
            field_overflow,
            field_names,
            toc_width,
            decoder,
        })
    }

    #[inline]
    fn bytes(&self, s: SectionRef) -> &[u8] {
        section_bytes(&self.backing, s)
    }

    /// Store format version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of trails.
    pub fn num_trails(&self) -> u64 {
        self.num_trails
    }

    /// Number of events across all trails.
    pub fn num_events(&self) -> u64 {
        self.num_events
    }

    /// Number of fields, counting the implicit `time` field 0.
    pub fn num_fields(&self) -> u64 {
        self.num_fields
    }

    /// Smallest ingested timestamp (0 for an empty store).
    pub fn min_timestamp(&self) -> u64 {
        self.min_timestamp
    }

    /// Largest ingested timestamp.
    pub fn max_timestamp(&self) -> u64 {
        self.max_timestamp
    }

    /// Name of field `f`; field 0 is `time`.
    pub fn field_name(&self, f: Field) -> Result<&str> {
        if f == 0 {
            Ok("time")
        } else {
            self.field_names
                .get(f as usize - 1)
                .map(String::as_str)
                .ok_or(Error::UnknownField)
        }
    }

    /// Field number for `name`.
    pub fn get_field(&self, name: &str) -> Result<Field> {
        if name == "time" {
            return Ok(0);
        }
        self.field_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as Field + 1)
            .ok_or(Error::UnknownField)
    }

    fn lexicon(&self, f: Field) -> Result<LexiconRef<'_>> {
        if f == 0 || f as u64 >= self.num_fields {
            return Err(Error::UnknownField);
        }
        Ok(LexiconRef::from_validated(
            self.bytes(self.lexicons[f as usize - 1]),
        ))
    }

    /// Number of addressable values of field `f`, counting the empty value.
    pub fn lexicon_size(&self, f: Field) -> Result<u64> {
        Ok(self.lexicon(f)?.size())
    }

    /// Bytes of value `v` of field `f`. The empty value and the overflow
    /// sentinel both read as the empty byte string.
    pub fn value(&self, f: Field, v: Val) -> Result<&[u8]> {
        let lex = self.lexicon(f)?;
        match lex.value(v) {
            Some(bytes) => Ok(bytes),
            None if v == crate::item::OVERFLOW_VAL => Ok(b""),
            None => Err(Error::CorruptSection),
        }
    }

    /// Item for `bytes` in field `f`: the val-0 item for the empty string,
    /// the per-field overflow sentinel for bytes this store never interned.
    pub fn get_item(&self, f: Field, bytes: &[u8]) -> Result<Item> {
        let lex = self.lexicon(f)?;
        Ok(match lex.find(bytes) {
            Some(v) => make_item(f, v),
            None if f <= MAX_NARROW_FIELD => overflow_item(f),
            None => make_item(f, crate::item::OVERFLOW_VAL),
        })
    }

    /// Whether field `f` ever crossed its narrow value-domain bound.
    pub fn field_has_overflow_vals(&self, f: Field) -> Result<bool> {
        self.field_overflow
            .get(f as usize)
            .copied()
            .ok_or(Error::UnknownField)
    }

    /// Trail id owning `uuid`.
    pub fn get_trail_id(&self, uuid: &Uuid) -> Result<u64> {
        UuidsRef::parse(self.bytes(self.uuids), self.num_trails)?.get_trail_id(uuid)
    }

    /// UUID of `trail_id`.
    pub fn get_uuid(&self, trail_id: u64) -> Result<&Uuid> {
        UuidsRef::parse(self.bytes(self.uuids), self.num_trails)?.get_uuid(trail_id)
    }

    /// A fresh cursor over this store.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    #[inline]
    pub(crate) fn trails_bytes(&self) -> &[u8] {
        self.bytes(self.trails)
    }

    #[inline]
    pub(crate) fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// Bit range of one trail in the trail stream.
    pub(crate) fn trail_bounds(&self, trail_id: u64) -> Result<(u64, u64)> {
        if trail_id >= self.num_trails {
            return Err(Error::UnknownUuid);
        }
        let toc = self.bytes(self.toc);
        let at = |i: u64| -> u64 {
            let p = 4 + i as usize * self.toc_width as usize;
            if self.toc_width == 4 {
                u32::from_le_bytes(toc[p..p + 4].try_into().unwrap()) as u64
            } else {
                u64::from_le_bytes(toc[p..p + 8].try_into().unwrap())
            }
        };
        Ok((at(trail_id), at(trail_id + 1)))
    }
}

fn parse_field_names(bytes: &[u8], num_fields: u64) -> Result<Vec<String>> {
    let mut names = Vec::with_capacity(num_fields as usize - 1);
    let mut p = 0usize;
    while p < bytes.len() {
        let len = bytes
            .get(p..p + 4)
            .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
            .ok_or(Error::CorruptSection)? as usize;
        p += 4;
        let name = bytes.get(p..p + len).ok_or(Error::CorruptSection)?;
        p += len;
        names.push(
            std::str::from_utf8(name)
                .map_err(|_| Error::CorruptSection)?
                .to_owned(),
        );
    }
    if names.len() as u64 != num_fields - 1 {
        return Err(Error::CorruptSection);
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{Encoder, EncoderOptions};

    fn uuid(n: u8) -> Uuid {
        let mut u = [0u8; 16];
        u[0] = n;
        u
    }

    fn small_store(path: &Path, package: bool) {
        let mut enc = Encoder::with_options(
            path,
            &["user", "action"],
            EncoderOptions { package },
        )
        .unwrap();
        enc.add(&uuid(2), 100, &[b"bob", b"open"]).unwrap();
        enc.add(&uuid(1), 50, &[b"alice", b"open"]).unwrap();
        enc.add(&uuid(1), 60, &[b"alice", b"close"]).unwrap();
        enc.finalize().unwrap();
    }

    #[test]
    fn open_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        for (name, package) in [("as_dir", false), ("as_pkg", true)] {
            let path = dir.path().join(name);
            small_store(&path, package);
            let db = Db::open(&path).unwrap();
            assert_eq!(db.num_trails(), 2);
            assert_eq!(db.num_events(), 3);
            assert_eq!(db.num_fields(), 3);
            assert_eq!(db.min_timestamp(), 50);
            assert_eq!(db.max_timestamp(), 100);
        }
    }

    #[test]
    fn field_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        small_store(&path, false);
        let db = Db::open(&path).unwrap();
        assert_eq!(db.get_field("time").unwrap(), 0);
        assert_eq!(db.get_field("user").unwrap(), 1);
        assert_eq!(db.get_field("action").unwrap(), 2);
        assert_eq!(db.get_field("nope"), Err(Error::UnknownField));
        assert_eq!(db.field_name(0).unwrap(), "time");
        assert_eq!(db.field_name(2).unwrap(), "action");
        assert_eq!(db.field_name(3), Err(Error::UnknownField));
    }

    #[test]
    fn value_and_item_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        small_store(&path, false);
        let db = Db::open(&path).unwrap();
        // Lexicon closure: get_item(value(v)) round-trips.
        for f in 1..db.num_fields() as Field {
            for v in 0..db.lexicon_size(f).unwrap() {
                let bytes = db.value(f, v).unwrap().to_vec();
                let item = db.get_item(f, &bytes).unwrap();
                if v > 0 {
                    assert_eq!(crate::item::item_field(item), f);
                    assert_eq!(crate::item::item_val(item), v);
                }
            }
        }
        // Unknown bytes produce the overflow sentinel.
        let unknown = db.get_item(1, b"nobody").unwrap();
        assert!(crate::item::item_is_overflow(unknown));
        // Empty bytes produce the val-0 item.
        assert_eq!(db.get_item(1, b"").unwrap(), make_item(1, 0));
    }

    #[test]
    fn uuid_bijection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s");
        small_store(&path, false);
        let db = Db::open(&path).unwrap();
        for t in 0..db.num_trails() {
            let u = *db.get_uuid(t).unwrap();
            assert_eq!(db.get_trail_id(&u).unwrap(), t);
        }
        assert_eq!(db.get_trail_id(&uuid(99)), Err(Error::UnknownUuid));
    }

    #[test]
    fn open_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            Db::open(dir.path().join("missing")).err(),
            Some(Error::IoOpen)
        );

        // Corrupt the version word of a directory store.
        let path = dir.path().join("s");
        small_store(&path, false);
        let info_path = path.join("info");
        let mut info = std::fs::read(&info_path).unwrap();
        info[0] ^= 0xFF;
        std::fs::write(&info_path, &info).unwrap();
        assert_eq!(Db::open(&path).err(), Some(Error::VersionMismatch));

        // Truncate the trails section below the tail guard.
        let path2 = dir.path().join("s2");
        small_store(&path2, false);
        let trails_path = path2.join("trails");
        let trails = std::fs::read(&trails_path).unwrap();
        std::fs::write(&trails_path, &trails[..trails.len() - 7]).unwrap();
        assert_eq!(Db::open(&path2).err(), Some(Error::CorruptSection));
    }
}
