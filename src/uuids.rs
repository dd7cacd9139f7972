//! UUID to trail-id bijection.
//!
//! During a build, UUIDs map to transient group ids in first-seen order.
//! At finalisation the UUIDs are emitted in ascending byte order; the
//! position of a UUID in the emitted section is its permanent `trail_id`,
//! so trail ids are stable across identical builds. The read side binary
//! searches the sorted section.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Raw 128-bit trail identifier.
pub type Uuid = [u8; 16];

/// Build-side UUID registry.
#[derive(Default)]
pub struct UuidMap {
    map: BTreeMap<Uuid, u64>,
}

impl UuidMap {
    pub fn new() -> Self {
        UuidMap::default()
    }

    /// Group id for `uuid`, allocating the next dense id on first sight.
    pub fn insert_or_get(&mut self, uuid: &Uuid) -> u64 {
        let next = self.map.len() as u64;
        *self.map.entry(*uuid).or_insert(next)
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Emit the sorted `uuids` section and the group-id to trail-id map.
    pub fn finalize(&self) -> (Vec<u8>, Vec<u64>) {
        let mut bytes = Vec::with_capacity(self.map.len() * 16);
        let mut trail_of_group = vec![0u64; self.map.len()];
        for (trail_id, (uuid, &group)) in self.map.iter().enumerate() {
            bytes.extend_from_slice(uuid);
            trail_of_group[group as usize] = trail_id as u64;
        }
        (bytes, trail_of_group)
    }
}

/// Read-side view over the sorted `uuids` section.
#[derive(Clone, Copy)]
pub struct UuidsRef<'a> {
    bytes: &'a [u8],
}

impl<'a> UuidsRef<'a> {
    pub fn parse(bytes: &'a [u8], num_trails: u64) -> Result<Self> {
        if bytes.len() as u64 != num_trails * 16 {
            return Err(Error::CorruptSection);
        }
        Ok(UuidsRef { bytes })
    }

    pub fn num_trails(&self) -> u64 {
        (self.bytes.len() / 16) as u64
    }

    #[inline]
    fn at(&self, trail_id: u64) -> &'a [u8] {
        let p = trail_id as usize * 16;
        &self.bytes[p..p + 16]
    }

    /// The UUID owning `trail_id`.
    pub fn get_uuid(&self, trail_id: u64) -> Result<&'a Uuid> {
        if trail_id >= self.num_trails() {
            return Err(Error::UnknownUuid);
        }
        Ok(self.at(trail_id).try_into().unwrap())
    }

    /// Binary search for `uuid`.
    pub fn get_trail_id(&self, uuid: &Uuid) -> Result<u64> {
        let (mut lo, mut hi) = (0u64, self.num_trails());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.at(mid).cmp(&uuid[..]) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(Error::UnknownUuid)
    }
}

/// Format a UUID as 32 lowercase hex digits.
pub fn uuid_hex(uuid: &Uuid) -> String {
    let mut s = String::with_capacity(32);
    for b in uuid {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Parse 32 hex digits into a UUID.
pub fn uuid_from_hex(hex: &str) -> Result<Uuid> {
    let bytes = hex.as_bytes();
    if bytes.len() != 32 {
        return Err(Error::UnknownUuid);
    }
    let nib = |c: u8| -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'a'..=b'f' => Ok(c - b'a' + 10),
            b'A'..=b'F' => Ok(c - b'A' + 10),
            _ => Err(Error::UnknownUuid),
        }
    };
    let mut out = [0u8; 16];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        out[i] = (nib(pair[0])? << 4) | nib(pair[1])?;
    }
    Ok(out)
}
