//! Per-field value dictionaries.
//!
//! During a build every user field owns a [`LexiconBuilder`] wrapping one
//! string map; value ids are handed out in first-seen order. Finalisation
//! freezes the dictionary into its on-disk shape:
//!
//! ```text
//! count:u32  offsets:u32[count + 1]  payload bytes
//! ```
//!
//! Offsets are cumulative byte positions into the payload, `offsets[0] = 0`.
//! Value id 0 is the empty value and is not stored; value id `v >= 1` is
//! `payload[offsets[v-1]..offsets[v]]`. [`LexiconRef`] is the read-side view
//! over the mapped section.

use crate::error::{Error, Result};
use crate::item::{Val, MAX_WIDE_VAL, OVERFLOW_VAL};
use crate::strmap::StrMap;
use crate::MAX_VALUE_SIZE;

/// Build-side dictionary for one field.
pub struct LexiconBuilder {
    map: StrMap,
    narrow_bound: Val,
    overflow: bool,
}

impl Default for LexiconBuilder {
    fn default() -> Self {
        LexiconBuilder::new()
    }
}

impl LexiconBuilder {
    pub fn new() -> Self {
        LexiconBuilder {
            map: StrMap::new(),
            narrow_bound: OVERFLOW_VAL,
            overflow: false,
        }
    }

    /// Build with a reduced narrow-domain bound. Test hook: exercising the
    /// overflow path with the real 24-bit bound needs 16M distinct values.
    #[cfg(test)]
    pub(crate) fn with_narrow_bound(narrow_bound: Val) -> Self {
        LexiconBuilder {
            map: StrMap::new(),
            narrow_bound,
            overflow: false,
        }
    }

    /// Intern `value`, returning its id (0 for the empty value).
    pub fn insert(&mut self, value: &[u8]) -> Result<Val> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge);
        }
        if value.is_empty() {
            return Ok(0);
        }
        if self.map.len() >= MAX_WIDE_VAL {
            return Err(Error::TooManyValues);
        }
        let id = self.map.insert(value);
        if id == 0 {
            return Err(Error::OutOfMemory);
        }
        if id >= self.narrow_bound {
            self.overflow = true;
        }
        Ok(id)
    }

    /// Whether any id crossed the narrow-domain bound.
    pub fn has_overflow(&self) -> bool {
        self.overflow
    }

    /// Number of distinct non-empty values.
    pub fn num_values(&self) -> u64 {
        self.map.len()
    }

    /// The id `insert` assigned to a value this build has already seen,
    /// 0 when absent.
    pub fn get(&self, value: &[u8]) -> Val {
        self.map.get(value)
    }

    /// Freeze into the on-disk section bytes.
    pub fn finalize(&self) -> Result<Vec<u8>> {
        let n = self.map.len();
        if n > u32::MAX as u64 - 1 {
            return Err(Error::TooManyValues);
        }
        let n = n as usize;

        // First pass: lengths by id, so values land in id order regardless
        // of the map's iteration order.
        let mut lens = vec![0u32; n];
        let mut total = 0u64;
        self.map.for_each(|id, bytes| {
            lens[(id - 1) as usize] = bytes.len() as u32;
            total += bytes.len() as u64;
        });
        if total > u32::MAX as u64 {
            return Err(Error::TooManyValues);
        }

        let mut out = Vec::with_capacity(4 + (n + 1) * 4 + total as usize);
        out.extend_from_slice(&(n as u32).to_le_bytes());
        let mut cum = 0u32;
        out.extend_from_slice(&cum.to_le_bytes());
        for &len in &lens {
            cum += len;
            out.extend_from_slice(&cum.to_le_bytes());
        }

        // Second pass: payload bytes at their offsets.
        let payload_base = out.len();
        out.resize(payload_base + total as usize, 0);
        let mut offsets = vec![0u32; n + 1];
        let mut cum = 0u32;
        for (i, &len) in lens.iter().enumerate() {
            offsets[i + 1] = cum + len;
            cum += len;
        }
        self.map.for_each(|id, bytes| {
            let start = payload_base + offsets[(id - 1) as usize] as usize;
            out[start..start + bytes.len()].copy_from_slice(bytes);
        });
        Ok(out)
    }
}

/// Read-side view over one finalised lexicon section.
#[derive(Clone, Copy)]
pub struct LexiconRef<'a> {
    count: u32,
    offsets: &'a [u8],
    payload: &'a [u8],
}

impl<'a> LexiconRef<'a> {
    /// Parse and validate a mapped lexicon section.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::CorruptSection);
        }
        let count = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let table_len = (count as usize + 1)
            .checked_mul(4)
            .ok_or(Error::CorruptSection)?;
        if bytes.len() < 4 + table_len {
            return Err(Error::CorruptSection);
        }
        let offsets = &bytes[4..4 + table_len];
        let payload = &bytes[4 + table_len..];
        let lex = LexiconRef {
            count,
            offsets,
            payload,
        };
        // Offsets must start at zero, never decrease, and stay in bounds.
        let mut prev = 0u32;
        for i in 0..=count {
            let off = lex.offset(i);
            if (i == 0 && off != 0) || off < prev || off as usize > payload.len() {
                return Err(Error::CorruptSection);
            }
            prev = off;
        }
        Ok(lex)
    }

    /// Re-slice a section that [`LexiconRef::parse`] already validated,
    /// skipping the offset scan.
    pub(crate) fn from_validated(bytes: &'a [u8]) -> Self {
        debug_assert!(bytes.len() >= 8);
        let count = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        let table_len = (count as usize + 1) * 4;
        LexiconRef {
            count,
            offsets: &bytes[4..4 + table_len],
            payload: &bytes[4 + table_len..],
        }
    }

    #[inline]
    fn offset(&self, i: u32) -> u32 {
        let p = i as usize * 4;
        u32::from_le_bytes(self.offsets[p..p + 4].try_into().unwrap())
    }

    /// Number of addressable values, counting the empty value id 0.
    pub fn size(&self) -> u64 {
        self.count as u64 + 1
    }

    /// The bytes of value `val`; `Some(b"")` for id 0, `None` out of range.
    pub fn value(&self, val: Val) -> Option<&'a [u8]> {
        if val == 0 {
            Some(b"")
        } else if val <= self.count as u64 {
            let lo = self.offset(val as u32 - 1) as usize;
            let hi = self.offset(val as u32) as usize;
            Some(&self.payload[lo..hi])
        } else {
            None
        }
    }

    /// Linear lookup of `bytes`; `Some(0)` for the empty value, `None` when
    /// the lexicon does not contain it.
    pub fn find(&self, bytes: &[u8]) -> Option<Val> {
        if bytes.is_empty() {
            return Some(0);
        }
        (1..=self.count as u64).find(|&v| self.value(v) == Some(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(values: &[&[u8]]) -> (LexiconBuilder, Vec<u8>) {
        let mut b = LexiconBuilder::new();
        for v in values {
            b.insert(v).unwrap();
        }
        let bytes = b.finalize().unwrap();
        (b, bytes)
    }

    #[test]
    fn roundtrip_values() {
        let (b, bytes) = build(&[b"alpha", b"b", b"", b"a-value-longer-than-seven-bytes"]);
        assert_eq!(b.num_values(), 3);
        let lex = LexiconRef::parse(&bytes).unwrap();
        assert_eq!(lex.size(), 4);
        assert_eq!(lex.value(0), Some(&b""[..]));
        // Ids are first-seen order.
        assert_eq!(lex.value(b.get(b"alpha")), Some(&b"alpha"[..]));
        assert_eq!(lex.value(b.get(b"b")), Some(&b"b"[..]));
        assert_eq!(
            lex.value(b.get(b"a-value-longer-than-seven-bytes")),
            Some(&b"a-value-longer-than-seven-bytes"[..])
        );
        assert_eq!(lex.value(4), None);
    }

    #[test]
    fn find_matches_insert() {
        let (b, bytes) = build(&[b"x", b"yy", b"zzz"]);
        let lex = LexiconRef::parse(&bytes).unwrap();
        for v in [&b"x"[..], b"yy", b"zzz"] {
            assert_eq!(lex.find(v), Some(b.get(v)));
        }
        assert_eq!(lex.find(b""), Some(0));
        assert_eq!(lex.find(b"missing"), None);
    }

    #[test]
    fn empty_lexicon() {
        let (_, bytes) = build(&[]);
        let lex = LexiconRef::parse(&bytes).unwrap();
        assert_eq!(lex.size(), 1);
        assert_eq!(lex.value(0), Some(&b""[..]));
        assert_eq!(lex.value(1), None);
    }

    #[test]
    fn value_too_large() {
        let mut b = LexiconBuilder::new();
        let big = vec![b'v'; MAX_VALUE_SIZE + 1];
        assert_eq!(b.insert(&big), Err(Error::ValueTooLarge));
        let ok = vec![b'v'; MAX_VALUE_SIZE];
        assert!(b.insert(&ok).is_ok());
    }

    #[test]
    fn overflow_flag_sets_at_bound() {
        let mut b = LexiconBuilder::with_narrow_bound(4);
        for v in [&b"a"[..], b"b", b"c"] {
            b.insert(v).unwrap();
        }
        assert!(!b.has_overflow());
        b.insert(b"d").unwrap();
        assert!(b.has_overflow());
        // Ids stay real past the bound.
        assert_eq!(b.get(b"d"), 4);
    }

    #[test]
    fn parse_rejects_truncation() {
        let (_, bytes) = build(&[b"abc", b"de"]);
        assert!(LexiconRef::parse(&bytes[..bytes.len() - 1]).is_err());
        assert!(LexiconRef::parse(&bytes[..6]).is_err());
        assert!(LexiconRef::parse(b"").is_err());
    }
}
