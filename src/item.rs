//! Packed `(field, val)` item codes.
//!
//! An item is an opaque `u64` carrying a field number and an interned value
//! id. Items that fit the narrow domain use a 32-bit layout so the Huffman
//! model sees small, dense codes; everything else uses the 64-bit layout:
//!
//! ```text
//! 32-bit:  [ is32 = 1 : 1 | field : 7  | val : 24 ]
//! 64-bit:  [ is32 = 0 : 1 | field : 15 | val : 48 ]
//! ```
//!
//! Item `0` never names a value; it is the event-terminator sentinel in the
//! encoded trail stream. The narrow `val` of all ones is the per-field
//! overflow sentinel: it never names a stored value either, and is returned
//! by lookups for bytes a lexicon does not contain.

/// Packed `(field, val)` code.
pub type Item = u64;

/// Field number. `0` is the implicit timestamp field; user fields start at 1.
pub type Field = u32;

/// Interned value id within one field. `0` is the empty value.
pub type Val = u64;

/// Event-terminator sentinel in the trail stream.
pub const ITEM_SENTINEL: Item = 0;

/// Narrow-domain value bound: vals below this pack into 32-bit items, and
/// this exact narrow val is the per-field overflow sentinel.
pub const OVERFLOW_VAL: Val = 0xFF_FFFF;

/// Highest field number a 32-bit item can carry.
pub const MAX_NARROW_FIELD: Field = 0x7F;

/// Highest field number any item can carry.
pub const MAX_WIDE_FIELD: Field = 0x7FFF;

/// Highest value id any item can carry.
pub const MAX_WIDE_VAL: Val = (1 << 48) - 1;

/// Pack a field and a real value id into an item.
///
/// `val` at or past [`OVERFLOW_VAL`] always takes the wide layout so the
/// narrow sentinel stays unambiguous. Callers guarantee
/// `field <= MAX_WIDE_FIELD` and `val <= MAX_WIDE_VAL`.
#[inline]
pub fn make_item(field: Field, val: Val) -> Item {
    debug_assert!(field <= MAX_WIDE_FIELD);
    debug_assert!(val <= MAX_WIDE_VAL);
    if field <= MAX_NARROW_FIELD && val < OVERFLOW_VAL {
        1 | ((field as u64) << 1) | (val << 8)
    } else {
        ((field as u64) << 1) | (val << 16)
    }
}

/// The overflow sentinel item for `field`: the narrow layout with all value
/// bits set. Only meaningful for fields in the narrow field range.
#[inline]
pub fn overflow_item(field: Field) -> Item {
    debug_assert!(field <= MAX_NARROW_FIELD);
    1 | ((field as u64) << 1) | (OVERFLOW_VAL << 8)
}

/// Whether the item uses the 32-bit layout.
#[inline]
pub fn item_is32(item: Item) -> bool {
    item & 1 == 1
}

/// Field number of an item.
#[inline]
pub fn item_field(item: Item) -> Field {
    if item_is32(item) {
        ((item >> 1) & 0x7F) as Field
    } else {
        ((item >> 1) & 0x7FFF) as Field
    }
}

/// Value id of an item.
#[inline]
pub fn item_val(item: Item) -> Val {
    if item_is32(item) {
        (item >> 8) & 0xFF_FFFF
    } else {
        item >> 16
    }
}

/// Whether the item is a per-field overflow sentinel.
#[inline]
pub fn item_is_overflow(item: Item) -> bool {
    item_is32(item) && item_val(item) == OVERFLOW_VAL
}
