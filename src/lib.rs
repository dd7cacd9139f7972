//! trailpack: a compressed, immutable, columnar store for per-entity event
//! trails.
//!
//! Every entity is a 128-bit UUID owning one *trail*: a time-ordered
//! sequence of events, each a timestamp plus a small tuple of categorical
//! field values. Values intern into per-field lexicons; events encode as
//! Huffman codewords over item and bigram symbols in one bit-packed stream.
//! Stores persist bit-exactly as a directory of sections or a single
//! package file, and open by memory mapping.
//!
//! Typical round trip:
//!
//! ```no_run
//! use trailpack::{Db, Encoder};
//!
//! let mut enc = Encoder::new("events.tp", &["user", "action"])?;
//! enc.add(&[0u8; 16], 1000, &[b"alice", b"login"])?;
//! enc.finalize()?;
//!
//! let db = Db::open("events.tp")?;
//! let mut cursor = db.cursor();
//! cursor.seek(0)?;
//! while let Some(event) = cursor.next() {
//!     println!("t={}", event.timestamp);
//! }
//! # Ok::<(), trailpack::Error>(())
//! ```

pub mod bits;
pub mod cli;
pub mod cursor;
pub mod db;
pub mod encode;
pub mod error;
pub mod filter;
pub mod huffman;
pub mod index;
pub mod item;
pub mod lexicon;
pub mod sections;
pub mod strmap;
pub mod uuids;

pub use cursor::{Cursor, Event, MultiCursor};
pub use db::Db;
pub use encode::{Encoder, EncoderOptions};
pub use error::{Error, Result};
pub use filter::{EventFilter, FilterTerm};
pub use index::PageIndex;
pub use item::{item_field, item_is32, item_val, make_item, Field, Item, Val};
pub use uuids::{uuid_from_hex, uuid_hex, Uuid};

/// Most user fields a store can define (field 0 is always `time`).
pub const MAX_NUM_FIELDS: usize = 16_382;

/// Longest accepted field name, in bytes.
pub const MAX_FIELDNAME_LENGTH: usize = 255;

/// Largest accepted single value, in bytes.
pub const MAX_VALUE_SIZE: usize = 1 << 22;

/// Largest encodable timestamp delta within one trail. The first event of
/// a trail is encoded as a delta from zero, so the same bound caps its
/// absolute timestamp; later timestamps may grow past it by accumulation.
pub const MAX_TIMEDELTA: u64 = (1 << 48) - 1;
