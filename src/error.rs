//! Crate-wide error type.
//!
//! Every fallible operation in the store returns [`Result`]. Each variant is
//! one distinct failure kind; build-side validation errors come out of the
//! encoder, read-side consistency errors out of `Db::open` and
//! `PageIndex::open`. Cursors and filter evaluation never fail: everything
//! they consume is validated at open time.

use core::fmt;

/// Failure kinds for store construction, opening, and lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A file or directory could not be opened or created.
    IoOpen,
    /// A read from an already-open file failed.
    IoRead,
    /// A write to an output file failed (disk full, permissions).
    IoWrite,
    /// The given path is neither a package file nor a store directory.
    InvalidPath,
    /// More fields requested than the item encoding can address.
    TooManyFields,
    /// Two fields share the same name.
    DuplicateField,
    /// A field name is empty, too long, reserved, or contains bad characters.
    InvalidFieldName,
    /// A single value exceeds the maximum value size.
    ValueTooLarge,
    /// A field accumulated more distinct values than the store can encode.
    TooManyValues,
    /// A timestamp or in-trail timestamp delta exceeds the encodable range.
    TimestampTooLarge,
    /// No field with the given name or number exists in this store.
    UnknownField,
    /// The UUID is not present in this store.
    UnknownUuid,
    /// The index file was built from a different store.
    IndexChecksumMismatch,
    /// The store (or index) was written by an incompatible format version.
    VersionMismatch,
    /// A section is truncated, out of bounds, or internally inconsistent.
    CorruptSection,
    /// An allocation failed while interning values.
    OutOfMemory,
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Stable identifier string for this error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::IoOpen => "IO_OPEN",
            Error::IoRead => "IO_READ",
            Error::IoWrite => "IO_WRITE",
            Error::InvalidPath => "INVALID_PATH",
            Error::TooManyFields => "TOO_MANY_FIELDS",
            Error::DuplicateField => "DUPLICATE_FIELD",
            Error::InvalidFieldName => "INVALID_FIELDNAME",
            Error::ValueTooLarge => "VALUE_TOO_LARGE",
            Error::TooManyValues => "TOO_MANY_VALUES",
            Error::TimestampTooLarge => "TIMESTAMP_TOO_LARGE",
            Error::UnknownField => "UNKNOWN_FIELD",
            Error::UnknownUuid => "UNKNOWN_UUID",
            Error::IndexChecksumMismatch => "INDEX_CHECKSUM_MISMATCH",
            Error::VersionMismatch => "VERSION_MISMATCH",
            Error::CorruptSection => "CORRUPT_SECTION",
            Error::OutOfMemory => "OUT_OF_MEMORY",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}
