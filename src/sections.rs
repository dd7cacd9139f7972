//! On-disk store layout: section names, directory and package writers, and
//! the package table of contents.
//!
//! A store is seven-plus sections: `info`, `fields`, one `lexicon.N` per
//! user field, `uuids`, `codebook`, `toc`, `trails`. They persist either as
//! separately named files in one directory, or concatenated into a single
//! package file with a trailing directory:
//!
//! ```text
//! [ section_0 ][ section_1 ] ... [ section_n ][ TOC ][ toc_len:u64 ][ MAGIC:u64 ]
//! ```
//!
//! Each TOC entry is `{ name:[u8;32] NUL-padded, offset:u64, length:u64 }`.
//! Both layouts are read-compatible; the reader picks by path type.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, Result};
use crate::item::Field;

/// Store format version, written to `info`.
pub const VERSION: u64 = 1;

/// Package trailer magic.
pub const MAGIC: u64 = u64::from_le_bytes(*b"TRAILPK1");

/// Fixed width of a TOC entry name.
pub const SECTION_NAME_LEN: usize = 32;

/// Bytes per TOC entry.
pub const TOC_ENTRY_LEN: usize = SECTION_NAME_LEN + 16;

pub const SECTION_INFO: &str = "info";
pub const SECTION_FIELDS: &str = "fields";
pub const SECTION_UUIDS: &str = "uuids";
pub const SECTION_CODEBOOK: &str = "codebook";
pub const SECTION_TOC: &str = "toc";
pub const SECTION_TRAILS: &str = "trails";

/// Section name of one user field's lexicon.
pub fn lexicon_section(field: Field) -> String {
    format!("lexicon.{field}")
}

/// One entry of a package's trailing directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

/// Write sections as named files inside `dir` (created if missing).
pub fn write_directory(dir: &Path, sections: &[(String, Vec<u8>)]) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|_| Error::IoOpen)?;
    for (name, bytes) in sections {
        let mut f = File::create(dir.join(name)).map_err(|_| Error::IoOpen)?;
        f.write_all(bytes).map_err(|_| Error::IoWrite)?;
    }
    Ok(())
}

/// Write sections as one package file at `path`.
pub fn write_package(path: &Path, sections: &[(String, Vec<u8>)]) -> Result<()> {
    let mut f = std::io::BufWriter::new(File::create(path).map_err(|_| Error::IoOpen)?);
    let mut offset = 0u64;
    let mut toc = Vec::with_capacity(sections.len());
    for (name, bytes) in sections {
        debug_assert!(name.len() < SECTION_NAME_LEN);
        f.write_all(bytes).map_err(|_| Error::IoWrite)?;
        toc.push(TocEntry {
            name: name.clone(),
            offset,
            length: bytes.len() as u64,
        });
        offset += bytes.len() as u64;
    }
    let toc_len = (toc.len() * TOC_ENTRY_LEN) as u64;
    for e in &toc {
        let mut name = [0u8; SECTION_NAME_LEN];
        name[..e.name.len()].copy_from_slice(e.name.as_bytes());
        f.write_all(&name).map_err(|_| Error::IoWrite)?;
        f.write_all(&e.offset.to_le_bytes())
            .map_err(|_| Error::IoWrite)?;
        f.write_all(&e.length.to_le_bytes())
            .map_err(|_| Error::IoWrite)?;
    }
    f.write_all(&toc_len.to_le_bytes())
        .map_err(|_| Error::IoWrite)?;
    f.write_all(&MAGIC.to_le_bytes())
        .map_err(|_| Error::IoWrite)?;
    f.flush().map_err(|_| Error::IoWrite)?;
    Ok(())
}

/// Parse and validate the trailing directory of a mapped package file.
pub fn read_package_toc(map: &[u8]) -> Result<Vec<TocEntry>> {
    if map.len() < 16 {
        return Err(Error::CorruptSection);
    }
    let tail = map.len() - 16;
    let magic = u64::from_le_bytes(map[tail + 8..].try_into().unwrap());
    if magic != MAGIC {
        return Err(Error::CorruptSection);
    }
    let toc_len = u64::from_le_bytes(map[tail..tail + 8].try_into().unwrap()) as usize;
    if toc_len % TOC_ENTRY_LEN != 0 || toc_len > tail {
        return Err(Error::CorruptSection);
    }
    let toc_start = tail - toc_len;
    let mut entries = Vec::with_capacity(toc_len / TOC_ENTRY_LEN);
    for chunk in map[toc_start..tail].chunks_exact(TOC_ENTRY_LEN) {
        let name_end = chunk[..SECTION_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SECTION_NAME_LEN);
        let name = std::str::from_utf8(&chunk[..name_end])
            .map_err(|_| Error::CorruptSection)?
            .to_owned();
        let offset = u64::from_le_bytes(chunk[SECTION_NAME_LEN..SECTION_NAME_LEN + 8].try_into().unwrap());
        let length = u64::from_le_bytes(chunk[SECTION_NAME_LEN + 8..].try_into().unwrap());
        let end = offset.checked_add(length).ok_or(Error::CorruptSection)?;
        if end > toc_start as u64 {
            return Err(Error::CorruptSection);
        }
        entries.push(TocEntry {
            name,
            offset,
            length,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sections() -> Vec<(String, Vec<u8>)> {
        vec![
            (SECTION_INFO.to_owned(), vec![1, 2, 3]),
            (lexicon_section(1), vec![]),
            (SECTION_TRAILS.to_owned(), vec![9; 100]),
        ]
    }

    #[test]
    fn package_toc_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tp");
        let sections = sample_sections();
        write_package(&path, &sections).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let toc = read_package_toc(&bytes).unwrap();
        assert_eq!(toc.len(), 3);
        for (entry, (name, body)) in toc.iter().zip(&sections) {
            assert_eq!(&entry.name, name);
            let got = &bytes[entry.offset as usize..(entry.offset + entry.length) as usize];
            assert_eq!(got, &body[..]);
        }
    }

    #[test]
    fn directory_write_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        write_directory(&root, &sample_sections()).unwrap();
        assert_eq!(std::fs::read(root.join("info")).unwrap(), vec![1, 2, 3]);
        assert_eq!(std::fs::read(root.join("lexicon.1")).unwrap(), Vec::<u8>::new());
        assert_eq!(std::fs::read(root.join("trails")).unwrap(), vec![9; 100]);
    }

    #[test]
    fn bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tp");
        write_package(&path, &sample_sections()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        assert_eq!(read_package_toc(&bytes), Err(Error::CorruptSection));
    }

    #[test]
    fn truncated_package_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.tp");
        write_package(&path, &sample_sections()).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(read_package_toc(&bytes[..bytes.len() - 20]).is_err());
        assert!(read_package_toc(&bytes[..8]).is_err());
    }
}
