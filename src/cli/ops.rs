//! The four CLI operations: `info`, `dump`, `index`, `merge`.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::warn;

use crate::cli::filter_expr::parse_filter;
use crate::db::Db;
use crate::encode::{Encoder, EncoderOptions};
use crate::index::{self, PageIndex};
use crate::item::{item_field, item_val};
use crate::uuids::uuid_hex;

/// Print store metadata.
pub fn op_info(store: &Path) -> anyhow::Result<()> {
    let db = Db::open(store).with_context(|| format!("cannot open store {}", store.display()))?;
    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    writeln!(out, "path\t{}", store.display())?;
    writeln!(out, "version\t{}", db.version())?;
    writeln!(out, "trails\t{}", db.num_trails())?;
    writeln!(out, "events\t{}", db.num_events())?;
    writeln!(out, "min_timestamp\t{}", db.min_timestamp())?;
    writeln!(out, "max_timestamp\t{}", db.max_timestamp())?;
    writeln!(out, "fields\t{}", db.num_fields())?;
    for f in 1..db.num_fields() as u32 {
        writeln!(
            out,
            "field\t{}\t{}\tvalues={}\toverflow={}",
            f,
            db.field_name(f)?,
            db.lexicon_size(f)? - 1,
            db.field_has_overflow_vals(f)?,
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Print events as tab-separated text, one line per event.
pub fn op_dump(store: &Path, filter_expr: Option<&str>, use_index: bool) -> anyhow::Result<()> {
    let db = Db::open(store).with_context(|| format!("cannot open store {}", store.display()))?;
    let filter = filter_expr.map(|e| parse_filter(&db, e)).transpose()?;

    let candidates: Vec<u64> = match (&filter, use_index.then(|| PageIndex::find(store)).flatten())
    {
        (Some(f), Some(index_path)) => match PageIndex::open(&db, &index_path) {
            Ok(index) => index.match_candidates(f),
            Err(e) => {
                warn!(
                    "ignoring index {}: {e}; falling back to a full scan",
                    index_path.display()
                );
                (0..db.num_trails()).collect()
            }
        },
        _ => (0..db.num_trails()).collect(),
    };

    let stdout = std::io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut cursor = db.cursor();
    cursor.set_filter(filter);
    for trail_id in candidates {
        let uuid = uuid_hex(db.get_uuid(trail_id)?);
        cursor.seek(trail_id)?;
        while let Some(event) = cursor.next() {
            write!(out, "{uuid}\t{}", event.timestamp)?;
            for &item in event.items.iter() {
                let f = item_field(item);
                write!(
                    out,
                    "\t{}={}",
                    db.field_name(f)?,
                    String::from_utf8_lossy(db.value(f, item_val(item))?)
                )?;
            }
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

/// Conventional index path for a store.
fn default_index_path(store: &Path) -> PathBuf {
    if store.is_dir() {
        store.join("index")
    } else {
        let mut name = store.as_os_str().to_owned();
        name.push(".index");
        PathBuf::from(name)
    }
}

/// Build a page index.
pub fn op_index(store: &Path, output: Option<PathBuf>) -> anyhow::Result<()> {
    let output = output.unwrap_or_else(|| default_index_path(store));
    index::create(store, &output)
        .with_context(|| format!("indexing {} failed", store.display()))?;
    println!("{}", output.display());
    Ok(())
}

/// Rewrite one or more stores into a new store at `output`.
pub fn op_merge(output: &Path, inputs: &[PathBuf], package: bool) -> anyhow::Result<()> {
    let mut dbs = Vec::with_capacity(inputs.len());
    for input in inputs {
        dbs.push(
            Db::open(input)
                .with_context(|| format!("cannot open input store {}", input.display()))?,
        );
    }

    // Union of user field names, first-seen order across inputs.
    let mut field_names: Vec<String> = Vec::new();
    for db in &dbs {
        for f in 1..db.num_fields() as u32 {
            let name = db.field_name(f)?;
            if !field_names.iter().any(|n| n == name) {
                field_names.push(name.to_owned());
            }
        }
    }
    let name_refs: Vec<&str> = field_names.iter().map(String::as_str).collect();

    let mut enc = Encoder::with_options(output, &name_refs, EncoderOptions { package })?;
    for (db, input) in dbs.iter().zip(inputs) {
        enc.append(db)
            .with_context(|| format!("appending {} failed", input.display()))?;
    }
    enc.finalize()
        .with_context(|| format!("finalizing {} failed", output.display()))?;
    Ok(())
}
