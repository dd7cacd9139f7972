//! Command-line surface of the `trailpack` binary.
//!
//! Hand-rolled argument parsing into a [`ParsedArgs`] value, then dispatch
//! to one of the operations in [`ops`]. The CLI layer reports failures
//! through `anyhow`; the library's typed errors become context on the way
//! up.

pub mod filter_expr;
pub mod ops;

use std::path::PathBuf;

use anyhow::{anyhow, bail};

/// Selected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Print store metadata.
    Info,
    /// Print events, optionally filtered.
    Dump,
    /// Build a page index for a store.
    Index,
    /// Merge stores into a new one.
    Merge,
}

/// Everything parsed from the command line.
#[derive(Debug)]
pub struct ParsedArgs {
    pub op: Op,
    /// The store operated on (`info`, `dump`, `index`) or the merge output.
    pub store: PathBuf,
    /// Merge inputs.
    pub inputs: Vec<PathBuf>,
    /// Explicit index output path (`index -o`).
    pub output: Option<PathBuf>,
    /// Filter expression (`dump --filter`).
    pub filter: Option<String>,
    /// Whether `dump` may shortlist trails through an on-disk index.
    pub use_index: bool,
    /// Whether `merge` writes a package file instead of a directory.
    pub package: bool,
}

pub const USAGE: &str = "\
usage: trailpack <op> [args]

operations:
  info  <store>                         print store metadata
  dump  <store> [--filter EXPR] [--no-index]
                                        print events as tab-separated text
  index <store> [-o PATH]               build a page index
  merge <output> <input>... [--package] rewrite inputs into one store

filter syntax: terms are field=value, field!=value, field=@file or field=
(empty value); whitespace separates alternatives within a clause, '&'
separates clauses. Example:
  \"author=Asimov & name=Foundation name=@names.txt & price!=\"
";

/// Parse `argv` (without the program name).
pub fn parse_args(argv: &[String]) -> anyhow::Result<ParsedArgs> {
    let mut it = argv.iter();
    let op = match it.next().map(String::as_str) {
        Some("info") => Op::Info,
        Some("dump") => Op::Dump,
        Some("index") => Op::Index,
        Some("merge") => Op::Merge,
        Some(other) => bail!("unknown operation: {other}"),
        None => bail!("missing operation"),
    };

    let mut positional: Vec<PathBuf> = Vec::new();
    let mut output = None;
    let mut filter = None;
    let mut use_index = true;
    let mut package = false;
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--filter" => {
                let expr = it.next().ok_or_else(|| anyhow!("--filter needs an expression"))?;
                filter = Some(expr.clone());
            }
            "--no-index" => use_index = false,
            "--package" => package = true,
            "-o" | "--output" => {
                let path = it.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
                output = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("unknown option: {flag}"),
            path => positional.push(PathBuf::from(path)),
        }
    }

    let (store, inputs) = match op {
        Op::Merge => {
            if positional.len() < 2 {
                bail!("merge needs an output and at least one input");
            }
            let store = positional.remove(0);
            (store, positional)
        }
        _ => {
            if positional.len() != 1 {
                bail!("expected exactly one store path");
            }
            (positional.remove(0), Vec::new())
        }
    };
    if filter.is_some() && op != Op::Dump {
        bail!("--filter only applies to dump");
    }
    if package && op != Op::Merge {
        bail!("--package only applies to merge");
    }
    if output.is_some() && op != Op::Index {
        bail!("-o only applies to index");
    }

    Ok(ParsedArgs {
        op,
        store,
        inputs,
        output,
        filter,
        use_index,
        package,
    })
}

/// Execute a parsed command line.
pub fn run(args: ParsedArgs) -> anyhow::Result<()> {
    match args.op {
        Op::Info => ops::op_info(&args.store),
        Op::Dump => ops::op_dump(&args.store, args.filter.as_deref(), args.use_index),
        Op::Index => ops::op_index(&args.store, args.output),
        Op::Merge => ops::op_merge(&args.store, &args.inputs, args.package),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_dump_with_filter() {
        let a = parse_args(&argv(&["dump", "store", "--filter", "user=alice"])).unwrap();
        assert_eq!(a.op, Op::Dump);
        assert_eq!(a.store, PathBuf::from("store"));
        assert_eq!(a.filter.as_deref(), Some("user=alice"));
        assert!(a.use_index);
    }

    #[test]
    fn parses_merge_inputs() {
        let a = parse_args(&argv(&["merge", "out", "a", "b", "--package"])).unwrap();
        assert_eq!(a.op, Op::Merge);
        assert_eq!(a.store, PathBuf::from("out"));
        assert_eq!(a.inputs.len(), 2);
        assert!(a.package);
    }

    #[test]
    fn rejects_bad_usage() {
        assert!(parse_args(&argv(&[])).is_err());
        assert!(parse_args(&argv(&["frobnicate", "x"])).is_err());
        assert!(parse_args(&argv(&["info"])).is_err());
        assert!(parse_args(&argv(&["info", "a", "b"])).is_err());
        assert!(parse_args(&argv(&["merge", "out"])).is_err());
        assert!(parse_args(&argv(&["info", "s", "--filter", "x"])).is_err());
        assert!(parse_args(&argv(&["dump", "s", "--bogus"])).is_err());
    }
}
