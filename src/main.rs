//! Binary entry point for the `trailpack` command-line tool.
//!
//! Wires up logging, parses the command line, and dispatches to the
//! operation implementations in `trailpack::cli::ops`. Exit codes: 0 on
//! success, 1 on any failure (bad usage prints the usage text).

use trailpack::cli::{parse_args, run, USAGE};

fn main() {
    env_logger::init();
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("trailpack: {e}");
            eprint!("{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("trailpack: {e:#}");
        std::process::exit(1);
    }
}
