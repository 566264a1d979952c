//! mo2-vfs-helper - hosts the FUSE mount outside a sandboxed manager.
//!
//! Usage: `mo2-vfs-helper <config-path>`.
//!
//! Stdout carries the line protocol (`mounted`, `ok`, `error: <message>`);
//! logging goes to stderr. Exit code 0 on clean shutdown, non-zero with an
//! `error:` line for any startup failure.

use std::env;
use std::path::Path;
use std::process;

fn main() {
    let mut args = env::args();
    let _program = args.next();
    let Some(config_path) = args.next() else {
        eprintln!("Usage: mo2-vfs-helper <config-path>");
        process::exit(1);
    };

    mo2vfs::logging::init_stderr_logging();
    process::exit(mo2vfs::helper::server::run(Path::new(&config_path)));
}
