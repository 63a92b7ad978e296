//! Shared fixtures: write schema XML to a temp directory and load it.
#![allow(dead_code)]

use std::fs;

use dfmem::Structures;
use tempfile::TempDir;

pub const EMPTY_SYMBOLS: &str = "<data-definition/>";

/// Write the given `(file name, content)` pairs, adding an empty
/// `symbols.xml` unless one is provided.
pub fn write_structures(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut has_symbols = false;
    for (name, content) in files {
        if *name == "symbols.xml" {
            has_symbols = true;
        }
        fs::write(dir.path().join(name), content).expect("write schema file");
    }
    if !has_symbols {
        fs::write(dir.path().join("symbols.xml"), EMPTY_SYMBOLS).expect("write symbols.xml");
    }
    dir
}

pub fn load(files: &[(&str, &str)]) -> Structures {
    let dir = write_structures(files);
    Structures::load(dir.path()).expect("load structures")
}
