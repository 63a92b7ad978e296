//! `/proc/<pid>/maps` parsing.

use std::fs::File;
use std::io::{self, BufRead, BufReader};

/// A memory region from `/proc/<pid>/maps`.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub perms: String,
    pub offset: usize,
    pub path: Option<String>,
}

impl MemoryRegion {
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    pub fn is_readable(&self) -> bool {
        self.perms.starts_with('r')
    }

    pub fn is_writable(&self) -> bool {
        self.perms.chars().nth(1) == Some('w')
    }

    pub fn is_executable(&self) -> bool {
        self.perms.chars().nth(2) == Some('x')
    }
}

/// Parse the memory map of a running process.
pub fn parse_maps(pid: i32) -> io::Result<Vec<MemoryRegion>> {
    let file = File::open(format!("/proc/{pid}/maps"))?;
    parse_maps_from(BufReader::new(file))
}

/// Parse maps-formatted lines from any reader.
pub fn parse_maps_from(reader: impl BufRead) -> io::Result<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(range) = parts.next() else { continue };
        let Some((start, end)) = range.split_once('-') else {
            continue;
        };
        let start = usize::from_str_radix(start, 16).unwrap_or(0);
        let end = usize::from_str_radix(end, 16).unwrap_or(0);
        let perms = parts.next().unwrap_or("").to_owned();
        let offset = parts
            .next()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .unwrap_or(0);
        let _dev = parts.next();
        let _inode = parts.next();
        // Paths may contain spaces; take the rest of the line.
        let path = match parts.next() {
            Some(first) => {
                let index = line.find(first).unwrap_or(line.len() - first.len());
                Some(line[index..].to_owned())
            }
            None => None,
        };
        regions.push(MemoryRegion {
            start,
            end,
            perms,
            offset,
            path,
        });
    }
    Ok(regions)
}
