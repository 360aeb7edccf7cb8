//! Binlog coordinates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A (file, offset) coordinate in the replication history
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub file: String,
    pub pos: u32,
}

impl Position {
    pub fn new(file: impl Into<String>, pos: u32) -> Self {
        Self {
            file: file.into(),
            pos,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.file, self.pos)
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_file_names(&self.file, &other.file).then(self.pos.cmp(&other.pos))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare binlog file names by base name, then by numeric sequence suffix
///
/// `mysql-bin.999999` rolls over to `mysql-bin.1000000`, so a plain string
/// comparison is not enough.
pub fn compare_file_names(a: &str, b: &str) -> Ordering {
    match (split_file_name(a), split_file_name(b)) {
        (Some((base_a, seq_a)), Some((base_b, seq_b))) => {
            base_a.cmp(base_b).then(seq_a.cmp(&seq_b))
        }
        _ => a.cmp(b),
    }
}

fn split_file_name(name: &str) -> Option<(&str, u64)> {
    let (base, seq) = name.rsplit_once('.')?;
    let seq = seq.parse().ok()?;
    Some((base, seq))
}
