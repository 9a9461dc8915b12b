//! Cheap line statistics.
//!
//! Counts are computed by multiset matching rather than an alignment diff:
//! every baseline line is put in a bag, current lines consume matches, and
//! whatever is left over on either side counts as added or deleted. Moving a
//! line therefore costs nothing.

use std::collections::HashMap;

use crate::normalized::FileStat;

/// `(additions, deletions)` between two file contents.
#[must_use]
pub fn line_stats(original: &str, current: &str) -> (usize, usize) {
    let mut bag: HashMap<&str, usize> = HashMap::new();
    for line in original.lines() {
        *bag.entry(line).or_insert(0) += 1;
    }

    let mut additions = 0;
    for line in current.lines() {
        match bag.get_mut(line) {
            Some(n) if *n > 0 => *n -= 1,
            _ => additions += 1,
        }
    }
    let deletions = bag.values().sum();
    (additions, deletions)
}

/// Stats for one file; a missing side counts as empty.
#[must_use]
pub fn file_stat(path: &str, original: Option<&str>, current: Option<&str>) -> FileStat {
    let (additions, deletions) = line_stats(original.unwrap_or(""), current.unwrap_or(""));
    FileStat {
        path: path.to_string(),
        additions,
        deletions,
    }
}
