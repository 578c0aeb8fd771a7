//! Integer address range to country label lookup.

use serde::{Deserialize, Serialize};

pub const UNKNOWN_LABEL: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub lower_bound: i64,
    pub upper_bound: i64,
    pub label: String,
}

/// Immutable range table, sorted by lower bound at construction.
///
/// Lookups binary-search the lower bounds and then scan only the ranges whose
/// lower bound lies within the widest range's span of the value. Overlap is
/// not rejected; when ranges overlap, the covering range with the smallest
/// lower bound wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeLookup {
    ranges: Vec<IpRange>,
    max_width: i64,
}

impl RangeLookup {
    pub fn new(mut ranges: Vec<IpRange>) -> Self {
        ranges.sort_by(|a, b| {
            a.lower_bound
                .cmp(&b.lower_bound)
                .then(a.upper_bound.cmp(&b.upper_bound))
        });
        let max_width = ranges
            .iter()
            .map(|r| r.upper_bound.saturating_sub(r.lower_bound))
            .max()
            .unwrap_or(0);
        Self { ranges, max_width }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[IpRange] {
        &self.ranges
    }

    /// Label of the covering range, or [`UNKNOWN_LABEL`].
    pub fn lookup(&self, value: i64) -> &str {
        let end = self.ranges.partition_point(|r| r.lower_bound <= value);
        let floor = value.saturating_sub(self.max_width);
        let start = self.ranges[..end].partition_point(|r| r.lower_bound < floor);

        self.ranges[start..end]
            .iter()
            .find(|r| value <= r.upper_bound)
            .map(|r| r.label.as_str())
            .unwrap_or(UNKNOWN_LABEL)
    }
}
