use crate::mutation::CellKey;
use std::ops::Bound;

/// Smallest byte string strictly greater than every string starting with
/// `prefix`, or `None` when no such bound exists (empty or all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    for i in (0..next.len()).rev() {
        if next[i] != 0xFF {
            next[i] += 1;
            next.truncate(i + 1);
            return Some(next);
        }
    }
    None
}

/// Row-key window of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRange {
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
}

impl Default for RowRange {
    fn default() -> Self {
        Self::all()
    }
}

impl RowRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Half-open `[start, end)`.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Excluded(end.into()),
        }
    }

    /// Inclusive on both ends.
    pub fn closed(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Bound::Included(start.into()),
            end: Bound::Included(end.into()),
        }
    }

    pub fn exact(row: impl Into<Vec<u8>>) -> Self {
        let row = row.into();
        Self {
            start: Bound::Included(row.clone()),
            end: Bound::Included(row),
        }
    }

    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let end = match prefix_successor(&prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(prefix),
            end,
        }
    }

    pub fn from_bounds(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> Bound<&[u8]> {
        self.start.as_ref().map(Vec::as_slice)
    }

    pub fn end(&self) -> Bound<&[u8]> {
        self.end.as_ref().map(Vec::as_slice)
    }

    pub fn is_before_start(&self, row: &[u8]) -> bool {
        match &self.start {
            Bound::Included(start) => row < start.as_slice(),
            Bound::Excluded(start) => row <= start.as_slice(),
            Bound::Unbounded => false,
        }
    }

    pub fn is_past_end(&self, row: &[u8]) -> bool {
        match &self.end {
            Bound::Included(end) => row > end.as_slice(),
            Bound::Excluded(end) => row >= end.as_slice(),
            Bound::Unbounded => false,
        }
    }

    pub fn contains(&self, row: &[u8]) -> bool {
        !self.is_before_start(row) && !self.is_past_end(row)
    }

    /// True when no row can fall inside the window.
    pub fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        }
    }

    /// Seek position in cell-key space for the first row of the window.
    pub fn start_key(&self) -> Bound<CellKey> {
        match &self.start {
            Bound::Included(row) => Bound::Included(CellKey::first_of_row(row)),
            Bound::Excluded(row) => {
                let mut next = row.clone();
                next.push(0);
                Bound::Included(CellKey::first_of_row(&next))
            }
            Bound::Unbounded => Bound::Unbounded,
        }
    }
}

/// One fetched column: a whole family, or a single family/qualifier pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelector {
    Family(Vec<u8>),
    Column { family: Vec<u8>, qualifier: Vec<u8> },
}

impl ColumnSelector {
    pub fn matches(&self, key: &CellKey) -> bool {
        match self {
            ColumnSelector::Family(family) => key.family == *family,
            ColumnSelector::Column { family, qualifier } => {
                key.family == *family && key.qualifier == *qualifier
            }
        }
    }
}

/// Row window plus fetched columns. No selectors means every column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub range: RowRange,
    pub columns: Vec<ColumnSelector>,
}

impl ScanFilter {
    pub fn matches(&self, key: &CellKey) -> bool {
        self.range.contains(&key.row)
            && (self.columns.is_empty() || self.columns.iter().any(|c| c.matches(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::visibility::VisibilityLabel;

    fn key(row: &str, family: &str, qualifier: &str) -> CellKey {
        CellKey {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: VisibilityLabel::unrestricted(),
            timestamp: 1,
        }
    }

    #[test]
    fn half_open_range_excludes_end_row() {
        let range = RowRange::new("2", "3");
        assert!(!range.contains(b"1"));
        assert!(range.contains(b"2"));
        assert!(range.contains(b"25"));
        assert!(!range.contains(b"3"));
        assert!(!range.contains(b"4"));
    }

    #[test]
    fn closed_and_exact_ranges_include_end_row() {
        assert!(RowRange::closed("2", "3").contains(b"3"));
        let exact = RowRange::exact("7");
        assert!(exact.contains(b"7"));
        assert!(!exact.contains(b"70"));
    }

    #[test]
    fn prefix_range_covers_extensions_only() {
        let range = RowRange::prefix("meter:");
        assert!(range.contains(b"meter:"));
        assert!(range.contains(b"meter:17"));
        assert!(!range.contains(b"meter;"));
        assert!(!range.contains(b"meteq"));
        assert_eq!(RowRange::prefix(vec![0xFF, 0xFF]).end(), Bound::Unbounded);
        assert_eq!(prefix_successor(b"ab\xff"), Some(b"ac".to_vec()));
    }

    #[test]
    fn empty_windows_are_detected() {
        assert!(RowRange::new("3", "3").is_empty());
        assert!(RowRange::closed("4", "3").is_empty());
        assert!(!RowRange::closed("3", "3").is_empty());
        assert!(!RowRange::all().is_empty());
    }

    #[test]
    fn exclusive_start_seeks_past_the_row() {
        let range = RowRange::from_bounds(Bound::Excluded(b"2".to_vec()), Bound::Unbounded);
        let Bound::Included(seek) = range.start_key() else {
            panic!("expected inclusive seek key");
        };
        assert!(seek > key("2", "zzz", "zzz"));
        assert!(seek <= key("20", "", ""));
        assert!(!range.contains(b"2"));
    }

    #[test]
    fn column_selectors_union() {
        let filter = ScanFilter {
            range: RowRange::all(),
            columns: vec![
                ColumnSelector::Family(b"electricity".to_vec()),
                ColumnSelector::Column {
                    family: b"water".to_vec(),
                    qualifier: b"cold".to_vec(),
                },
            ],
        };
        assert!(filter.matches(&key("1", "electricity", "anything")));
        assert!(filter.matches(&key("1", "water", "cold")));
        assert!(!filter.matches(&key("1", "water", "hot")));
        assert!(!filter.matches(&key("1", "gas", "")));
        assert!(ScanFilter::default().matches(&key("1", "gas", "")));
    }
}
