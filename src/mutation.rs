use crate::error::Result;
use crate::visibility::VisibilityLabel;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed per-update bookkeeping charged against a batch writer's buffer on
/// top of the raw key and value bytes.
const UPDATE_OVERHEAD_BYTES: usize = 24;

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Coordinate of one stored version.
///
/// Ordering is row, family, qualifier, visibility ascending, then timestamp
/// descending so the newest version of a column sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub visibility: VisibilityLabel,
    pub timestamp: i64,
}

impl CellKey {
    /// True when `other` addresses the same column, ignoring the version.
    pub fn same_column(&self, other: &CellKey) -> bool {
        self.row == other.row
            && self.family == other.family
            && self.qualifier == other.qualifier
            && self.visibility == other.visibility
    }

    /// Smallest key of `row`; every cell of the row sorts at or after it.
    pub fn first_of_row(row: &[u8]) -> Self {
        Self {
            row: row.to_vec(),
            family: Vec::new(),
            qualifier: Vec::new(),
            visibility: VisibilityLabel::unrestricted(),
            timestamp: i64::MAX,
        }
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

/// Optional parts of a cell; absent fields default to "now" and
/// "unrestricted".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellOptions {
    pub timestamp: Option<i64>,
    pub visibility: Option<VisibilityLabel>,
}

impl CellOptions {
    pub fn at(timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            visibility: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_visibility(mut self, visibility: VisibilityLabel) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Parses `expression` as the label. Fails before anything reaches a
    /// writer.
    pub fn with_label(self, expression: &str) -> Result<Self> {
        Ok(self.with_visibility(VisibilityLabel::parse(expression)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub key: CellKey,
    pub value: Vec<u8>,
}

impl Cell {
    pub fn new(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        options: CellOptions,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: CellKey {
                row: row.into(),
                family: family.into(),
                qualifier: qualifier.into(),
                visibility: options.visibility.unwrap_or_default(),
                timestamp: options.timestamp.unwrap_or_else(now_millis),
            },
            value: value.into(),
        }
    }

    pub fn row(&self) -> &[u8] {
        &self.key.row
    }

    pub fn family(&self) -> &[u8] {
        &self.key.family
    }

    pub fn qualifier(&self) -> &[u8] {
        &self.key.qualifier
    }

    pub fn visibility(&self) -> &VisibilityLabel {
        &self.key.visibility
    }

    pub fn timestamp(&self) -> i64 {
        self.key.timestamp
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn value_utf8(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub visibility: VisibilityLabel,
    pub timestamp: i64,
    pub value: Vec<u8>,
}

impl ColumnUpdate {
    fn estimated_size(&self) -> usize {
        self.family.len()
            + self.qualifier.len()
            + self.visibility.expression().len()
            + self.value.len()
            + UPDATE_OVERHEAD_BYTES
    }
}

/// Column updates for one row, applied together.
///
/// Build it up with the `put*` methods, then hand it to
/// [`Session::submit`](crate::Session::submit) by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    row: Vec<u8>,
    updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    /// A mutation holding exactly one cell.
    pub fn single(
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        options: CellOptions,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        let mut mutation = Self::new(row);
        mutation.put_cell(family, qualifier, options, value);
        mutation
    }

    pub fn put_cell(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        options: CellOptions,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: options.visibility.unwrap_or_default(),
            timestamp: options.timestamp.unwrap_or_else(now_millis),
            value: value.into(),
        });
        self
    }

    pub fn put(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.put_cell(family, qualifier, CellOptions::default(), value)
    }

    pub fn put_at(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.put_cell(family, qualifier, CellOptions::at(timestamp), value)
    }

    pub fn put_with_visibility(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        visibility: &str,
        value: impl Into<Vec<u8>>,
    ) -> Result<&mut Self> {
        let options = CellOptions::default().with_label(visibility)?;
        Ok(self.put_cell(family, qualifier, options, value))
    }

    pub fn row(&self) -> &[u8] {
        &self.row
    }

    pub fn updates(&self) -> &[ColumnUpdate] {
        &self.updates
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Bytes this mutation occupies in a batch writer buffer.
    pub fn estimated_size(&self) -> usize {
        self.row.len()
            + self
                .updates
                .iter()
                .map(ColumnUpdate::estimated_size)
                .sum::<usize>()
    }

    pub fn into_cells(self) -> impl Iterator<Item = Cell> {
        let row = self.row;
        self.updates.into_iter().map(move |update| Cell {
            key: CellKey {
                row: row.clone(),
                family: update.family,
                qualifier: update.qualifier,
                visibility: update.visibility,
                timestamp: update.timestamp,
            },
            value: update.value,
        })
    }
}
