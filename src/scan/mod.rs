pub mod filter;

use crate::Session;
use crate::error::{Result, StoreError};
use crate::mutation::Cell;
use crate::permission::Authorizations;
use crate::storage::{BackendConnection, ScanHandle};
use filter::{ColumnSelector, RowRange, ScanFilter};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Filters fixed, nothing requested from the backend yet.
    Created,
    Open,
    Exhausted,
    Closed,
}

enum Cursor {
    Created,
    Open(Box<dyn ScanHandle>),
    Exhausted,
    Closed,
}

/// Lazy, ordered sequence of visible cells from one table.
///
/// The backend range request is issued on the first [`Scanner::next_cell`].
/// A scanner is single-use: once exhausted or closed, build a new one to read
/// again. It stays valid only while the session that built it remains
/// connected.
pub struct Scanner {
    table: String,
    connection: Arc<dyn BackendConnection>,
    live: Arc<AtomicBool>,
    authorizations: Authorizations,
    filter: ScanFilter,
    batch_size: usize,
    cursor: Cursor,
    buffered: VecDeque<Cell>,
}

impl Scanner {
    pub(crate) fn new(
        table: String,
        connection: Arc<dyn BackendConnection>,
        live: Arc<AtomicBool>,
        authorizations: Authorizations,
        filter: ScanFilter,
        batch_size: usize,
    ) -> Self {
        Self {
            table,
            connection,
            live,
            authorizations,
            filter,
            batch_size,
            cursor: Cursor::Created,
            buffered: VecDeque::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn authorizations(&self) -> &Authorizations {
        &self.authorizations
    }

    pub fn filter(&self) -> &ScanFilter {
        &self.filter
    }

    pub fn state(&self) -> ScanState {
        match self.cursor {
            Cursor::Created => ScanState::Created,
            Cursor::Open(_) => ScanState::Open,
            Cursor::Exhausted => ScanState::Exhausted,
            Cursor::Closed => ScanState::Closed,
        }
    }

    /// Next visible cell, or `None` once the range is exhausted.
    ///
    /// A backend failure ends the scan: the error is returned once and later
    /// calls yield `None`.
    pub fn next_cell(&mut self) -> Result<Option<Cell>> {
        if matches!(self.cursor, Cursor::Closed) {
            return Err(StoreError::ScannerClosed);
        }
        if !self.live.load(Ordering::Acquire) {
            return Err(StoreError::NotConnected);
        }
        loop {
            if let Some(cell) = self.buffered.pop_front() {
                return Ok(Some(cell));
            }
            match &mut self.cursor {
                Cursor::Created => {
                    if self.filter.range.is_empty() {
                        self.cursor = Cursor::Exhausted;
                        continue;
                    }
                    match self.connection.open_scanner(
                        &self.table,
                        &self.authorizations,
                        &self.filter,
                        self.batch_size,
                    ) {
                        Ok(handle) => {
                            debug!(table = %self.table, batch_size = self.batch_size, "scanner opened");
                            self.cursor = Cursor::Open(handle);
                        }
                        Err(err) => {
                            self.cursor = Cursor::Exhausted;
                            return Err(err);
                        }
                    }
                }
                Cursor::Open(handle) => match handle.next_batch() {
                    Ok(batch) if batch.is_empty() => {
                        handle.close();
                        self.cursor = Cursor::Exhausted;
                    }
                    Ok(batch) => self.buffered.extend(batch),
                    Err(err) => {
                        handle.close();
                        self.cursor = Cursor::Exhausted;
                        return Err(err);
                    }
                },
                Cursor::Exhausted => return Ok(None),
                Cursor::Closed => return Err(StoreError::ScannerClosed),
            }
        }
    }

    /// Releases backend resources early. Later reads fail with
    /// [`StoreError::ScannerClosed`].
    pub fn close(&mut self) {
        if let Cursor::Open(handle) = &mut self.cursor {
            handle.close();
        }
        self.cursor = Cursor::Closed;
        self.buffered.clear();
    }

    /// Drains the remaining cells.
    pub fn collect_cells(mut self) -> Result<Vec<Cell>> {
        let mut out = Vec::new();
        while let Some(cell) = self.next_cell()? {
            out.push(cell);
        }
        Ok(out)
    }
}

impl Iterator for Scanner {
    type Item = Result<Cell>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_cell().transpose()
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Cursor::Open(handle) = &mut self.cursor {
            handle.close();
        }
    }
}

/// Fixes the filters and authorizations of a [`Scanner`].
pub struct ScanBuilder<'a> {
    session: &'a Session,
    table: String,
    authorizations: Authorizations,
    filter: ScanFilter,
}

impl<'a> ScanBuilder<'a> {
    pub(crate) fn new(session: &'a Session, table: impl Into<String>) -> Self {
        Self {
            session,
            table: table.into(),
            authorizations: Authorizations::empty(),
            filter: ScanFilter::default(),
        }
    }

    pub fn authorizations(mut self, authorizations: Authorizations) -> Self {
        self.authorizations = authorizations;
        self
    }

    pub fn family(mut self, family: impl Into<Vec<u8>>) -> Self {
        self.filter
            .columns
            .push(ColumnSelector::Family(family.into()));
        self
    }

    pub fn column(mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) -> Self {
        self.filter.columns.push(ColumnSelector::Column {
            family: family.into(),
            qualifier: qualifier.into(),
        });
        self
    }

    pub fn range(mut self, range: RowRange) -> Self {
        self.filter.range = range;
        self
    }

    /// Validates the table and authorizations; nothing is read yet.
    pub fn build(self) -> Result<Scanner> {
        self.session
            .open_scanner(self.table, self.authorizations, self.filter)
    }
}
