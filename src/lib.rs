pub mod config;
pub mod error;
pub mod mutation;
pub mod permission;
pub mod scan;
pub mod storage;
pub mod visibility;
pub mod writer_pool;

pub use crate::config::Config;
pub use crate::error::{Result, StoreError, StoreErrorCode};
pub use crate::mutation::{Cell, CellKey, CellOptions, Mutation};
pub use crate::permission::{Authorizations, Credentials, SystemPermission};
pub use crate::scan::filter::{ColumnSelector, RowRange, ScanFilter};
pub use crate::scan::{ScanBuilder, ScanState, Scanner};
pub use crate::storage::memory::{MemoryBackend, UserSpec};
pub use crate::storage::{ConnectTarget, StoreBackend, TableOptions};
pub use crate::visibility::VisibilityLabel;

use crate::storage::BackendConnection;
use crate::writer_pool::WriterPool;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

struct Connected {
    instance: String,
    connection: Arc<dyn BackendConnection>,
    writers: WriterPool,
    /// Cleared on disconnect; scanners built from this connection check it
    /// before every read.
    live: Arc<AtomicBool>,
}

enum SessionState {
    Disconnected,
    Connected(Connected),
}

/// Client session against one store instance.
///
/// Holds the backend connection and a pool with at most one batch writer per
/// table. Every operation except [`Session::connect`] fails with
/// [`StoreError::NotConnected`] while disconnected, without touching the
/// backend.
///
/// A session is `Send + Sync` and meant to be shared: submits, scans and
/// table administration take the state lock shared, while connect and
/// disconnect take it exclusively and therefore wait for in-flight calls.
pub struct Session {
    backend: Arc<dyn StoreBackend>,
    config: Arc<Config>,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(backend: Arc<dyn StoreBackend>, config: Config) -> Self {
        Self {
            backend,
            config: Arc::new(config),
            state: RwLock::new(SessionState::Disconnected),
        }
    }

    /// Settings are shared with the writer pool; changes apply to writers and
    /// scanners created afterwards.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn with_connected<T>(&self, f: impl FnOnce(&Connected) -> Result<T>) -> Result<T> {
        match &*self.state.read() {
            SessionState::Connected(connected) => f(connected),
            SessionState::Disconnected => Err(StoreError::NotConnected),
        }
    }

    /// Logs in to `target`.
    ///
    /// An existing connection is replaced only when its pool holds no
    /// writers; otherwise this fails with [`StoreError::WritersPending`] and
    /// the current connection stays in place. A failed login also leaves the
    /// session as it was.
    pub fn connect(&self, target: &ConnectTarget) -> Result<()> {
        let mut state = self.state.write();
        if let SessionState::Connected(current) = &*state {
            if !current.writers.is_empty() {
                return Err(StoreError::WritersPending {
                    tables: current.writers.len(),
                });
            }
        }
        let connection = self.backend.connect(target)?;
        let principal = connection.principal().to_string();
        let writers = WriterPool::new(Arc::clone(&connection), Arc::clone(&self.config));
        let previous = std::mem::replace(
            &mut *state,
            SessionState::Connected(Connected {
                instance: target.instance().to_string(),
                connection,
                writers,
                live: Arc::new(AtomicBool::new(true)),
            }),
        );
        if let SessionState::Connected(previous) = previous {
            previous.live.store(false, Ordering::Release);
            previous.connection.close();
            debug!(instance = %previous.instance, "replaced idle connection");
        }
        info!(instance = target.instance(), principal = %principal, "session connected");
        Ok(())
    }

    /// Closes every pooled writer, invalidates outstanding scanners and
    /// releases the connection.
    ///
    /// The session ends up disconnected even when a writer fails to close;
    /// the first such failure is returned. No-op when already disconnected.
    pub fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), SessionState::Disconnected);
        let SessionState::Connected(connected) = previous else {
            return Ok(());
        };
        connected.live.store(false, Ordering::Release);
        let drained = connected.writers.close_all();
        connected.connection.close();
        info!(instance = %connected.instance, "session disconnected");
        drained
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.state.read(), SessionState::Connected(_))
    }

    /// The user the current connection is authenticated as.
    pub fn principal(&self) -> Result<String> {
        self.with_connected(|c| Ok(c.connection.principal().to_string()))
    }

    pub fn create_table(&self, table: &str, options: TableOptions) -> Result<()> {
        self.with_connected(|c| {
            c.connection.create_table(table, options)?;
            info!(table, keep_all_versions = options.keep_all_versions, "table created");
            Ok(())
        })
    }

    /// Creates `table` keeping every version.
    pub fn create_table_default(&self, table: &str) -> Result<()> {
        self.create_table(table, TableOptions::default())
    }

    /// Drops `table`. A pooled writer for it is closed first, so mutations
    /// already submitted land before the table goes away. If that close
    /// fails the table is left in place, the writer keeps its buffer, and
    /// the close error is returned.
    pub fn delete_table(&self, table: &str) -> Result<()> {
        self.with_connected(|c| {
            c.writers.close(table)?;
            c.connection.delete_table(table)?;
            info!(table, "table deleted");
            Ok(())
        })
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.with_connected(|c| c.connection.table_exists(table))
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.with_connected(|c| c.connection.list_tables())
    }

    /// Hands `mutation` to the table's batch writer, creating it on first
    /// use. Only blocks when the writer's buffer threshold forces a flush.
    pub fn submit(&self, table: &str, mutation: Mutation) -> Result<()> {
        self.with_connected(|c| c.writers.submit(table, mutation))
    }

    /// Submits a single cell stamped with the current time and no label.
    pub fn add_mutation(
        &self,
        table: &str,
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.add_mutation_with(table, row, family, qualifier, CellOptions::default(), value)
    }

    pub fn add_mutation_with(
        &self,
        table: &str,
        row: impl Into<Vec<u8>>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        options: CellOptions,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.submit(
            table,
            Mutation::single(row, family, qualifier, options, value),
        )
    }

    /// Blocks until everything submitted to `table` has been applied.
    pub fn flush(&self, table: &str) -> Result<()> {
        self.with_connected(|c| c.writers.flush(table))
    }

    /// Flushes and releases the table's writer; the next submit opens a new
    /// one.
    pub fn close_writer(&self, table: &str) -> Result<()> {
        self.with_connected(|c| c.writers.close(table))
    }

    /// Tables that currently have a pooled writer, sorted.
    pub fn pooled_writers(&self) -> Result<Vec<String>> {
        self.with_connected(|c| Ok(c.writers.tables()))
    }

    pub fn scanner(&self, table: impl Into<String>) -> ScanBuilder<'_> {
        ScanBuilder::new(self, table)
    }

    pub fn scan_all(&self, table: &str, authorizations: Authorizations) -> Result<Scanner> {
        self.scanner(table).authorizations(authorizations).build()
    }

    pub fn scan_by_family(
        &self,
        table: &str,
        family: impl Into<Vec<u8>>,
        authorizations: Authorizations,
    ) -> Result<Scanner> {
        self.scanner(table)
            .family(family)
            .authorizations(authorizations)
            .build()
    }

    pub fn scan_columns(
        &self,
        table: &str,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        authorizations: Authorizations,
    ) -> Result<Scanner> {
        self.scanner(table)
            .column(family, qualifier)
            .authorizations(authorizations)
            .build()
    }

    /// Every visible cell of one row.
    pub fn scan_by_key(
        &self,
        table: &str,
        row: impl Into<Vec<u8>>,
        authorizations: Authorizations,
    ) -> Result<Scanner> {
        self.scanner(table)
            .range(RowRange::exact(row))
            .authorizations(authorizations)
            .build()
    }

    pub(crate) fn open_scanner(
        &self,
        table: String,
        authorizations: Authorizations,
        filter: ScanFilter,
    ) -> Result<Scanner> {
        self.with_connected(|c| {
            if !c.connection.table_exists(&table)? {
                return Err(StoreError::table_not_found(&table));
            }
            if let Some(granted) = c.connection.granted_authorizations()? {
                let missing = authorizations.missing_from(&granted);
                if !missing.is_empty() {
                    return Err(StoreError::Authorization {
                        message: format!(
                            "user '{}' does not hold authorizations [{}]",
                            c.connection.principal(),
                            missing.join(",")
                        ),
                    });
                }
            }
            let batch_size = self.config.scanner_batch_size()?;
            Ok(Scanner::new(
                table,
                Arc::clone(&c.connection),
                Arc::clone(&c.live),
                authorizations,
                filter,
                batch_size,
            ))
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!(error = %err, "writers failed to close while dropping session");
        }
    }
}
