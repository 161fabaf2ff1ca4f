//! The store capability a [`Session`](crate::Session) talks to.
//!
//! A backend hands out one [`BackendConnection`] per successful login. The
//! connection administers tables and opens batch writers and scans; it knows
//! nothing about pooling or session state, which live above it.

pub mod memory;

use crate::error::Result;
use crate::mutation::{Cell, Mutation};
use crate::permission::{Authorizations, Credentials};
use crate::scan::filter::ScanFilter;
use std::sync::Arc;

/// Where a session connects.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// In-process instance, logged in as the root principal. Connecting to an
    /// unknown name creates the instance.
    Embedded { instance: String },
    /// Named cluster instance behind one or more endpoints.
    Cluster {
        instance: String,
        endpoints: Vec<String>,
        credentials: Credentials,
    },
}

impl ConnectTarget {
    pub fn embedded(instance: impl Into<String>) -> Self {
        ConnectTarget::Embedded {
            instance: instance.into(),
        }
    }

    pub fn cluster(
        instance: impl Into<String>,
        endpoints: impl IntoIterator<Item = impl Into<String>>,
        credentials: Credentials,
    ) -> Self {
        ConnectTarget::Cluster {
            instance: instance.into(),
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            credentials,
        }
    }

    pub fn instance(&self) -> &str {
        match self {
            ConnectTarget::Embedded { instance } | ConnectTarget::Cluster { instance, .. } => {
                instance
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableOptions {
    /// Keep every timestamped version of a column. When false only the
    /// version with the highest timestamp survives.
    pub keep_all_versions: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            keep_all_versions: true,
        }
    }
}

impl TableOptions {
    pub fn latest_version_only() -> Self {
        Self {
            keep_all_versions: false,
        }
    }
}

pub trait StoreBackend: Send + Sync {
    fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn BackendConnection>>;
}

pub trait BackendConnection: Send + Sync {
    /// The user this connection is authenticated as.
    fn principal(&self) -> &str;

    fn create_table(&self, table: &str, options: TableOptions) -> Result<()>;

    fn delete_table(&self, table: &str) -> Result<()>;

    fn table_exists(&self, table: &str) -> Result<bool>;

    fn list_tables(&self) -> Result<Vec<String>>;

    /// Authorizations granted to the principal; `None` means unrestricted.
    fn granted_authorizations(&self) -> Result<Option<Authorizations>>;

    fn open_batch_writer(&self, table: &str, max_buffered_bytes: u64)
    -> Result<Box<dyn BatchWriterHandle>>;

    fn open_scanner(
        &self,
        table: &str,
        authorizations: &Authorizations,
        filter: &ScanFilter,
        batch_size: usize,
    ) -> Result<Box<dyn ScanHandle>>;

    /// Releases the connection. Further calls on it fail.
    fn close(&self);
}

/// Buffered write path for one table. Appends may run concurrently.
pub trait BatchWriterHandle: Send + Sync {
    /// Buffers `mutation`; flushes synchronously once the buffer reaches the
    /// writer's threshold.
    fn append(&self, mutation: Mutation) -> Result<()>;

    /// Blocks until every buffered mutation has been applied.
    fn flush(&self) -> Result<()>;

    /// Flushes, then releases the writer. Appends after close are rejected.
    /// When the flush fails the writer stays open with its buffer intact.
    fn close(&self) -> Result<()>;

    fn buffered_bytes(&self) -> u64;
}

/// Server-side cursor over a filtered table range.
pub trait ScanHandle: Send {
    /// Next run of matching cells in key order; empty once exhausted.
    fn next_batch(&mut self) -> Result<Vec<Cell>>;

    fn close(&mut self);
}
