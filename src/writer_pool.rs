//! One batch writer per table, created on first use.

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::mutation::Mutation;
use crate::storage::{BackendConnection, BatchWriterHandle};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

const STRIPES: usize = 16;

struct PooledWriter {
    /// `None` once closed; a submit that races a close retries against a
    /// fresh entry.
    slot: RwLock<Option<Box<dyn BatchWriterHandle>>>,
}

pub struct WriterPool {
    connection: Arc<dyn BackendConnection>,
    config: Arc<Config>,
    stripes: Vec<Mutex<HashMap<String, Arc<PooledWriter>>>>,
}

impl WriterPool {
    pub fn new(connection: Arc<dyn BackendConnection>, config: Arc<Config>) -> Self {
        Self {
            connection,
            config,
            stripes: (0..STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, table: &str) -> &Mutex<HashMap<String, Arc<PooledWriter>>> {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % STRIPES]
    }

    fn get_or_create(&self, table: &str) -> Result<Arc<PooledWriter>> {
        let mut writers = self.stripe(table).lock();
        if let Some(existing) = writers.get(table) {
            return Ok(Arc::clone(existing));
        }
        let max_memory = self.config.batch_writer_max_memory()?;
        let handle = self
            .connection
            .open_batch_writer(table, max_memory)
            .map_err(|err| err.into_rejection(table))?;
        debug!(table, max_memory, "batch writer created");
        let pooled = Arc::new(PooledWriter {
            slot: RwLock::new(Some(handle)),
        });
        writers.insert(table.to_string(), Arc::clone(&pooled));
        Ok(pooled)
    }

    fn get(&self, table: &str) -> Option<Arc<PooledWriter>> {
        self.stripe(table).lock().get(table).cloned()
    }

    /// Drops the entry only if it still holds `pooled`; a fresh writer
    /// created after a close stays pooled.
    fn remove_entry(&self, table: &str, pooled: &Arc<PooledWriter>) {
        let mut writers = self.stripe(table).lock();
        if writers
            .get(table)
            .is_some_and(|current| Arc::ptr_eq(current, pooled))
        {
            writers.remove(table);
        }
    }

    /// Appends `mutation` to the table's writer, creating the writer first if
    /// the pool has none.
    pub fn submit(&self, table: &str, mutation: Mutation) -> Result<()> {
        if mutation.is_empty() {
            return Err(StoreError::MutationRejected {
                table: table.to_string(),
                message: "mutation has no column updates".into(),
            });
        }
        loop {
            let pooled = self.get_or_create(table)?;
            let slot = pooled.slot.read();
            if let Some(writer) = slot.as_ref() {
                return writer
                    .append(mutation)
                    .map_err(|err| err.into_rejection(table));
            }
            // closed between lookup and lock; the entry is already gone
        }
    }

    pub fn flush(&self, table: &str) -> Result<()> {
        let Some(pooled) = self.get(table) else {
            return Ok(());
        };
        let slot = pooled.slot.write();
        match slot.as_ref() {
            Some(writer) => {
                writer.flush().map_err(|err| err.into_rejection(table))?;
                debug!(table, "batch writer flushed");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Flushes and releases the table's writer. When the final flush fails
    /// the writer stays pooled with its buffer, so the close can be retried.
    pub fn close(&self, table: &str) -> Result<()> {
        let Some(pooled) = self.get(table) else {
            return Ok(());
        };
        let mut slot = pooled.slot.write();
        if let Some(writer) = slot.as_ref() {
            writer.close().map_err(|err| err.into_rejection(table))?;
            *slot = None;
            debug!(table, "batch writer closed");
        }
        self.remove_entry(table, &pooled);
        Ok(())
    }

    /// Releases the table's writer without flushing. Returns the buffered
    /// bytes that were lost.
    fn discard(&self, table: &str) -> u64 {
        let Some(pooled) = self.get(table) else {
            return 0;
        };
        let mut slot = pooled.slot.write();
        let lost = slot.take().map_or(0, |writer| writer.buffered_bytes());
        self.remove_entry(table, &pooled);
        lost
    }

    /// Closes every pooled writer, continuing past failures. A writer that
    /// cannot be closed is released anyway and its buffered mutations are
    /// lost. Returns the first failure.
    pub fn close_all(&self) -> Result<()> {
        let mut first_error = None;
        for table in self.tables() {
            if let Err(err) = self.close(&table) {
                let lost_bytes = self.discard(&table);
                warn!(
                    table = %table,
                    error = %err,
                    lost_bytes,
                    "failed to close batch writer; buffered mutations dropped"
                );
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.stripe(table).lock().contains_key(table)
    }

    pub fn len(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pooled table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self
            .stripes
            .iter()
            .flat_map(|s| s.lock().keys().cloned().collect::<Vec<_>>())
            .collect();
        tables.sort();
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorCode;
    use crate::mutation::CellOptions;
    use crate::permission::Authorizations;
    use crate::scan::filter::ScanFilter;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::{ConnectTarget, StoreBackend, TableOptions};
    use std::thread;

    fn pool_with(backend: &MemoryBackend, tables: &[&str]) -> (Arc<dyn BackendConnection>, WriterPool) {
        let conn = backend
            .connect(&ConnectTarget::embedded("pool"))
            .expect("connect");
        for table in tables {
            conn.create_table(table, TableOptions::default())
                .expect("create");
        }
        let pool = WriterPool::new(Arc::clone(&conn), Arc::new(Config::default()));
        (conn, pool)
    }

    fn count(conn: &Arc<dyn BackendConnection>, table: &str) -> usize {
        let mut scan = conn
            .open_scanner(table, &Authorizations::empty(), &ScanFilter::default(), 100)
            .expect("scan");
        let mut total = 0;
        loop {
            let batch = scan.next_batch().expect("batch");
            if batch.is_empty() {
                return total;
            }
            total += batch.len();
        }
    }

    fn cell(row: &str) -> Mutation {
        Mutation::single(row, "f", "q", CellOptions::at(1), "v")
    }

    #[test]
    fn empty_mutation_is_rejected_without_creating_a_writer() {
        let backend = MemoryBackend::new();
        let (_conn, pool) = pool_with(&backend, &["t"]);
        let err = pool.submit("t", Mutation::new("r")).expect_err("empty");
        assert_eq!(err.code(), StoreErrorCode::MutationRejected);
        assert!(pool.is_empty());
    }

    #[test]
    fn submit_to_missing_table_is_rejected() {
        let backend = MemoryBackend::new();
        let (_conn, pool) = pool_with(&backend, &[]);
        let err = pool.submit("nope", cell("r")).expect_err("missing");
        assert_eq!(err.code(), StoreErrorCode::MutationRejected);
        assert!(err.to_string().contains("nope"));
        assert!(!pool.contains("nope"));
    }

    #[test]
    fn flush_and_close_without_writer_are_noops() {
        let backend = MemoryBackend::new();
        let (_conn, pool) = pool_with(&backend, &["t"]);
        pool.flush("t").expect("flush");
        pool.close("t").expect("close");
        pool.close_all().expect("close_all");
    }

    #[test]
    fn close_releases_and_next_submit_recreates() {
        let backend = MemoryBackend::new();
        let (conn, pool) = pool_with(&backend, &["t"]);
        pool.submit("t", cell("a")).expect("submit");
        assert!(pool.contains("t"));
        pool.close("t").expect("close");
        assert!(!pool.contains("t"));
        assert_eq!(count(&conn, "t"), 1);

        pool.submit("t", cell("b")).expect("submit after close");
        assert_eq!(pool.len(), 1);
        pool.flush("t").expect("flush");
        assert_eq!(count(&conn, "t"), 2);
    }

    #[test]
    fn concurrent_first_submits_share_one_writer() {
        let backend = MemoryBackend::new();
        let (conn, pool) = pool_with(&backend, &["t"]);
        let pool = Arc::new(pool);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for j in 0..25 {
                        pool.submit("t", cell(&format!("{i:02}-{j:02}")))
                            .expect("submit");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(pool.tables(), vec!["t".to_string()]);
        pool.close_all().expect("close_all");
        assert_eq!(count(&conn, "t"), 200);
    }

    #[test]
    fn close_all_attempts_every_writer() {
        let backend = MemoryBackend::new();
        let (conn, pool) = pool_with(&backend, &["a", "b", "c"]);
        for table in ["a", "b", "c"] {
            pool.submit(table, cell("r")).expect("submit");
        }
        assert_eq!(pool.len(), 3);

        backend.set_available(false);
        let err = pool.close_all().expect_err("offline");
        assert_eq!(err.code(), StoreErrorCode::BackendUnavailable);
        assert!(pool.is_empty(), "every entry released");

        backend.set_available(true);
        pool.submit("a", cell("again")).expect("fresh writer after drain");
        pool.close("a").expect("close");
        assert_eq!(count(&conn, "a"), 1);
    }

    #[test]
    fn failed_close_keeps_writer_for_retry() {
        let backend = MemoryBackend::new();
        let (conn, pool) = pool_with(&backend, &["t"]);
        pool.submit("t", cell("r")).expect("submit");

        backend.set_available(false);
        let err = pool.close("t").expect_err("offline");
        assert_eq!(err.code(), StoreErrorCode::BackendUnavailable);
        assert!(pool.contains("t"), "writer stays pooled");

        backend.set_available(true);
        pool.submit("t", cell("s")).expect("writer still accepts mutations");
        pool.close("t").expect("retry close");
        assert!(!pool.contains("t"));
        assert_eq!(count(&conn, "t"), 2);
    }

    #[test]
    fn invalid_threshold_is_not_wrapped() {
        let backend = MemoryBackend::new();
        let conn = backend
            .connect(&ConnectTarget::embedded("pool"))
            .expect("connect");
        conn.create_table("t", TableOptions::default())
            .expect("create");
        let config = Config::default().with(crate::config::BATCH_WRITER_MAX_MEMORY, "0");
        let pool = WriterPool::new(conn, Arc::new(config));
        let err = pool.submit("t", cell("r")).expect_err("zero threshold");
        assert_eq!(err.code(), StoreErrorCode::InvalidConfig);
    }
}
