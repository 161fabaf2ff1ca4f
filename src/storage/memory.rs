//! In-process store instances.
//!
//! Tables are `im::OrdMap`s keyed by [`CellKey`], so a scan snapshots its
//! table in O(1) and iterates without holding the table lock. Instances are
//! keyed by name and outlive individual connections: two sessions connected
//! to the same instance share its tables.

use crate::error::{ResourceType, Result, StoreError};
use crate::mutation::{Cell, CellKey, Mutation};
use crate::permission::{Authorizations, Credentials, SystemPermission, has_permission};
use crate::scan::filter::ScanFilter;
use crate::storage::{
    BackendConnection, BatchWriterHandle, ConnectTarget, ScanHandle, StoreBackend, TableOptions,
};
use im::OrdMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use zeroize::Zeroizing;

pub const ROOT_USER: &str = "root";

/// A principal registered on an instance.
#[derive(Debug, Clone)]
pub struct UserSpec {
    pub password: String,
    pub permissions: BTreeSet<SystemPermission>,
    pub authorizations: Authorizations,
}

impl UserSpec {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            permissions: BTreeSet::new(),
            authorizations: Authorizations::empty(),
        }
    }

    pub fn with_permission(mut self, permission: SystemPermission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn with_authorizations(mut self, authorizations: Authorizations) -> Self {
        self.authorizations = authorizations;
        self
    }
}

struct UserRecord {
    password: Zeroizing<String>,
    permissions: BTreeSet<SystemPermission>,
    /// `None` grants every token.
    authorizations: Option<Authorizations>,
}

impl UserRecord {
    fn root(password: &str) -> Self {
        Self {
            password: Zeroizing::new(password.to_string()),
            permissions: BTreeSet::from([SystemPermission::Admin]),
            authorizations: None,
        }
    }
}

struct MemoryTable {
    name: String,
    options: TableOptions,
    cells: RwLock<OrdMap<CellKey, Vec<u8>>>,
    dropped: AtomicBool,
}

impl MemoryTable {
    fn new(name: &str, options: TableOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            cells: RwLock::new(OrdMap::new()),
            dropped: AtomicBool::new(false),
        }
    }

    /// Applies whole mutations under one write lock; readers never observe a
    /// partially applied mutation.
    fn apply(&self, mutations: Vec<Mutation>) {
        let mut cells = self.cells.write();
        for mutation in mutations {
            for cell in mutation.into_cells() {
                insert_version(&mut cells, self.options.keep_all_versions, cell);
            }
        }
    }

    fn snapshot(&self) -> OrdMap<CellKey, Vec<u8>> {
        self.cells.read().clone()
    }
}

fn insert_version(cells: &mut OrdMap<CellKey, Vec<u8>>, keep_all_versions: bool, cell: Cell) {
    if !keep_all_versions {
        let newest_first = CellKey {
            timestamp: i64::MAX,
            ..cell.key.clone()
        };
        let existing: Vec<CellKey> = cells
            .range(newest_first..)
            .take_while(|(k, _)| k.same_column(&cell.key))
            .map(|(k, _)| k.clone())
            .collect();
        if existing
            .first()
            .is_some_and(|newest| newest.timestamp > cell.key.timestamp)
        {
            return;
        }
        for key in existing {
            cells.remove(&key);
        }
    }
    cells.insert(cell.key, cell.value);
}

struct MemoryInstance {
    name: String,
    users: RwLock<HashMap<String, UserRecord>>,
    tables: RwLock<HashMap<String, Arc<MemoryTable>>>,
}

impl MemoryInstance {
    fn new(name: &str) -> Self {
        let mut users = HashMap::new();
        users.insert(ROOT_USER.to_string(), UserRecord::root(""));
        Self {
            name: name.to_string(),
            users: RwLock::new(users),
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, table: &str) -> Result<Arc<MemoryTable>> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .ok_or_else(|| StoreError::table_not_found(table))
    }
}

/// Embedded backend holding any number of named instances in memory.
pub struct MemoryBackend {
    instances: Mutex<HashMap<String, Arc<MemoryInstance>>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    fn instance(&self, name: &str) -> Arc<MemoryInstance> {
        let mut instances = self.instances.lock();
        Arc::clone(
            instances
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(MemoryInstance::new(name))),
        )
    }

    /// Registers `user` on `instance`, creating the instance if needed.
    pub fn add_user(&self, instance: &str, user: &str, spec: UserSpec) -> Result<()> {
        let instance = self.instance(instance);
        let mut users = instance.users.write();
        if users.contains_key(user) {
            return Err(StoreError::AlreadyExists {
                resource_type: ResourceType::User,
                resource_id: user.to_string(),
            });
        }
        users.insert(
            user.to_string(),
            UserRecord {
                password: Zeroizing::new(spec.password),
                permissions: spec.permissions,
                authorizations: Some(spec.authorizations),
            },
        );
        Ok(())
    }

    /// Unregisters `user`. Connections already logged in as `user` keep
    /// working but lose every system permission and authorization.
    pub fn remove_user(&self, instance: &str, user: &str) -> Result<()> {
        let instance = self.instance(instance);
        instance
            .users
            .write()
            .remove(user)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                resource_type: ResourceType::User,
                resource_id: user.to_string(),
            })
    }

    pub fn set_root_password(&self, instance: &str, password: &str) {
        let instance = self.instance(instance);
        instance
            .users
            .write()
            .insert(ROOT_USER.to_string(), UserRecord::root(password));
    }

    /// Simulates losing (or regaining) the store. While unavailable every
    /// call fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn check_available(&self) -> Result<()> {
        check_available(&self.available)
    }

    fn login(
        &self,
        instance: Arc<MemoryInstance>,
        credentials: &Credentials,
    ) -> Result<Arc<dyn BackendConnection>> {
        let users = instance.users.read();
        let authenticated = users
            .get(&credentials.user)
            .is_some_and(|record| record.password.as_str() == credentials.password());
        if !authenticated {
            return Err(StoreError::Connection {
                message: format!(
                    "authentication failed for user '{}' on instance '{}'",
                    credentials.user, instance.name
                ),
            });
        }
        drop(users);
        Ok(Arc::new(MemoryConnection {
            instance,
            principal: credentials.user.clone(),
            available: Arc::clone(&self.available),
            closed: AtomicBool::new(false),
        }))
    }
}

impl StoreBackend for MemoryBackend {
    fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn BackendConnection>> {
        self.check_available()?;
        match target {
            ConnectTarget::Embedded { instance } => {
                let instance = self.instance(instance);
                let root = instance
                    .users
                    .read()
                    .get(ROOT_USER)
                    .map(|r| r.password.to_string())
                    .unwrap_or_default();
                self.login(instance, &Credentials::new(ROOT_USER, root))
            }
            ConnectTarget::Cluster {
                instance,
                endpoints,
                credentials,
            } => {
                if endpoints.is_empty() {
                    return Err(StoreError::Connection {
                        message: format!("no endpoints given for instance '{instance}'"),
                    });
                }
                let known = self.instances.lock().get(instance).cloned();
                let Some(known) = known else {
                    return Err(StoreError::Connection {
                        message: format!("instance '{instance}' not found"),
                    });
                };
                self.login(known, credentials)
            }
        }
    }
}

fn check_available(flag: &AtomicBool) -> Result<()> {
    if flag.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(StoreError::Unavailable {
            message: "in-memory store is offline".into(),
        })
    }
}

struct MemoryConnection {
    instance: Arc<MemoryInstance>,
    principal: String,
    available: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::NotConnected);
        }
        check_available(&self.available)
    }

    fn require(&self, permission: SystemPermission) -> Result<()> {
        let users = self.instance.users.read();
        let granted = users
            .get(&self.principal)
            .is_some_and(|record| has_permission(&record.permissions, permission));
        if granted {
            Ok(())
        } else {
            Err(StoreError::Authorization {
                message: format!("user '{}' lacks {permission}", self.principal),
            })
        }
    }
}

impl BackendConnection for MemoryConnection {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn create_table(&self, table: &str, options: TableOptions) -> Result<()> {
        self.check_open()?;
        self.require(SystemPermission::CreateTable)?;
        let mut tables = self.instance.tables.write();
        if tables.contains_key(table) {
            return Err(StoreError::table_exists(table));
        }
        tables.insert(
            table.to_string(),
            Arc::new(MemoryTable::new(table, options)),
        );
        Ok(())
    }

    fn delete_table(&self, table: &str) -> Result<()> {
        self.check_open()?;
        self.require(SystemPermission::DropTable)?;
        let removed = self
            .instance
            .tables
            .write()
            .remove(table)
            .ok_or_else(|| StoreError::table_not_found(table))?;
        removed.dropped.store(true, Ordering::Release);
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.instance.tables.read().contains_key(table))
    }

    fn list_tables(&self) -> Result<Vec<String>> {
        self.check_open()?;
        let mut names: Vec<String> = self.instance.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn granted_authorizations(&self) -> Result<Option<Authorizations>> {
        self.check_open()?;
        Ok(self
            .instance
            .users
            .read()
            .get(&self.principal)
            .and_then(|record| record.authorizations.clone()))
    }

    fn open_batch_writer(
        &self,
        table: &str,
        max_buffered_bytes: u64,
    ) -> Result<Box<dyn BatchWriterHandle>> {
        self.check_open()?;
        let table = self.instance.table(table)?;
        Ok(Box::new(MemoryBatchWriter {
            table,
            max_buffered_bytes,
            available: Arc::clone(&self.available),
            buffer: Mutex::new(WriteBuffer::default()),
        }))
    }

    fn open_scanner(
        &self,
        table: &str,
        authorizations: &Authorizations,
        filter: &ScanFilter,
        batch_size: usize,
    ) -> Result<Box<dyn ScanHandle>> {
        self.check_open()?;
        if let Some(granted) = self.granted_authorizations()? {
            let missing = authorizations.missing_from(&granted);
            if !missing.is_empty() {
                return Err(StoreError::Authorization {
                    message: format!(
                        "user '{}' does not hold authorizations [{}]",
                        self.principal,
                        missing.join(",")
                    ),
                });
            }
        }
        let table = self.instance.table(table)?;
        Ok(Box::new(MemoryScan {
            snapshot: table.snapshot(),
            position: filter.range.start_key(),
            filter: filter.clone(),
            authorizations: authorizations.clone(),
            batch_size: batch_size.max(1),
            available: Arc::clone(&self.available),
            done: false,
        }))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct WriteBuffer {
    pending: Vec<Mutation>,
    bytes: u64,
    closed: bool,
}

struct MemoryBatchWriter {
    table: Arc<MemoryTable>,
    max_buffered_bytes: u64,
    available: Arc<AtomicBool>,
    buffer: Mutex<WriteBuffer>,
}

impl MemoryBatchWriter {
    fn rejected(&self, message: impl Into<String>) -> StoreError {
        StoreError::MutationRejected {
            table: self.table.name.clone(),
            message: message.into(),
        }
    }

    fn flush_locked(&self, buffer: &mut WriteBuffer) -> Result<()> {
        if buffer.pending.is_empty() {
            return Ok(());
        }
        check_available(&self.available)?;
        let pending = std::mem::take(&mut buffer.pending);
        let count = pending.len();
        buffer.bytes = 0;
        if self.table.dropped.load(Ordering::Acquire) {
            return Err(self.rejected(format!(
                "{count} mutation(s) dropped: table '{}' no longer exists",
                self.table.name
            )));
        }
        self.table.apply(pending);
        debug!(table = %self.table.name, mutations = count, "applied buffered mutations");
        Ok(())
    }
}

impl BatchWriterHandle for MemoryBatchWriter {
    fn append(&self, mutation: Mutation) -> Result<()> {
        if mutation.is_empty() {
            return Err(self.rejected("mutation has no column updates"));
        }
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return Err(self.rejected("batch writer is closed"));
        }
        buffer.bytes += mutation.estimated_size() as u64;
        buffer.pending.push(mutation);
        if buffer.bytes >= self.max_buffered_bytes {
            self.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        self.flush_locked(&mut buffer)
    }

    fn close(&self) -> Result<()> {
        let mut buffer = self.buffer.lock();
        if buffer.closed {
            return Ok(());
        }
        self.flush_locked(&mut buffer)?;
        buffer.closed = true;
        Ok(())
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffer.lock().bytes
    }
}

struct MemoryScan {
    snapshot: OrdMap<CellKey, Vec<u8>>,
    position: Bound<CellKey>,
    filter: ScanFilter,
    authorizations: Authorizations,
    batch_size: usize,
    available: Arc<AtomicBool>,
    done: bool,
}

impl ScanHandle for MemoryScan {
    fn next_batch(&mut self) -> Result<Vec<Cell>> {
        if self.done {
            return Ok(Vec::new());
        }
        check_available(&self.available)?;
        let mut batch = Vec::new();
        let mut last_seen = None;
        let mut exhausted = true;
        for (key, value) in self
            .snapshot
            .range((self.position.clone(), Bound::Unbounded))
        {
            if self.filter.range.is_past_end(&key.row) {
                break;
            }
            last_seen = Some(key);
            if !self.filter.matches(key) || !key.visibility.evaluate(&self.authorizations) {
                continue;
            }
            batch.push(Cell {
                key: key.clone(),
                value: value.clone(),
            });
            if batch.len() >= self.batch_size {
                exhausted = false;
                break;
            }
        }
        if let Some(key) = last_seen {
            self.position = Bound::Excluded(key.clone());
        }
        self.done = exhausted;
        Ok(batch)
    }

    fn close(&mut self) {
        self.done = true;
        self.snapshot = OrdMap::new();
    }
}
