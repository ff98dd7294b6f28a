//! Identity persistence
//!
//! # Concurrency Model
//!
//! Writers follow a read-modify-write cycle against a private copy of the
//! record and commit it with [`IdentityStore::save`], which is a
//! compare-and-swap on `version`. Of two writers that read the same version
//! only the first commit wins; the second gets `StoreError::Conflict` and the
//! stored record is left exactly as the winner wrote it.
//!
//! [`update_identity`] wraps that cycle and retries a bounded number of
//! times, so two concurrent enrollments both land in distinct slots when
//! there is room, and the loser observes `SlotError::Full` when there is not.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use thiserror::Error;

use crate::qr::generate_token;
use crate::record::{IdentityId, IdentityRecord, NewIdentity};

/// Default number of times a conflicting write is retried
pub const DEFAULT_CONFLICT_RETRIES: usize = 3;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Identity {0} not found")]
    NotFound(IdentityId),

    #[error("Write conflict on identity {id}: expected version {expected}, found {found}")]
    Conflict {
        id: IdentityId,
        expected: u64,
        found: u64,
    },

    #[error("QR token already assigned to identity {0}")]
    DuplicateToken(IdentityId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Durable home of identity records
pub trait IdentityStore: Send + Sync {
    /// Register a new identity with a fresh id and QR token
    fn create(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError>;

    fn get(&self, id: IdentityId) -> Result<Option<IdentityRecord>, StoreError>;

    fn find_by_qr_token(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError>;

    /// All identities, active or not, in id order
    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    /// Commit a modified copy of a record
    ///
    /// Succeeds only if the stored version still equals `record.version`, and
    /// returns the new version. On any error nothing is written.
    fn save(&self, record: &IdentityRecord) -> Result<u64, StoreError>;
}

/// Read-modify-write one identity with optimistic retries
///
/// `mutate` runs against a fresh copy on each attempt. If it fails the copy is
/// discarded and nothing is committed. Returns the closure's value together
/// with the committed record.
pub fn update_identity<T, E, F>(
    store: &dyn IdentityStore,
    id: IdentityId,
    retries: usize,
    mut mutate: F,
) -> Result<(T, IdentityRecord), E>
where
    F: FnMut(&mut IdentityRecord) -> Result<T, E>,
    E: From<StoreError>,
{
    let mut attempt = 0;
    loop {
        let mut record = store.get(id)?.ok_or(StoreError::NotFound(id))?;
        let value = mutate(&mut record)?;
        match store.save(&record) {
            Ok(version) => {
                record.version = version;
                return Ok((value, record));
            }
            Err(StoreError::Conflict { .. }) if attempt < retries => {
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Versioned table of records shared by the store implementations
///
/// Pure data: callers supply the locking and, for durable stores, the
/// persistence of a table once a change has been applied to it.
#[derive(Debug, Clone, Default)]
pub struct IdentityTable {
    records: BTreeMap<IdentityId, IdentityRecord>,
    next_id: IdentityId,
}

impl IdentityTable {
    pub fn from_records(records: Vec<IdentityRecord>) -> Self {
        let next_id = records.iter().map(|r| r.id).max().unwrap_or(0);
        Self {
            records: records.into_iter().map(|r| (r.id, r)).collect(),
            next_id,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: IdentityId) -> Option<&IdentityRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }

    pub fn find_by_qr_token(&self, token: &str) -> Option<&IdentityRecord> {
        self.records.values().find(|r| r.qr_token == token)
    }

    pub fn insert_new(&mut self, new: NewIdentity) -> IdentityRecord {
        self.next_id += 1;
        let id = self.next_id;
        let mut token = generate_token(id);
        while self.find_by_qr_token(&token).is_some() {
            token = generate_token(id);
        }
        let mut record = IdentityRecord::from_new(id, token, new);
        record.version = 1;
        self.records.insert(id, record.clone());
        record
    }

    pub fn commit(&mut self, record: &IdentityRecord) -> Result<u64, StoreError> {
        let current = self
            .records
            .get(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        if current.version != record.version {
            return Err(StoreError::Conflict {
                id: record.id,
                expected: record.version,
                found: current.version,
            });
        }
        if let Some(owner) = self
            .records
            .values()
            .find(|r| r.id != record.id && r.qr_token == record.qr_token)
        {
            return Err(StoreError::DuplicateToken(owner.id));
        }

        let mut stored = record.clone();
        stored.version = record.version + 1;
        let version = stored.version;
        self.records.insert(stored.id, stored);
        Ok(version)
    }
}

/// In-process store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    table: RwLock<IdentityTable>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn create(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError> {
        Ok(self.table.write().insert_new(new))
    }

    fn get(&self, id: IdentityId) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.table.read().get(id).cloned())
    }

    fn find_by_qr_token(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.table.read().find_by_qr_token(token).cloned())
    }

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Ok(self.table.read().records().cloned().collect())
    }

    fn save(&self, record: &IdentityRecord) -> Result<u64, StoreError> {
        self.table.write().commit(record)
    }
}
