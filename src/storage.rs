//! Durable identity store backed by a single JSON document
//!
//! Every committed write rewrites `identities.json` through a temp file,
//! fsync and rename. Several handles (in one process or in several, e.g. a
//! running server next to a CLI enrollment) may share a data dir: commits
//! hold an exclusive advisory lock on `identities.lock` and check the
//! record version against the document on disk, not against a cached copy.
//! Reads take the shared lock and reload the document when it changed.
//! A failed write leaves the document at its previous state.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use facegate_core::codec;
use facegate_core::{
    EmbeddingSlots, IdentityId, IdentityRecord, IdentityStore, IdentityTable, NewIdentity,
    SlotEntry, StoreError,
};

pub const IDENTITIES_FILE: &str = "identities.json";
pub const LOCK_FILE: &str = "identities.lock";
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IdentityDocument {
    schema: u32,
    identities: Vec<StoredIdentity>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredIdentity {
    id: IdentityId,
    name: String,
    #[serde(default)]
    position: String,
    #[serde(default)]
    department: String,
    qr_token: String,
    active: bool,
    created_at: i64,
    version: u64,
    slot_capacity: usize,
    #[serde(default)]
    faces: Vec<StoredFace>,
}

/// One occupied slot; `embedding` is the hex of the little-endian f32 bytes
#[derive(Debug, Serialize, Deserialize)]
struct StoredFace {
    slot: usize,
    embedding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    provenance: Option<String>,
}

impl From<&IdentityRecord> for StoredIdentity {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            position: record.position.clone(),
            department: record.department.clone(),
            qr_token: record.qr_token.clone(),
            active: record.active,
            created_at: record.created_at,
            version: record.version,
            slot_capacity: record.slots.capacity(),
            faces: record
                .slots
                .entries()
                .iter()
                .map(|entry| StoredFace {
                    slot: entry.slot.get(),
                    embedding: codec::encode_hex(&entry.vector),
                    provenance: entry.provenance.clone(),
                })
                .collect(),
        }
    }
}

impl StoredIdentity {
    fn into_record(self) -> Result<IdentityRecord> {
        let id = self.id;
        let mut entries = Vec::with_capacity(self.faces.len());
        for face in self.faces {
            let vector = codec::decode_hex(&face.embedding)
                .with_context(|| format!("decoding slot {} of identity {}", face.slot, id))?;
            let slot = facegate_core::SlotIndex::new(face.slot, self.slot_capacity)
                .with_context(|| format!("identity {} slot {}", id, face.slot))?;
            entries.push(SlotEntry {
                slot,
                vector,
                provenance: face.provenance,
            });
        }
        let slots = EmbeddingSlots::from_entries(self.slot_capacity, entries)
            .with_context(|| format!("rebuilding slots of identity {}", id))?;
        Ok(IdentityRecord {
            id,
            name: self.name,
            position: self.position,
            department: self.department,
            qr_token: self.qr_token,
            active: self.active,
            created_at: self.created_at,
            version: self.version,
            slots,
        })
    }
}

/// Identifies one on-disk revision of the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
    table: IdentityTable,
    stamp: Option<FileStamp>,
}

pub struct FileIdentityStore {
    path: PathBuf,
    lock_path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl FileIdentityStore {
    /// Open (or initialise) the store under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {:?}", data_dir))?;
        let store = Self {
            path: data_dir.join(IDENTITIES_FILE),
            lock_path: data_dir.join(LOCK_FILE),
            snapshot: Mutex::new(Snapshot::default()),
        };
        let count = {
            let mut snapshot = store.snapshot.lock();
            let _lock = store
                .lock_file(false)
                .with_context(|| format!("locking {:?}", store.lock_path))?;
            *snapshot = read_snapshot(&store.path)?;
            snapshot.table.len()
        };
        tracing::info!(
            "identity store opened path={:?} identities={}",
            store.path,
            count
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory lock on the data dir, released when the handle is dropped
    fn lock_file(&self, exclusive: bool) -> Result<File, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        if exclusive {
            FileExt::lock_exclusive(&file)?;
        } else {
            FileExt::lock_shared(&file)?;
        }
        Ok(file)
    }

    /// Run `read` against the current document under the shared lock
    fn read_through<T>(&self, read: impl FnOnce(&IdentityTable) -> T) -> Result<T, StoreError> {
        let mut snapshot = self.snapshot.lock();
        let _lock = self.lock_file(false)?;
        if file_stamp(&self.path)? != snapshot.stamp {
            *snapshot = read_snapshot(&self.path).map_err(storage_error)?;
        }
        Ok(read(&snapshot.table))
    }

    /// Apply `change` to the on-disk table under the exclusive lock
    ///
    /// The table is always re-read from disk first, so a version written by
    /// another handle is seen by the compare-and-swap in `commit`.
    fn write_through<T>(
        &self,
        change: impl FnOnce(&mut IdentityTable) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut snapshot = self.snapshot.lock();
        let _lock = self.lock_file(true)?;
        let current = read_snapshot(&self.path).map_err(storage_error)?;

        let mut next = current.table.clone();
        let outcome = change(&mut next).and_then(|value| {
            persist_table(&self.path, &next).map_err(|e| {
                tracing::error!("identity store write failed path={:?} err={:#}", self.path, e);
                storage_error(e)
            })?;
            Ok(value)
        });

        match outcome {
            Ok(value) => {
                *snapshot = Snapshot {
                    table: next,
                    stamp: file_stamp(&self.path)?,
                };
                Ok(value)
            }
            Err(e) => {
                *snapshot = current;
                Err(e)
            }
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn create(&self, new: NewIdentity) -> Result<IdentityRecord, StoreError> {
        self.write_through(|table| Ok(table.insert_new(new)))
    }

    fn get(&self, id: IdentityId) -> Result<Option<IdentityRecord>, StoreError> {
        self.read_through(|table| table.get(id).cloned())
    }

    fn find_by_qr_token(&self, token: &str) -> Result<Option<IdentityRecord>, StoreError> {
        self.read_through(|table| table.find_by_qr_token(token).cloned())
    }

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        self.read_through(|table| table.records().cloned().collect())
    }

    fn save(&self, record: &IdentityRecord) -> Result<u64, StoreError> {
        self.write_through(|table| table.commit(record))
    }
}

fn storage_error(e: anyhow::Error) -> StoreError {
    StoreError::Storage(format!("{:#}", e))
}

fn file_stamp(path: &Path) -> Result<Option<FileStamp>, StoreError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified()?,
            len: meta.len(),
        })),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let stamp = file_stamp(path)?;
    let table = match stamp {
        Some(_) => load_table(path)?,
        None => IdentityTable::default(),
    };
    Ok(Snapshot { table, stamp })
}

fn load_table(path: &Path) -> Result<IdentityTable> {
    let raw = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    let doc: IdentityDocument =
        serde_json::from_slice(&raw).with_context(|| format!("parsing {:?}", path))?;
    if doc.schema != SCHEMA_VERSION {
        anyhow::bail!(
            "unsupported identity schema {} in {:?} (expected {})",
            doc.schema,
            path,
            SCHEMA_VERSION
        );
    }
    let records = doc
        .identities
        .into_iter()
        .map(StoredIdentity::into_record)
        .collect::<Result<Vec<_>>>()?;
    Ok(IdentityTable::from_records(records))
}

fn persist_table(path: &Path, table: &IdentityTable) -> Result<()> {
    let doc = IdentityDocument {
        schema: SCHEMA_VERSION,
        identities: table.records().map(StoredIdentity::from).collect(),
    };
    let bytes = serde_json::to_vec_pretty(&doc)?;

    let tmp_path = path.with_extension("json.tmp");
    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .with_context(|| format!("opening {:?}", tmp_path))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {:?} -> {:?}", tmp_path, path))?;
        sync_parent(path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

fn sync_parent(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}
