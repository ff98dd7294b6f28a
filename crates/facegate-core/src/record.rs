//! Identity records
//!
//! An identity is an employee: descriptive fields, a QR token, an active flag
//! and the embedding slots used for face matching. `version` belongs to the
//! persistence layer and is bumped on every committed write.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::slots::{EmbeddingSlots, DEFAULT_SLOT_CAPACITY};

pub type IdentityId = u64;

/// Fields supplied when registering an identity
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdentity {
    pub name: String,
    pub position: String,
    pub department: String,
    pub slot_capacity: usize,
}

impl NewIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: String::new(),
            department: String::new(),
            slot_capacity: DEFAULT_SLOT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
    pub position: String,
    pub department: String,
    pub qr_token: String,
    pub active: bool,
    /// Unix seconds
    pub created_at: i64,
    pub version: u64,
    pub slots: EmbeddingSlots,
}

impl IdentityRecord {
    pub fn from_new(id: IdentityId, qr_token: String, new: NewIdentity) -> Self {
        Self {
            id,
            name: new.name,
            position: new.position,
            department: new.department,
            qr_token,
            active: true,
            created_at: now_unix_ts(),
            version: 0,
            slots: EmbeddingSlots::new(new.slot_capacity),
        }
    }
}

pub fn now_unix_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
