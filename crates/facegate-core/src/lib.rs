//! facegate core – embedding slots, distance matching and identity persistence
//!
//! # Architecture
//!
//! ```text
//! image bytes ──▶ Extractor ──▶ query embedding
//!                                     │
//!                                     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Matcher (Euclidean · Cosine)                 │
//! │        min distance over all slots  ≤  threshold ?          │
//! ├─────────────────────────────────────────────────────────────┤
//! │        EmbeddingSlots (≤ 5 per identity, 1-based)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │     IdentityStore (versioned read-modify-write commits)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod extractor;
pub mod matcher;
pub mod math;
pub mod qr;
pub mod record;
pub mod slots;
pub mod store;

pub use extractor::{ExtractError, Extractor, FaceExtractor, StaticExtractor};
pub use matcher::{
    best_distance, matches, matches_image, MatchConfig, MatchError, MatchOutcome, Matcher, Metric,
    DEFAULT_THRESHOLD,
};
pub use record::{IdentityId, IdentityRecord, NewIdentity};
pub use slots::{EmbeddingSlots, SlotEntry, SlotError, SlotIndex, DEFAULT_SLOT_CAPACITY};
pub use store::{
    update_identity, IdentityStore, IdentityTable, MemoryIdentityStore, StoreError,
    DEFAULT_CONFLICT_RETRIES,
};
