//! Per-identity embedding slots
//!
//! An identity keeps at most `capacity` reference embeddings (5 by default).
//! Slots are addressed externally with 1-based indices, new embeddings go
//! into the lowest free slot, and clearing a slot makes it available again.
//!
//! ```text
//! capacity = 5
//! ┌───┬───┬───┬───┬───┐
//! │ 1 │ 2 │ · │ 4 │ · │   add() → slot 3, then slot 5, then SlotError::Full
//! └───┴───┴───┴───┴───┘
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::math::is_finite_vector;

/// Default number of embedding slots per identity
pub const DEFAULT_SLOT_CAPACITY: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlotError {
    #[error("All {capacity} embedding slots are occupied")]
    Full { capacity: usize },

    #[error("Slot index {index} out of range 1..={capacity}")]
    OutOfRange { index: usize, capacity: usize },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding is empty")]
    EmptyVector,

    #[error("Embedding contains non-finite values")]
    NonFinite,

    #[error("Slot {0} is already occupied")]
    Occupied(usize),
}

/// 1-based slot address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotIndex(usize);

impl SlotIndex {
    /// Validate a 1-based index against a slot capacity
    pub fn new(index: usize, capacity: usize) -> Result<Self, SlotError> {
        if index == 0 || index > capacity {
            return Err(SlotError::OutOfRange { index, capacity });
        }
        Ok(Self(index))
    }

    pub fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One occupied slot
#[derive(Debug, Clone, PartialEq)]
pub struct SlotEntry {
    pub slot: SlotIndex,
    pub vector: Vec<f32>,
    /// Where the embedding came from, e.g. the stored enrollment photo
    pub provenance: Option<String>,
}

/// Bounded, slot-ordered collection of reference embeddings
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSlots {
    capacity: usize,
    /// Kept sorted by `slot`
    entries: Vec<SlotEntry>,
}

impl Default for EmbeddingSlots {
    fn default() -> Self {
        Self::new(DEFAULT_SLOT_CAPACITY)
    }
}

impl EmbeddingSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Rebuild a collection from persisted entries
    ///
    /// Entries may come in any order; duplicates, out-of-range slots and
    /// mixed dimensions are rejected.
    pub fn from_entries(capacity: usize, entries: Vec<SlotEntry>) -> Result<Self, SlotError> {
        let mut slots = Self::new(capacity);
        for entry in entries {
            SlotIndex::new(entry.slot.get(), capacity)?;
            slots.validate_vector(&entry.vector)?;
            let pos = match slots.entries.binary_search_by_key(&entry.slot, |e| e.slot) {
                Ok(_) => return Err(SlotError::Occupied(entry.slot.get())),
                Err(pos) => pos,
            };
            slots.entries.insert(pos, entry);
        }
        Ok(slots)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Dimensionality shared by all stored embeddings, if any are stored
    pub fn dim(&self) -> Option<usize> {
        self.entries.first().map(|e| e.vector.len())
    }

    /// Occupied slots in ascending slot order
    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    pub fn get(&self, slot: SlotIndex) -> Option<&SlotEntry> {
        self.entries
            .binary_search_by_key(&slot, |e| e.slot)
            .ok()
            .map(|pos| &self.entries[pos])
    }

    /// All stored vectors in slot order
    pub fn all_vectors(&self) -> Vec<&[f32]> {
        self.entries.iter().map(|e| e.vector.as_slice()).collect()
    }

    /// Lowest unoccupied slot, if any
    pub fn first_free(&self) -> Option<SlotIndex> {
        // Entries are sorted, so the first gap in 1, 2, 3, ... is the answer
        let mut expected = 1;
        for entry in &self.entries {
            if entry.slot.get() != expected {
                break;
            }
            expected += 1;
        }
        (expected <= self.capacity).then_some(SlotIndex(expected))
    }

    /// Store an embedding in the first free slot
    ///
    /// Fails with `SlotError::Full` when every slot is taken; the collection
    /// is left untouched on any error.
    pub fn add(
        &mut self,
        vector: Vec<f32>,
        provenance: Option<String>,
    ) -> Result<SlotIndex, SlotError> {
        let slot = self.first_free().ok_or(SlotError::Full {
            capacity: self.capacity,
        })?;
        self.validate_vector(&vector)?;

        let pos = self
            .entries
            .binary_search_by_key(&slot, |e| e.slot)
            .unwrap_or_else(|pos| pos);
        self.entries.insert(
            pos,
            SlotEntry {
                slot,
                vector,
                provenance: provenance.filter(|p| !p.is_empty()),
            },
        );
        Ok(slot)
    }

    /// Clear the slot at a 1-based index
    ///
    /// Returns the removed entry, or `None` when the slot was already vacant.
    pub fn remove(&mut self, index: usize) -> Result<Option<SlotEntry>, SlotError> {
        let slot = SlotIndex::new(index, self.capacity)?;
        Ok(self
            .entries
            .binary_search_by_key(&slot, |e| e.slot)
            .ok()
            .map(|pos| self.entries.remove(pos)))
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<(), SlotError> {
        if vector.is_empty() {
            return Err(SlotError::EmptyVector);
        }
        if !is_finite_vector(vector) {
            return Err(SlotError::NonFinite);
        }
        if let Some(expected) = self.dim() {
            if expected != vector.len() {
                return Err(SlotError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; 3];
        v[i % 3] = 1.0;
        v
    }

    #[test]
    fn test_add_fills_slots_in_order() {
        let mut slots = EmbeddingSlots::default();
        for expected in 1..=5 {
            let slot = slots.add(unit(expected), None).unwrap();
            assert_eq!(slot.get(), expected);
        }
        assert_eq!(slots.count(), 5);
        assert!(slots.is_full());
    }

    #[test]
    fn test_sixth_add_fails_without_mutation() {
        let mut slots = EmbeddingSlots::default();
        for i in 0..5 {
            slots.add(unit(i), Some(format!("img-{i}.jpg"))).unwrap();
        }
        let before = slots.clone();

        let result = slots.add(unit(0), Some("extra.jpg".into()));

        assert_eq!(result, Err(SlotError::Full { capacity: 5 }));
        assert_eq!(slots, before);
    }

    #[test]
    fn test_remove_frees_slot_for_reuse() {
        let mut slots = EmbeddingSlots::default();
        for i in 0..3 {
            slots.add(unit(i), None).unwrap();
        }

        let removed = slots.remove(3).unwrap().unwrap();
        assert_eq!(removed.slot.get(), 3);
        assert_eq!(slots.count(), 2);

        let reused = slots.add(unit(2), None).unwrap();
        assert_eq!(reused.get(), 3);
    }

    #[test]
    fn test_remove_middle_slot_then_add_fills_gap() {
        let mut slots = EmbeddingSlots::default();
        for i in 0..4 {
            slots.add(unit(i), None).unwrap();
        }
        slots.remove(2).unwrap();

        assert_eq!(slots.first_free().map(SlotIndex::get), Some(2));
        assert_eq!(slots.add(unit(1), None).unwrap().get(), 2);
        assert_eq!(slots.add(unit(1), None).unwrap().get(), 5);
    }

    #[test]
    fn test_remove_out_of_range() {
        let mut slots = EmbeddingSlots::default();
        assert_eq!(
            slots.remove(0),
            Err(SlotError::OutOfRange {
                index: 0,
                capacity: 5
            })
        );
        assert!(matches!(slots.remove(6), Err(SlotError::OutOfRange { .. })));
    }

    #[test]
    fn test_remove_vacant_slot_is_noop() {
        let mut slots = EmbeddingSlots::default();
        slots.add(unit(0), None).unwrap();
        assert_eq!(slots.remove(4).unwrap(), None);
        assert_eq!(slots.count(), 1);
    }

    #[test]
    fn test_provenance_follows_slot() {
        let mut slots = EmbeddingSlots::default();
        slots.add(unit(0), Some("a.jpg".into())).unwrap();
        slots.add(unit(1), None).unwrap();
        slots.add(unit(2), Some("c.jpg".into())).unwrap();
        slots.remove(1).unwrap();
        slots.add(unit(0), Some("d.jpg".into())).unwrap();

        let by_slot: Vec<_> = slots
            .entries()
            .iter()
            .map(|e| (e.slot.get(), e.provenance.clone()))
            .collect();
        assert_eq!(
            by_slot,
            vec![
                (1, Some("d.jpg".to_string())),
                (2, None),
                (3, Some("c.jpg".to_string())),
            ]
        );
    }

    #[test]
    fn test_all_vectors_in_slot_order() {
        let mut slots = EmbeddingSlots::default();
        assert!(slots.all_vectors().is_empty());

        slots.add(vec![1.0, 0.0], None).unwrap();
        slots.add(vec![2.0, 0.0], None).unwrap();
        slots.add(vec![3.0, 0.0], None).unwrap();
        slots.remove(1).unwrap();
        slots.add(vec![4.0, 0.0], None).unwrap();

        let firsts: Vec<f32> = slots.all_vectors().iter().map(|v| v[0]).collect();
        assert_eq!(firsts, vec![4.0, 2.0, 3.0]);
    }

    #[test]
    fn test_dimension_must_match() {
        let mut slots = EmbeddingSlots::default();
        slots.add(vec![1.0, 0.0, 0.0], None).unwrap();
        assert_eq!(
            slots.add(vec![1.0, 0.0], None),
            Err(SlotError::DimensionMismatch {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(slots.count(), 1);
    }

    #[test]
    fn test_rejects_empty_and_non_finite() {
        let mut slots = EmbeddingSlots::default();
        assert_eq!(slots.add(vec![], None), Err(SlotError::EmptyVector));
        assert_eq!(slots.add(vec![f32::NAN], None), Err(SlotError::NonFinite));
        assert!(slots.is_empty());
    }

    #[test]
    fn test_custom_capacity() {
        let mut slots = EmbeddingSlots::new(2);
        slots.add(unit(0), None).unwrap();
        slots.add(unit(1), None).unwrap();
        assert_eq!(slots.add(unit(2), None), Err(SlotError::Full { capacity: 2 }));
        assert!(matches!(slots.remove(3), Err(SlotError::OutOfRange { .. })));
    }

    #[test]
    fn test_from_entries_sorts_and_validates() {
        let entries = vec![
            SlotEntry {
                slot: SlotIndex::new(4, 5).unwrap(),
                vector: vec![0.0, 1.0],
                provenance: None,
            },
            SlotEntry {
                slot: SlotIndex::new(2, 5).unwrap(),
                vector: vec![1.0, 0.0],
                provenance: Some("p.jpg".into()),
            },
        ];
        let slots = EmbeddingSlots::from_entries(5, entries).unwrap();
        let order: Vec<usize> = slots.entries().iter().map(|e| e.slot.get()).collect();
        assert_eq!(order, vec![2, 4]);
        assert_eq!(slots.first_free().map(SlotIndex::get), Some(1));

        let dup = vec![
            SlotEntry {
                slot: SlotIndex::new(1, 5).unwrap(),
                vector: vec![1.0],
                provenance: None,
            },
            SlotEntry {
                slot: SlotIndex::new(1, 5).unwrap(),
                vector: vec![2.0],
                provenance: None,
            },
        ];
        assert_eq!(
            EmbeddingSlots::from_entries(5, dup),
            Err(SlotError::Occupied(1))
        );
    }
}
