//! Employee operations shared by the HTTP API and the CLI
//!
//! Every operation is synchronous; the API runs them on the blocking pool.
//! Writes go through [`update_identity`] so concurrent enrollments never
//! claim the same slot.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rand::RngCore;
use thiserror::Error;

use facegate_core::qr::generate_token;
use facegate_core::{
    update_identity, ExtractError, Extractor, IdentityId, IdentityRecord, IdentityStore,
    MatchError, MatchOutcome, Matcher, MemoryIdentityStore, Metric, NewIdentity, SlotEntry,
    SlotError, SlotIndex, StoreError,
};

use crate::config::ServiceConfig;
use crate::extractor::image_extension;
use crate::storage::FileIdentityStore;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Employee {0} not found")]
    NotFound(IdentityId),

    #[error("Unknown or inactive QR code")]
    UnknownQrCode,

    #[error("{0}")]
    Input(String),

    #[error("All {capacity} face slots are occupied")]
    Capacity { capacity: usize },

    #[error("Concurrent update: {0}")]
    Conflict(String),

    #[error("Face extractor is not configured")]
    ExtractorUnavailable,

    #[error("Face extraction failed: {0}")]
    Extractor(String),

    #[error("Storage failure: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            StoreError::Conflict { .. } | StoreError::DuplicateToken(_) => {
                ServiceError::Conflict(e.to_string())
            }
            StoreError::Io(_) | StoreError::Storage(_) => ServiceError::Storage(e.to_string()),
        }
    }
}

impl From<SlotError> for ServiceError {
    fn from(e: SlotError) -> Self {
        match e {
            SlotError::Full { capacity } => ServiceError::Capacity { capacity },
            other => ServiceError::Input(other.to_string()),
        }
    }
}

impl From<ExtractError> for ServiceError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::NotConfigured => ServiceError::ExtractorUnavailable,
            e if e.is_input_error() => ServiceError::Input(e.to_string()),
            e => ServiceError::Extractor(e.to_string()),
        }
    }
}

impl From<MatchError> for ServiceError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::ExtractorUnavailable => ServiceError::ExtractorUnavailable,
            MatchError::Extract(inner) => inner.into(),
            e if e.is_input_error() => ServiceError::Input(e.to_string()),
            e => ServiceError::Internal(e.to_string()),
        }
    }
}

/// Fields accepted when registering an employee
#[derive(Debug, Clone, Default)]
pub struct EmployeeDraft {
    pub name: String,
    pub position: String,
    pub department: String,
}

#[derive(Debug, Clone)]
pub struct Enrollment {
    pub slot: SlotIndex,
    pub employee: IdentityRecord,
}

#[derive(Debug, Clone)]
pub struct Removal {
    pub slot: usize,
    pub removed: Option<SlotEntry>,
    pub employee: IdentityRecord,
}

#[derive(Debug, Clone)]
pub struct Verification {
    pub employee: IdentityRecord,
    pub outcome: MatchOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSummary {
    pub employees: usize,
    pub active_employees: usize,
}

pub struct AppState {
    pub config: ServiceConfig,
    pub store: Arc<dyn IdentityStore>,
    pub extractor: Extractor,
    pub matcher: Matcher,
}

impl AppState {
    pub fn new(config: ServiceConfig, store: Arc<dyn IdentityStore>, extractor: Extractor) -> Self {
        let matcher = Matcher::new(config.matching);
        Self {
            config,
            store,
            extractor,
            matcher,
        }
    }

    /// Build state over the file store in `config.data_dir`, or memory without one
    pub fn open(config: ServiceConfig, extractor: Extractor) -> anyhow::Result<Self> {
        config.validate()?;
        let store: Arc<dyn IdentityStore> = match &config.data_dir {
            Some(dir) => Arc::new(FileIdentityStore::open(dir)?),
            None => {
                tracing::warn!("no data dir configured; identities are kept in memory only");
                Arc::new(MemoryIdentityStore::new())
            }
        };
        if let Some(dir) = &config.image_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating image dir {:?}", dir))?;
        }
        tracing::info!(
            "service ready extractor={:?} threshold={} metric={} slots={}",
            extractor,
            config.matching.threshold,
            config.matching.metric,
            config.slot_capacity
        );
        Ok(Self::new(config, store, extractor))
    }

    pub fn create_employee(&self, draft: EmployeeDraft) -> Result<IdentityRecord, ServiceError> {
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(ServiceError::Input("Name is required".into()));
        }
        let record = self.store.create(NewIdentity {
            name: name.to_string(),
            position: draft.position.trim().to_string(),
            department: draft.department.trim().to_string(),
            slot_capacity: self.config.slot_capacity,
        })?;
        tracing::info!(employee_id = record.id, "employee created");
        Ok(record)
    }

    pub fn list_employees(&self) -> Result<Vec<IdentityRecord>, ServiceError> {
        let mut employees = self.store.list()?;
        employees.retain(|r| r.active);
        Ok(employees)
    }

    pub fn get_employee(&self, id: IdentityId) -> Result<IdentityRecord, ServiceError> {
        match self.store.get(id)? {
            Some(record) if record.active => Ok(record),
            _ => Err(ServiceError::NotFound(id)),
        }
    }

    pub fn summary(&self) -> Result<StoreSummary, ServiceError> {
        let all = self.store.list()?;
        Ok(StoreSummary {
            employees: all.len(),
            active_employees: all.iter().filter(|r| r.active).count(),
        })
    }

    /// Soft delete: the record stays, but no longer verifies
    pub fn deactivate_employee(&self, id: IdentityId) -> Result<IdentityRecord, ServiceError> {
        let ((), record) = self.update_active(id, |record| {
            record.active = false;
            Ok(())
        })?;
        tracing::info!(employee_id = id, "employee deactivated");
        Ok(record)
    }

    pub fn regenerate_qr(&self, id: IdentityId) -> Result<IdentityRecord, ServiceError> {
        let ((), record) = self.update_active(id, |record| {
            record.qr_token = generate_token(record.id);
            Ok(())
        })?;
        tracing::info!(employee_id = id, "qr token regenerated");
        Ok(record)
    }

    pub fn list_faces(&self, id: IdentityId) -> Result<Vec<SlotEntry>, ServiceError> {
        Ok(self.get_employee(id)?.slots.entries().to_vec())
    }

    /// Extract a face from `image` and store it in the first free slot
    pub fn enroll_image(&self, id: IdentityId, image: &[u8]) -> Result<Enrollment, ServiceError> {
        let current = self.get_employee(id)?;
        if current.slots.is_full() {
            return Err(ServiceError::Capacity {
                capacity: current.slots.capacity(),
            });
        }

        let embedding = self
            .extractor
            .extract(image)?
            .ok_or_else(|| ServiceError::Input("No face detected in image".into()))?;

        let saved = self.save_image(id, image)?;
        let provenance = saved.as_ref().map(|p| p.display().to_string());
        match self.enroll_embedding(id, embedding, provenance) {
            Ok(enrollment) => Ok(enrollment),
            Err(e) => {
                if let Some(path) = saved {
                    if let Err(rm) = std::fs::remove_file(&path) {
                        tracing::warn!("enroll_rollback_failed path={:?} err={}", path, rm);
                    }
                }
                Err(e)
            }
        }
    }

    pub fn enroll_embedding(
        &self,
        id: IdentityId,
        embedding: Vec<f32>,
        provenance: Option<String>,
    ) -> Result<Enrollment, ServiceError> {
        let (slot, employee) = self.update_active(id, |record| {
            Ok(record.slots.add(embedding.clone(), provenance.clone())?)
        })?;
        tracing::info!(
            employee_id = id,
            slot = slot.get(),
            faces = employee.slots.count(),
            "face enrolled"
        );
        Ok(Enrollment { slot, employee })
    }

    /// Free a 1-based slot; a vacant slot is reported as not removed
    pub fn remove_face(&self, id: IdentityId, slot: usize) -> Result<Removal, ServiceError> {
        let (removed, employee) =
            self.update_active(id, |record| Ok(record.slots.remove(slot)?))?;
        if let Some(entry) = &removed {
            tracing::info!(employee_id = id, slot, "face removed");
            if let Some(path) = &entry.provenance {
                self.discard_image(path);
            }
        }
        Ok(Removal {
            slot,
            removed,
            employee,
        })
    }

    /// Resolve a scanned QR payload to an active employee
    pub fn verify_qr(&self, qr_data: &str) -> Result<IdentityRecord, ServiceError> {
        let token = qr_data.trim();
        if token.is_empty() {
            return Err(ServiceError::Input("Missing QR data".into()));
        }
        match self.store.find_by_qr_token(token)? {
            Some(record) if record.active => {
                tracing::info!(employee_id = record.id, "qr verified");
                Ok(record)
            }
            _ => {
                tracing::info!("qr rejected");
                Err(ServiceError::UnknownQrCode)
            }
        }
    }

    pub fn verify_face(&self, id: IdentityId, image: &[u8]) -> Result<Verification, ServiceError> {
        let employee = self.get_employee(id)?;
        let outcome = self
            .matcher
            .score_image(&employee.slots, image, &self.extractor)?;
        log_outcome(id, &outcome);
        Ok(Verification { employee, outcome })
    }

    pub fn verify_embedding(
        &self,
        id: IdentityId,
        embedding: &[f32],
        metric: Option<&str>,
    ) -> Result<Verification, ServiceError> {
        let metric = metric
            .map(|m| m.parse::<Metric>())
            .transpose()?;
        let employee = self.get_employee(id)?;
        let outcome = self.matcher.score(&employee.slots, embedding, metric)?;
        log_outcome(id, &outcome);
        Ok(Verification { employee, outcome })
    }

    /// Read-modify-write on an active employee with the configured retries
    fn update_active<T>(
        &self,
        id: IdentityId,
        mut mutate: impl FnMut(&mut IdentityRecord) -> Result<T, ServiceError>,
    ) -> Result<(T, IdentityRecord), ServiceError> {
        update_identity(
            self.store.as_ref(),
            id,
            self.config.conflict_retries,
            |record: &mut IdentityRecord| {
                if !record.active {
                    return Err(ServiceError::NotFound(id));
                }
                mutate(record)
            },
        )
    }

    fn save_image(&self, id: IdentityId, image: &[u8]) -> Result<Option<PathBuf>, ServiceError> {
        let Some(dir) = &self.config.image_dir else {
            return Ok(None);
        };
        let dir = dir.join(id.to_string());
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        let file_name = format!(
            "{}-{}.{}",
            facegate_core::record::now_unix_ts(),
            facegate_core::codec::to_hex(&nonce),
            image_extension(image)
        );
        let path = dir.join(file_name);
        std::fs::create_dir_all(&dir)
            .and_then(|_| std::fs::write(&path, image))
            .map_err(|e| ServiceError::Storage(format!("saving image {:?}: {}", path, e)))?;
        Ok(Some(path))
    }

    fn discard_image(&self, path: &str) {
        let Some(dir) = &self.config.image_dir else {
            return;
        };
        let path = std::path::Path::new(path);
        if path.starts_with(dir) {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("image_cleanup_failed path={:?} err={}", path, e);
            }
        }
    }
}

fn log_outcome(id: IdentityId, outcome: &MatchOutcome) {
    tracing::info!(
        employee_id = id,
        matched = outcome.matched,
        distance = ?outcome.distance,
        metric = %outcome.metric,
        "face verification"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::StaticExtractor;

    fn state_with(extractor: Extractor) -> AppState {
        AppState::new(
            ServiceConfig::default(),
            Arc::new(MemoryIdentityStore::new()),
            extractor,
        )
    }

    fn draft(name: &str) -> EmployeeDraft {
        EmployeeDraft {
            name: name.into(),
            ..EmployeeDraft::default()
        }
    }

    #[test]
    fn test_blank_name_is_rejected() {
        let state = state_with(Extractor::NotConfigured);
        assert!(matches!(
            state.create_employee(draft("   ")),
            Err(ServiceError::Input(_))
        ));
    }

    #[test]
    fn test_deactivated_employee_disappears() {
        let state = state_with(Extractor::NotConfigured);
        let a = state.create_employee(draft("Jan")).unwrap();
        let b = state.create_employee(draft("Ewa")).unwrap();
        state.deactivate_employee(a.id).unwrap();

        let active: Vec<_> = state.list_employees().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(active, vec![b.id]);
        assert!(matches!(
            state.get_employee(a.id),
            Err(ServiceError::NotFound(_))
        ));
        assert!(matches!(
            state.verify_qr(&a.qr_token),
            Err(ServiceError::UnknownQrCode)
        ));
        assert!(matches!(
            state.enroll_embedding(a.id, vec![1.0], None),
            Err(ServiceError::NotFound(_))
        ));
        assert_eq!(
            state.summary().unwrap(),
            StoreSummary {
                employees: 2,
                active_employees: 1
            }
        );
    }

    #[test]
    fn test_regenerated_qr_replaces_old_token() {
        let state = state_with(Extractor::NotConfigured);
        let record = state.create_employee(draft("Jan")).unwrap();
        let updated = state.regenerate_qr(record.id).unwrap();
        assert_ne!(updated.qr_token, record.qr_token);
        assert_eq!(state.verify_qr(&updated.qr_token).unwrap().id, record.id);
        assert!(state.verify_qr(&record.qr_token).is_err());
        assert!(matches!(state.verify_qr("  "), Err(ServiceError::Input(_))));
    }

    #[test]
    fn test_sixth_enrollment_hits_capacity() {
        let state = state_with(Extractor::NotConfigured);
        let record = state.create_employee(draft("Jan")).unwrap();
        for i in 0..5 {
            let enrolled = state
                .enroll_embedding(record.id, vec![i as f32, 1.0], None)
                .unwrap();
            assert_eq!(enrolled.slot.get(), i + 1);
        }
        assert!(matches!(
            state.enroll_embedding(record.id, vec![9.0, 9.0], None),
            Err(ServiceError::Capacity { capacity: 5 })
        ));
        assert_eq!(state.list_faces(record.id).unwrap().len(), 5);
    }

    #[test]
    fn test_enroll_image_requires_extractor() {
        let state = state_with(Extractor::NotConfigured);
        let record = state.create_employee(draft("Jan")).unwrap();
        assert!(matches!(
            state.enroll_image(record.id, b"jpeg bytes"),
            Err(ServiceError::ExtractorUnavailable)
        ));
    }

    #[test]
    fn test_enroll_image_without_face_is_input_error() {
        let state = state_with(Extractor::new(StaticExtractor::no_face()));
        let record = state.create_employee(draft("Jan")).unwrap();
        assert!(matches!(
            state.enroll_image(record.id, b"jpeg bytes"),
            Err(ServiceError::Input(_))
        ));
        assert!(state.list_faces(record.id).unwrap().is_empty());
    }

    #[test]
    fn test_enroll_image_saves_provenance_and_remove_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            image_dir: Some(dir.path().to_path_buf()),
            ..ServiceConfig::default()
        };
        let state = AppState::new(
            config,
            Arc::new(MemoryIdentityStore::new()),
            Extractor::new(StaticExtractor::face(vec![0.1, 0.2, 0.3])),
        );
        let record = state.create_employee(draft("Jan")).unwrap();

        let enrolled = state.enroll_image(record.id, b"jpeg bytes").unwrap();
        assert_eq!(enrolled.slot.get(), 1);
        let provenance = enrolled.employee.slots.entries()[0]
            .provenance
            .clone()
            .unwrap();
        assert!(std::path::Path::new(&provenance).exists());

        let removal = state.remove_face(record.id, 1).unwrap();
        assert!(removal.removed.is_some());
        assert!(!std::path::Path::new(&provenance).exists());

        let again = state.remove_face(record.id, 1).unwrap();
        assert!(again.removed.is_none());
        assert!(matches!(
            state.remove_face(record.id, 6),
            Err(ServiceError::Input(_))
        ));
    }

    #[test]
    fn test_failed_commit_discards_saved_image() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            image_dir: Some(dir.path().to_path_buf()),
            ..ServiceConfig::default()
        };
        let state = AppState::new(
            config,
            Arc::new(MemoryIdentityStore::new()),
            Extractor::new(StaticExtractor::face(vec![0.1, 0.2, 0.3])),
        );
        let record = state.create_employee(draft("Jan")).unwrap();
        state.enroll_embedding(record.id, vec![1.0, 0.0], None).unwrap();

        // Three-dimensional query against two-dimensional slots
        assert!(matches!(
            state.enroll_image(record.id, b"jpeg bytes"),
            Err(ServiceError::Input(_))
        ));
        let leftover = std::fs::read_dir(dir.path().join(record.id.to_string()))
            .unwrap()
            .count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_verify_face_paths() {
        let state = state_with(Extractor::new(StaticExtractor::face(vec![1.0, 0.0, 0.0])));
        let record = state.create_employee(draft("Jan")).unwrap();

        // Nothing enrolled yet
        let empty = state.verify_face(record.id, b"jpeg bytes").unwrap();
        assert!(!empty.outcome.matched);
        assert_eq!(empty.outcome.distance, None);

        state
            .enroll_embedding(record.id, vec![1.0, 0.0, 0.0], None)
            .unwrap();
        let hit = state.verify_face(record.id, b"jpeg bytes").unwrap();
        assert!(hit.outcome.matched);
        assert_eq!(hit.outcome.distance, Some(0.0));

        assert!(matches!(
            state.verify_face(record.id, b""),
            Err(ServiceError::Input(_))
        ));
    }

    #[test]
    fn test_verify_face_without_extractor_is_unavailable() {
        let state = state_with(Extractor::NotConfigured);
        let record = state.create_employee(draft("Jan")).unwrap();
        state
            .enroll_embedding(record.id, vec![1.0, 0.0, 0.0], None)
            .unwrap();
        assert!(matches!(
            state.verify_face(record.id, b"jpeg bytes"),
            Err(ServiceError::ExtractorUnavailable)
        ));
    }

    #[test]
    fn test_verify_embedding_metrics() {
        let state = state_with(Extractor::NotConfigured);
        let record = state.create_employee(draft("Jan")).unwrap();
        state
            .enroll_embedding(record.id, vec![1.0, 0.0, 0.0], None)
            .unwrap();

        let far = state
            .verify_embedding(record.id, &[0.0, 1.0, 0.0], None)
            .unwrap();
        assert!(!far.outcome.matched);
        assert_eq!(far.outcome.metric, Metric::Euclidean);

        let scaled = state
            .verify_embedding(record.id, &[5.0, 0.0, 0.0], Some("cosine"))
            .unwrap();
        assert!(scaled.outcome.matched);
        assert_eq!(scaled.outcome.metric, Metric::Cosine);

        assert!(matches!(
            state.verify_embedding(record.id, &[1.0, 0.0, 0.0], Some("manhattan")),
            Err(ServiceError::Input(_))
        ));
        assert!(matches!(
            state.verify_embedding(record.id, &[1.0, 0.0], None),
            Err(ServiceError::Input(_))
        ));
        assert!(matches!(
            state.verify_embedding(record.id, &[f32::INFINITY, 0.0, 0.0], None),
            Err(ServiceError::Input(_))
        ));
        assert!(matches!(
            state.verify_embedding(record.id, &[f32::NAN; 3], Some("cosine")),
            Err(ServiceError::Input(_))
        ));
    }
}
