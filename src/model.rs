use serde::{Deserialize, Serialize};

use facegate_core::{IdentityRecord, Metric, SlotEntry};

use crate::service::EmployeeDraft;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateEmployeeRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub department: String,
}

impl From<CreateEmployeeRequest> for EmployeeDraft {
    fn from(value: CreateEmployeeRequest) -> Self {
        EmployeeDraft {
            name: value.name,
            position: value.position,
            department: value.department,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmployeeView {
    pub id: u64,
    pub name: String,
    pub position: String,
    pub department: String,
    pub qr_code_hash: String,
    pub is_active: bool,
    pub created_at: i64,
    pub face_count: usize,
    pub face_capacity: usize,
}

impl From<&IdentityRecord> for EmployeeView {
    fn from(record: &IdentityRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            position: record.position.clone(),
            department: record.department.clone(),
            qr_code_hash: record.qr_token.clone(),
            is_active: record.active,
            created_at: record.created_at,
            face_count: record.slots.count(),
            face_capacity: record.slots.capacity(),
        }
    }
}

/// Slot summary; the embedding itself is never returned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceSlotView {
    pub slot: usize,
    pub dim: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
}

impl From<&SlotEntry> for FaceSlotView {
    fn from(entry: &SlotEntry) -> Self {
        Self {
            slot: entry.slot.get(),
            dim: entry.vector.len(),
            image_path: entry.provenance.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollEmbeddingRequest {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub provenance: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub employee_id: u64,
    pub slot: usize,
    pub face_count: usize,
    pub face_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveFaceResponse {
    pub employee_id: u64,
    pub slot: usize,
    pub removed: bool,
    pub face_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerifyQrRequest {
    #[serde(default)]
    pub qr_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyQrResponse {
    pub message: String,
    pub employee: EmployeeView,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyEmbeddingRequest {
    pub vector: Vec<f32>,
    #[serde(default)]
    pub metric: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyFaceResponse {
    pub matched: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
    pub threshold: f32,
    pub metric: Metric,
    pub employee_id: u64,
    /// Only present on a match
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee: Option<EmployeeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub employees: usize,
    pub active_employees: usize,
    pub extractor_configured: bool,
    pub threshold: f32,
    pub metric: Metric,
    pub slot_capacity: usize,
}
