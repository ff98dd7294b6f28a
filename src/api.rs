use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{request::Parts, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};

use crate::model::{
    ApiResponse, CreateEmployeeRequest, EmployeeView, EnrollEmbeddingRequest, EnrollResponse,
    ErrorBody, FaceSlotView, HealthResponse, RemoveFaceResponse, VerifyEmbeddingRequest,
    VerifyFaceResponse, VerifyQrRequest, VerifyQrResponse,
};
use crate::service::{AppState, Enrollment, ServiceError, Verification};

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_image_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/employees", post(create_employee).get(list_employees))
        .route("/employees/:id", get(get_employee).delete(deactivate_employee))
        .route("/employees/:id/qr", post(regenerate_qr))
        .route("/employees/:id/faces", get(list_faces).post(enroll_face))
        .route("/employees/:id/faces/:slot", delete(remove_face))
        .route("/employees/:id/embeddings", post(enroll_embedding))
        .route("/verify/qr", post(verify_qr))
        .route("/verify/face/:id", post(verify_face))
        .route("/verify/embedding/:id", post(verify_embedding))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors_layer())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, addr: std::net::SocketAddr) -> std::io::Result<()> {
    let router = create_router(state);

    tracing::info!("Starting facegate server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

/// Echo back any origin made of URL-safe characters, with credentials
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            |origin: &HeaderValue, _parts: &Parts| origin_allowed(origin.as_bytes()),
        ))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
}

fn origin_allowed(origin: &[u8]) -> bool {
    !origin.is_empty()
        && origin
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':' | b'/'))
}

async fn health(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, |state| state.summary()).await;
    match result {
        Ok(summary) => {
            let matching = state.matcher.config();
            let payload = ApiResponse {
                data: HealthResponse {
                    status: "ok".to_string(),
                    employees: summary.employees,
                    active_employees: summary.active_employees,
                    extractor_configured: state.extractor.is_configured(),
                    threshold: matching.threshold,
                    metric: matching.metric,
                    slot_capacity: state.config.slot_capacity,
                },
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn create_employee(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateEmployeeRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.create_employee(body.into())).await;
    match result {
        Ok(record) => {
            let payload = ApiResponse {
                data: EmployeeView::from(&record),
            };
            json_response(StatusCode::CREATED, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn list_employees(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let request_id = request_id(&headers);
    match run_blocking(&state, |state| state.list_employees()).await {
        Ok(records) => {
            let payload = ApiResponse {
                data: records.iter().map(EmployeeView::from).collect::<Vec<_>>(),
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn get_employee(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.get_employee(id)).await;
    employee_response(&request_id, result)
}

async fn deactivate_employee(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.deactivate_employee(id)).await;
    employee_response(&request_id, result)
}

async fn regenerate_qr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.regenerate_qr(id)).await;
    employee_response(&request_id, result)
}

async fn list_faces(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let request_id = request_id(&headers);
    match run_blocking(&state, move |state| state.list_faces(id)).await {
        Ok(entries) => {
            let payload = ApiResponse {
                data: entries.iter().map(FaceSlotView::from).collect::<Vec<_>>(),
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn enroll_face(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.enroll_image(id, &body)).await;
    enrollment_response(&request_id, result)
}

async fn enroll_embedding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<EnrollEmbeddingRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| {
        state.enroll_embedding(id, body.vector, body.provenance)
    })
    .await;
    enrollment_response(&request_id, result)
}

async fn remove_face(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, slot)): Path<(u64, usize)>,
) -> Response {
    let request_id = request_id(&headers);
    match run_blocking(&state, move |state| state.remove_face(id, slot)).await {
        Ok(removal) => {
            let payload = ApiResponse {
                data: RemoveFaceResponse {
                    employee_id: id,
                    slot: removal.slot,
                    removed: removal.removed.is_some(),
                    face_count: removal.employee.slots.count(),
                },
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn verify_qr(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyQrRequest>,
) -> Response {
    let request_id = request_id(&headers);
    match run_blocking(&state, move |state| state.verify_qr(&body.qr_data)).await {
        Ok(record) => {
            let payload = ApiResponse {
                data: VerifyQrResponse {
                    message: format!("Welcome, {}!", record.name),
                    employee: EmployeeView::from(&record),
                },
            };
            json_response(StatusCode::OK, &request_id, &payload)
        }
        Err(e) => service_error_response(&request_id, &e),
    }
}

async fn verify_face(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    body: Bytes,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| state.verify_face(id, &body)).await;
    verification_response(&request_id, result)
}

async fn verify_embedding(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<VerifyEmbeddingRequest>,
) -> Response {
    let request_id = request_id(&headers);
    let result = run_blocking(&state, move |state| {
        state.verify_embedding(id, &body.vector, body.metric.as_deref())
    })
    .await;
    verification_response(&request_id, result)
}

/// Run a service call on the blocking pool
async fn run_blocking<T, F>(state: &Arc<AppState>, call: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce(&AppState) -> Result<T, ServiceError> + Send + 'static,
{
    let state_bg = state.clone();
    match tokio::task::spawn_blocking(move || call(&state_bg)).await {
        Ok(inner) => inner,
        Err(e) => Err(ServiceError::Internal(format!("worker join error: {}", e))),
    }
}

fn employee_response(
    request_id: &str,
    result: Result<facegate_core::IdentityRecord, ServiceError>,
) -> Response {
    match result {
        Ok(record) => {
            let payload = ApiResponse {
                data: EmployeeView::from(&record),
            };
            json_response(StatusCode::OK, request_id, &payload)
        }
        Err(e) => service_error_response(request_id, &e),
    }
}

fn enrollment_response(request_id: &str, result: Result<Enrollment, ServiceError>) -> Response {
    match result {
        Ok(enrollment) => {
            let payload = ApiResponse {
                data: EnrollResponse {
                    employee_id: enrollment.employee.id,
                    slot: enrollment.slot.get(),
                    face_count: enrollment.employee.slots.count(),
                    face_capacity: enrollment.employee.slots.capacity(),
                },
            };
            json_response(StatusCode::CREATED, request_id, &payload)
        }
        Err(e) => service_error_response(request_id, &e),
    }
}

fn verification_response(request_id: &str, result: Result<Verification, ServiceError>) -> Response {
    match result {
        Ok(Verification { employee, outcome }) => {
            let message = if outcome.matched {
                format!("Welcome, {}!", employee.name)
            } else if employee.slots.is_empty() {
                "No enrolled faces for this employee".to_string()
            } else if outcome.distance.is_none() {
                "No face detected".to_string()
            } else {
                "Face does not match".to_string()
            };
            let payload = ApiResponse {
                data: VerifyFaceResponse {
                    matched: outcome.matched,
                    message,
                    distance: outcome.distance,
                    threshold: outcome.threshold,
                    metric: outcome.metric,
                    employee_id: employee.id,
                    employee: outcome.matched.then(|| EmployeeView::from(&employee)),
                },
            };
            json_response(StatusCode::OK, request_id, &payload)
        }
        Err(e) => service_error_response(request_id, &e),
    }
}

fn classify_service_error(err: &ServiceError) -> (StatusCode, &'static str) {
    match err {
        ServiceError::Input(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        ServiceError::NotFound(_) => (StatusCode::NOT_FOUND, "employee_not_found"),
        ServiceError::UnknownQrCode => (StatusCode::NOT_FOUND, "unknown_qr_code"),
        ServiceError::Capacity { .. } => (StatusCode::CONFLICT, "face_slots_full"),
        ServiceError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
        ServiceError::ExtractorUnavailable => {
            (StatusCode::SERVICE_UNAVAILABLE, "extractor_unavailable")
        }
        ServiceError::Extractor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "extractor_failed"),
        ServiceError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
        ServiceError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

fn service_error_response(request_id: &str, err: &ServiceError) -> Response {
    let (status, code) = classify_service_error(err);
    if status.is_server_error() {
        tracing::error!("request_failed request_id={} code={} err={}", request_id, code, err);
    } else {
        tracing::debug!("request_rejected request_id={} code={} err={}", request_id, code, err);
    }
    let details = match err {
        ServiceError::Capacity { capacity } => Some(serde_json::json!({ "capacity": capacity })),
        ServiceError::NotFound(id) => Some(serde_json::json!({ "employee_id": id })),
        _ => None,
    };
    error_response(status, request_id, code, err.to_string(), details)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(new_request_id)
}

fn set_request_id(resp: &mut Response, request_id: &str) {
    if let Ok(hv) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", hv);
    }
}

fn json_response<T: serde::Serialize>(
    status: StatusCode,
    request_id: &str,
    payload: &T,
) -> Response {
    let mut resp = (status, Json(payload)).into_response();
    set_request_id(&mut resp, request_id);
    resp
}

fn error_response(
    status: StatusCode,
    request_id: &str,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
) -> Response {
    let payload = ErrorBody {
        code,
        message,
        details,
    };
    json_response(status, request_id, &payload)
}

fn new_request_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "req_{}_{}",
        facegate_core::record::now_unix_ts(),
        facegate_core::codec::to_hex(&bytes)
    )
}
