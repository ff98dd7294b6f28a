//! facegate: employee identity verification service
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      HTTP API (axum)                        │
//! │        /employees · /employees/:id/faces · /verify/*        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    AppState (service)                       │
//! │      CommandExtractor  ·  Matcher  ·  update_identity       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            FileIdentityStore (identities.json)              │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod extractor;
pub mod model;
pub mod service;
pub mod storage;

pub use api::{create_router, serve};
pub use config::ServiceConfig;
pub use extractor::CommandExtractor;
pub use service::{AppState, EmployeeDraft, ServiceError};
pub use storage::FileIdentityStore;
