//! facegate CLI
//!
//! Employee identity verification by QR token and face embeddings.
//!
//! # Usage
//!
//! ```bash
//! # Start the server with an external face extractor
//! facegate serve --data-dir ./data --port 5000 --extractor-cmd ./encode_face.py
//!
//! # Register an employee and enroll a photo
//! facegate create-employee --data-dir ./data --name "Jan Kowalski"
//! facegate enroll --data-dir ./data --id 1 --image jan.jpg --extractor-cmd ./encode_face.py
//!
//! # Check a scanned QR payload
//! facegate verify-qr --data-dir ./data --token 3f9a...
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use facegate::config::ServiceConfig;
use facegate::model::{EmployeeView, FaceSlotView};
use facegate::service::{AppState, EmployeeDraft};
use facegate::{serve, CommandExtractor};
use facegate_core::{Extractor, MatchConfig, Metric};

#[derive(Parser)]
#[command(name = "facegate")]
#[command(about = "Employee identity verification: QR tokens and face matching")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct StoreArgs {
    /// Directory holding identities.json and enrolled photos
    #[arg(long, env = "FACEGATE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,
}

#[derive(Args, Clone)]
struct ExtractorArgs {
    /// Command that reads an image on stdin and prints `[[f32, ...]]` on stdout
    #[arg(long, env = "FACEGATE_EXTRACTOR_CMD")]
    extractor_cmd: Option<PathBuf>,

    /// Extra argument for the extractor command (repeatable)
    #[arg(long = "extractor-arg", allow_hyphen_values = true)]
    extractor_args: Vec<String>,

    /// Seconds one extraction may run before the command is killed
    #[arg(long, env = "FACEGATE_EXTRACTOR_TIMEOUT_SECS", default_value = "30")]
    extractor_timeout_secs: u64,
}

impl ExtractorArgs {
    fn build(&self) -> Extractor {
        match &self.extractor_cmd {
            Some(cmd) => Extractor::new(
                CommandExtractor::new(cmd, self.extractor_args.clone())
                    .with_timeout(Duration::from_secs(self.extractor_timeout_secs)),
            ),
            None => Extractor::NotConfigured,
        }
    }
}

#[derive(Args, Clone)]
struct MatchArgs {
    /// Maximum distance accepted as a match
    #[arg(long, env = "FACEGATE_THRESHOLD", default_value = "0.6")]
    threshold: f32,

    /// Distance metric for embedding verification (euclidean | cosine)
    #[arg(long, env = "FACEGATE_METRIC", default_value = "euclidean")]
    metric: Metric,

    /// Face slots per employee
    #[arg(long, env = "FACEGATE_MAX_SLOTS", default_value = "5")]
    max_slots: usize,

    /// Retries for a write that lost a concurrent update
    #[arg(long, env = "FACEGATE_CONFLICT_RETRIES", default_value = "3")]
    conflict_retries: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        extractor: ExtractorArgs,

        #[command(flatten)]
        matching: MatchArgs,

        /// Server port
        #[arg(short, long, env = "FACEGATE_PORT", default_value = "5000")]
        port: u16,

        /// Host to bind to
        #[arg(long, env = "FACEGATE_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Where enrolled photos are kept (defaults to <data-dir>/faces)
        #[arg(long, env = "FACEGATE_IMAGE_DIR")]
        image_dir: Option<PathBuf>,

        /// Largest accepted upload in bytes
        #[arg(long, env = "FACEGATE_MAX_IMAGE_BYTES", default_value = "10485760")]
        max_image_bytes: usize,

        /// Keep identities in memory only
        #[arg(long, env = "FACEGATE_IN_MEMORY")]
        in_memory: bool,
    },

    /// Register an employee and print their QR token
    CreateEmployee {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        position: String,

        #[arg(long, default_value = "")]
        department: String,
    },

    /// List active employees
    ListEmployees {
        #[command(flatten)]
        store: StoreArgs,
    },

    /// Enroll a face from a photo or a JSON embedding file
    ///
    /// Embedding file format: JSON array of floats [0.1, -0.2, ...]
    Enroll {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        extractor: ExtractorArgs,

        /// Employee id
        #[arg(long)]
        id: u64,

        /// Photo to extract the face from
        #[arg(long, conflicts_with = "embedding", required_unless_present = "embedding")]
        image: Option<PathBuf>,

        /// JSON file holding a precomputed embedding
        #[arg(long)]
        embedding: Option<PathBuf>,
    },

    /// Check a photo against an employee's enrolled faces
    VerifyFace {
        #[command(flatten)]
        store: StoreArgs,

        #[command(flatten)]
        extractor: ExtractorArgs,

        #[arg(long, default_value = "0.6")]
        threshold: f32,

        #[arg(long)]
        id: u64,

        #[arg(long)]
        image: PathBuf,
    },

    /// Resolve a scanned QR payload
    VerifyQr {
        #[command(flatten)]
        store: StoreArgs,

        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            store,
            extractor,
            matching,
            port,
            host,
            image_dir,
            max_image_bytes,
            in_memory,
        } => {
            let mut config = if in_memory {
                ServiceConfig::default()
            } else {
                ServiceConfig::from_data_dir(store.data_dir)
            };
            if image_dir.is_some() {
                config.image_dir = image_dir;
            }
            config.matching = MatchConfig {
                threshold: matching.threshold,
                metric: matching.metric,
            };
            config.slot_capacity = matching.max_slots;
            config.conflict_retries = matching.conflict_retries;
            config.max_image_bytes = max_image_bytes;

            let state = Arc::new(AppState::open(config, extractor.build())?);
            if !state.extractor.is_configured() {
                tracing::warn!(
                    "no extractor configured; photo enrollment and face verification answer 503"
                );
            }

            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid bind address {}:{}", host, port))?;
            serve(state, addr).await?;
        }

        Commands::CreateEmployee {
            store,
            name,
            position,
            department,
        } => {
            let state = open_local(&store, Extractor::NotConfigured)?;
            let record = state.create_employee(EmployeeDraft {
                name,
                position,
                department,
            })?;
            print_json(&EmployeeView::from(&record))?;
        }

        Commands::ListEmployees { store } => {
            let state = open_local(&store, Extractor::NotConfigured)?;
            let views: Vec<EmployeeView> = state
                .list_employees()?
                .iter()
                .map(EmployeeView::from)
                .collect();
            print_json(&views)?;
        }

        Commands::Enroll {
            store,
            extractor,
            id,
            image,
            embedding,
        } => {
            let state = open_local(&store, extractor.build())?;
            let enrollment = match (image, embedding) {
                (Some(path), _) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("reading image {:?}", path))?;
                    state.enroll_image(id, &bytes)?
                }
                (None, Some(path)) => {
                    let raw = std::fs::read(&path)
                        .with_context(|| format!("reading embedding {:?}", path))?;
                    let vector: Vec<f32> = serde_json::from_slice(&raw)
                        .with_context(|| format!("parsing embedding {:?}", path))?;
                    state.enroll_embedding(id, vector, Some(path.display().to_string()))?
                }
                (None, None) => anyhow::bail!("either --image or --embedding is required"),
            };
            let slots: Vec<FaceSlotView> = enrollment
                .employee
                .slots
                .entries()
                .iter()
                .map(FaceSlotView::from)
                .collect();
            println!("Enrolled employee {} into slot {}", id, enrollment.slot);
            print_json(&slots)?;
        }

        Commands::VerifyFace {
            store,
            extractor,
            threshold,
            id,
            image,
        } => {
            let mut config = ServiceConfig::from_data_dir(store.data_dir);
            config.image_dir = None;
            config.matching.threshold = threshold;
            let state = AppState::open(config, extractor.build())?;
            let bytes =
                std::fs::read(&image).with_context(|| format!("reading image {:?}", image))?;
            let verification = state.verify_face(id, &bytes)?;
            print_json(&verification.outcome)?;
        }

        Commands::VerifyQr { store, token } => {
            let state = open_local(&store, Extractor::NotConfigured)?;
            let record = state.verify_qr(&token)?;
            println!("Welcome, {}!", record.name);
            print_json(&EmployeeView::from(&record))?;
        }
    }

    Ok(())
}

fn open_local(store: &StoreArgs, extractor: Extractor) -> anyhow::Result<AppState> {
    AppState::open(ServiceConfig::from_data_dir(store.data_dir.clone()), extractor)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
