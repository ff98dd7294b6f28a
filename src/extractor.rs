//! Face extraction through an external command
//!
//! The uploaded image is decoded, flattened to RGB8 and re-encoded as PNG,
//! then piped to the configured command on stdin. The command prints a JSON
//! array of encodings (`[[f32, ...], ...]`) on stdout; the first encoding is
//! used and an empty array means no face was found.

use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use wait_timeout::ChildExt;

use facegate_core::math::is_finite_vector;
use facegate_core::{ExtractError, FaceExtractor};

/// How long one extraction may run before the command is killed
pub const DEFAULT_EXTRACTOR_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandExtractor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_EXTRACTOR_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn backend(&self, what: &str, e: impl std::fmt::Display) -> ExtractError {
        ExtractError::Backend(format!("{} {:?}: {}", what, self.program, e))
    }
}

impl FaceExtractor for CommandExtractor {
    fn extract(&self, image: &[u8]) -> Result<Option<Vec<f32>>, ExtractError> {
        let png = normalize_image(image)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.backend("spawning", e))?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ExtractError::Backend("extractor pipes unavailable".into()));
        };
        let writer = std::thread::spawn(move || stdin.write_all(&png));
        let stdout_reader = drain(stdout);
        let stderr_reader = drain(stderr);

        let status = match child.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                // Pipe threads are left to finish once the pipes close.
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    "extractor_timeout program={:?} timeout_ms={}",
                    self.program,
                    self.timeout.as_millis()
                );
                return Err(ExtractError::Backend(format!(
                    "{:?} timed out after {:?}",
                    self.program, self.timeout
                )));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(self.backend("waiting for", e));
            }
        };

        match writer.join() {
            Ok(Ok(())) => {}
            // Early close of stdin is fine; the exit status decides.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(self.backend("writing image to", e)),
            Err(_) => return Err(ExtractError::Backend("stdin writer panicked".into())),
        }
        let stdout = join_output(stdout_reader).map_err(|e| self.backend("reading", e))?;
        let stderr = join_output(stderr_reader).unwrap_or_default();

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            tracing::warn!(
                "extractor_failed program={:?} status={} stderr={}",
                self.program,
                status,
                stderr.trim()
            );
            return Err(ExtractError::Backend(format!(
                "{:?} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            )));
        }

        parse_encodings(&stdout)
    }

    fn name(&self) -> &str {
        "command"
    }
}

fn drain(mut pipe: impl Read + Send + 'static) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(buf)
    })
}

fn join_output(reader: JoinHandle<std::io::Result<Vec<u8>>>) -> std::io::Result<Vec<u8>> {
    reader
        .join()
        .unwrap_or_else(|_| Err(std::io::Error::other("pipe reader panicked")))
}

/// Decode any supported format and re-encode it as an RGB8 PNG
pub fn normalize_image(bytes: &[u8]) -> Result<Vec<u8>, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::UnreadableImage("empty upload".into()));
    }
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ExtractError::UnreadableImage(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, image::ImageFormat::Png)
        .map_err(|e| ExtractError::Backend(format!("re-encoding image: {}", e)))?;
    Ok(out.into_inner())
}

/// File extension for a stored upload, from its magic bytes
pub fn image_extension(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "png",
        Ok(image::ImageFormat::Jpeg) => "jpg",
        _ => "img",
    }
}

fn parse_encodings(stdout: &[u8]) -> Result<Option<Vec<f32>>, ExtractError> {
    let encodings: Vec<Vec<f32>> = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::InvalidOutput(e.to_string()))?;
    match encodings.into_iter().next() {
        None => Ok(None),
        Some(encoding) if encoding.is_empty() => {
            Err(ExtractError::InvalidOutput("empty encoding".into()))
        }
        Some(encoding) if !is_finite_vector(&encoding) => Err(ExtractError::InvalidOutput(
            "encoding contains non-finite values".into(),
        )),
        Some(encoding) => Ok(Some(encoding)),
    }
}
