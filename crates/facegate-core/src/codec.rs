//! Storage encoding for embeddings
//!
//! # Layout
//!
//! ```text
//! Offset   Size    Type        Description
//! ─────────────────────────────────────────────
//! 0x00     D*4     [f32]       Vector data (Little Endian)
//! ```
//!
//! There is no header: the dimension is implied by the blob length and
//! checked against the owning slot collection when a record is loaded.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Blob length {len} is not a multiple of 4 bytes")]
    Misaligned { len: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(String),
}

/// Encode a vector as little-endian `f32` bytes
pub fn encode(vector: &[f32]) -> Vec<u8> {
    #[cfg(target_endian = "little")]
    {
        bytemuck::cast_slice::<f32, u8>(vector).to_vec()
    }

    #[cfg(not(target_endian = "little"))]
    {
        let mut out = Vec::with_capacity(vector.len() * 4);
        for &val in vector {
            out.extend_from_slice(&val.to_le_bytes());
        }
        out
    }
}

/// Decode little-endian `f32` bytes back into a vector
///
/// Uses `bytemuck` for an alignment-checked cast when the buffer happens to be
/// 4-byte aligned and falls back to a byte-wise read otherwise.
pub fn decode(bytes: &[u8]) -> Result<Vec<f32>, CodecError> {
    if bytes.len() % 4 != 0 {
        return Err(CodecError::Misaligned { len: bytes.len() });
    }

    #[cfg(target_endian = "little")]
    if let Ok(floats) = bytemuck::try_cast_slice::<u8, f32>(bytes) {
        return Ok(floats.to_vec());
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Lowercase hex encoding of a byte buffer
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parse a hex string produced by [`to_hex`]
pub fn from_hex(s: &str) -> Result<Vec<u8>, CodecError> {
    if s.len() % 2 != 0 {
        return Err(CodecError::InvalidHex(format!("odd length {}", s.len())));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            s.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| CodecError::InvalidHex(format!("bad digit pair at {}", i)))
        })
        .collect()
}

/// Encode a vector straight to hex, as stored in JSON documents
pub fn encode_hex(vector: &[f32]) -> String {
    to_hex(&encode(vector))
}

/// Inverse of [`encode_hex`]
pub fn decode_hex(s: &str) -> Result<Vec<f32>, CodecError> {
    decode(&from_hex(s)?)
}
