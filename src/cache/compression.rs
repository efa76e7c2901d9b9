//! Opaque blob encoding for compressed cache strategies (gzip, then base64).

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value;

use crate::errors::AppError;

pub fn compress(value: &Value) -> Result<String, AppError> {
    let raw = serde_json::to_vec(value)
        .map_err(|err| AppError::internal(format!("failed to encode cache value: {err}")))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|err| AppError::internal(format!("failed to compress cache value: {err}")))?;
    let compressed = encoder
        .finish()
        .map_err(|err| AppError::internal(format!("failed to compress cache value: {err}")))?;

    Ok(STANDARD.encode(compressed))
}

/// Never fails: a blob that cannot be decoded comes back as a plain string.
pub fn decompress(blob: &str) -> Value {
    try_decompress(blob).unwrap_or_else(|| {
        tracing::warn!(len = blob.len(), "cache blob could not be decompressed");
        Value::String(blob.to_string())
    })
}

fn try_decompress(blob: &str) -> Option<Value> {
    let bytes = STANDARD.decode(blob).ok()?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw).ok()?;
    serde_json::from_slice(&raw).ok()
}
