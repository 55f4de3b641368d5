//! Compression of captured command output before storage.
//!
//! Output is gzip-compressed and base64-encoded so it fits a text column.
//! An empty stored payload means compression failed; the execution record
//! is still written.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Errors from encoding or decoding captured output.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Compression failed: {0}")]
    Compress(#[source] std::io::Error),

    #[error("Invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Decompression failed: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Reversible transform applied to output before it is persisted.
pub trait OutputCodec: Send + Sync {
    fn compress(&self, output: &str) -> Result<String, CodecError>;

    fn decompress(&self, stored: &str) -> Result<String, CodecError>;
}

/// gzip + base64, the format stored in `execution_records.output`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipBase64;

impl OutputCodec for GzipBase64 {
    fn compress(&self, output: &str) -> Result<String, CodecError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(output.as_bytes())
            .map_err(CodecError::Compress)?;
        let bytes = encoder.finish().map_err(CodecError::Compress)?;
        Ok(STANDARD.encode(bytes))
    }

    fn decompress(&self, stored: &str) -> Result<String, CodecError> {
        if stored.is_empty() {
            return Ok(String::new());
        }
        let bytes = STANDARD.decode(stored)?;
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(CodecError::Decompress)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_base64_restores_output() {
        let codec = GzipBase64;
        let output = "line 1\nline 2\n\u{2713} done\n".repeat(50);

        let stored = codec.compress(&output).unwrap();
        assert!(!stored.contains('\n'));
        assert!(stored.len() < output.len());
        assert_eq!(codec.decompress(&stored).unwrap(), output);
    }

    #[test]
    fn test_empty_payload_is_empty_output() {
        assert_eq!(GzipBase64.decompress("").unwrap(), "");
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(matches!(
            GzipBase64.decompress("not base64 !!"),
            Err(CodecError::Base64(_))
        ));
        // Valid base64, not gzip.
        assert!(matches!(
            GzipBase64.decompress("aGVsbG8="),
            Err(CodecError::Decompress(_))
        ));
    }
}
