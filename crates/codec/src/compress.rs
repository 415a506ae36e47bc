//! zlib compression of segment plaintext, applied before encryption.

use std::borrow::Cow;
use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{CodecError, Result};

/// Outcome recorded alongside the segment row for capacity planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub original_size: usize,
    pub output_size: usize,
    pub compressed: bool,
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(CodecError::Compression)?;
    encoder.finish().map_err(CodecError::Compression)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(CodecError::Decompression)?;
    Ok(out)
}

/// Compress only when it actually shrinks the body; incompressible
/// segments ride through untouched.
pub fn compress_if_smaller(data: &[u8]) -> Result<(Cow<'_, [u8]>, CompressionOutcome)> {
    let compressed = compress(data)?;
    if compressed.len() < data.len() {
        let outcome = CompressionOutcome {
            original_size: data.len(),
            output_size: compressed.len(),
            compressed: true,
        };
        debug!(
            original = outcome.original_size,
            output = outcome.output_size,
            "segment compressed"
        );
        Ok((Cow::Owned(compressed), outcome))
    } else {
        let outcome = CompressionOutcome {
            original_size: data.len(),
            output_size: data.len(),
            compressed: false,
        };
        Ok((Cow::Borrowed(data), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let data = b"the quick brown fox ".repeat(500);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn incompressible_data_is_passed_through() {
        // High-entropy input: zlib output would be larger.
        let data: Vec<u8> = (0..4096u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let (out, outcome) = compress_if_smaller(&data).unwrap();
        if !outcome.compressed {
            assert_eq!(out.as_ref(), data.as_slice());
            assert_eq!(outcome.output_size, data.len());
        }
    }

    #[test]
    fn compressible_data_is_compressed() {
        let data = vec![0u8; 100_000];
        let (out, outcome) = compress_if_smaller(&data).unwrap();
        assert!(outcome.compressed);
        assert!(out.len() < data.len());
        assert_eq!(decompress(&out).unwrap(), data);
    }

    #[test]
    fn garbage_fails_decompression() {
        assert!(matches!(
            decompress(b"definitely not zlib"),
            Err(CodecError::Decompression(_))
        ));
    }
}
