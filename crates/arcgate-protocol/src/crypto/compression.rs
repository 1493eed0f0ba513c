//! Payload compression.
//!
//! The encoder only compresses bodies at or above its threshold and
//! keeps the original when compression does not shrink it, so the
//! `COMPRESSED` flag always means "this body must be inflated".

use std::io::{Read, Write};

use crate::ProtocolError;

/// Upper bound on a single inflated body.
pub const DEFAULT_MAX_UNCOMPRESSED: usize = 16 * 1024 * 1024;

wire_enum! {
    /// Compression algorithm negotiated in `Hello`.
    pub enum Compression {
        #[default]
        None = 0,
        Gzip = 1,
        Deflate = 2,
        Brotli = 3,
        Lz4 = 4,
        Snappy = 5,
    }
}

/// Compresses and inflates bodies with one algorithm.
#[derive(Debug, Clone)]
pub struct CompressionModule {
    compression: Compression,
    max_uncompressed: usize,
}

fn compress_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Compress(e.to_string())
}

fn decompress_err(e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Decompress(e.to_string())
}

impl CompressionModule {
    pub fn new(compression: Compression) -> Result<Self, ProtocolError> {
        match compression {
            Compression::None => Err(ProtocolError::InvalidValue {
                field: "Compression",
                value: 0,
            }),
            #[cfg(not(feature = "brotli"))]
            Compression::Brotli => Err(ProtocolError::InvalidValue {
                field: "Compression",
                value: u64::from(u8::from(compression)),
            }),
            _ => Ok(Self {
                compression,
                max_uncompressed: DEFAULT_MAX_UNCOMPRESSED,
            }),
        }
    }

    /// Caps how large an inflated body may grow.
    pub fn with_max_uncompressed(mut self, max: usize) -> Self {
        self.max_uncompressed = max;
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn compress(&self, src: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self.compression {
            Compression::Gzip => {
                let mut enc =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(src).map_err(compress_err)?;
                enc.finish().map_err(compress_err)
            }
            Compression::Deflate => {
                let mut enc =
                    flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                enc.write_all(src).map_err(compress_err)?;
                enc.finish().map_err(compress_err)
            }
            #[cfg(feature = "brotli")]
            Compression::Brotli => {
                let mut enc = brotli::CompressorWriter::new(Vec::new(), 4096, 5, 22);
                enc.write_all(src).map_err(compress_err)?;
                enc.flush().map_err(compress_err)?;
                Ok(enc.into_inner())
            }
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(src)),
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(src)
                .map_err(compress_err),
            _ => Err(compress_err("compression not available")),
        }
    }

    pub fn uncompress(&self, src: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match self.compression {
            Compression::Gzip => self.read_limited(flate2::read::GzDecoder::new(src)),
            Compression::Deflate => self.read_limited(flate2::read::DeflateDecoder::new(src)),
            #[cfg(feature = "brotli")]
            Compression::Brotli => self.read_limited(brotli::Decompressor::new(src, 4096)),
            Compression::Lz4 => {
                let announced = src
                    .get(..4)
                    .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                    .ok_or_else(|| decompress_err("missing size prefix"))?;
                self.check_size(announced)?;
                lz4_flex::decompress_size_prepended(src).map_err(decompress_err)
            }
            Compression::Snappy => {
                let announced = snap::raw::decompress_len(src).map_err(decompress_err)?;
                self.check_size(announced)?;
                snap::raw::Decoder::new()
                    .decompress_vec(src)
                    .map_err(decompress_err)
            }
            _ => Err(decompress_err("compression not available")),
        }
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_uncompressed {
            return Err(decompress_err(format!(
                "inflated size {size} exceeds limit {}",
                self.max_uncompressed
            )));
        }
        Ok(())
    }

    fn read_limited(&self, reader: impl Read) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::new();
        reader
            .take(self.max_uncompressed as u64 + 1)
            .read_to_end(&mut out)
            .map_err(decompress_err)?;
        self.check_size(out.len())?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Compression; 5] = [
        Compression::Gzip,
        Compression::Deflate,
        Compression::Brotli,
        Compression::Lz4,
        Compression::Snappy,
    ];

    #[test]
    fn test_every_algorithm_restores_input() {
        let input = b"abcabcabcabcabcabcabcabcabcabcabcabcabcabc".repeat(20);
        for compression in ALL {
            let module = CompressionModule::new(compression).unwrap();
            let packed = module.compress(&input).unwrap();
            assert!(packed.len() < input.len(), "{compression:?} did not shrink");
            assert_eq!(module.uncompress(&packed).unwrap(), input);
        }
    }

    #[test]
    fn test_inflation_limit_is_enforced() {
        let input = vec![0u8; 64 * 1024];
        for compression in ALL {
            let module = CompressionModule::new(compression)
                .unwrap()
                .with_max_uncompressed(1024);
            let packed = module.compress(&input).unwrap();
            assert!(
                matches!(module.uncompress(&packed), Err(ProtocolError::Decompress(_))),
                "{compression:?} inflated past the limit"
            );
        }
    }

    #[test]
    fn test_garbage_fails_to_inflate() {
        let module = CompressionModule::new(Compression::Gzip).unwrap();
        assert!(module.uncompress(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_none_is_not_a_module() {
        assert!(CompressionModule::new(Compression::None).is_err());
    }
}
