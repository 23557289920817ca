//! Record compression.
//!
//! A connection negotiates one [`CompressionType`] during the handshake and
//! both ends hold a [`Compressor`] of that type for its lifetime. The zlib
//! variant is a single stream per direction flushed at every record, so
//! records must be decompressed in the order they were compressed.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::error::{FrameError, Result};

/// Negotiated compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionType {
    #[default]
    None,
    Zlib,
    Lz4,
}

impl CompressionType {
    /// Wire code used in the connection ack.
    pub fn code(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zlib => 1,
            Self::Lz4 => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::None),
            1 => Some(Self::Zlib),
            2 => Some(Self::Lz4),
            _ => None,
        }
    }

    /// Bit advertised in the connection request's compression bitmap.
    pub fn bitmap_bit(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Zlib => 0x01,
            Self::Lz4 => 0x02,
        }
    }

    /// Messages shorter than this are sent uncompressed.
    pub fn default_threshold(self) -> usize {
        match self {
            Self::None => usize::MAX,
            Self::Zlib => 30,
            Self::Lz4 => 300,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zlib => "zlib",
            Self::Lz4 => "lz4",
        }
    }
}

impl std::str::FromStr for CompressionType {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "zlib" => Ok(Self::Zlib),
            "lz4" => Ok(Self::Lz4),
            other => Err(FrameError::InvalidArgument(format!(
                "unknown compression type {other:?}"
            ))),
        }
    }
}

/// Compress/decompress capability consumed by the read and write paths.
pub trait Compressor: Send {
    fn compression_type(&self) -> CompressionType;

    /// Upper bound of the compressed size of `len` input bytes.
    fn max_compressed_length(&self, len: usize) -> usize;

    /// Compress `src`, appending to `dst`. Returns the bytes appended.
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize>;

    /// Decompress `src` into `dst`. Returns the bytes written.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize>;
}

/// Build the compressor for a negotiated type and level (0-9, zlib only).
pub fn compressor_for(kind: CompressionType, level: u32) -> Box<dyn Compressor> {
    match kind {
        CompressionType::None => Box::new(NoCompressor),
        CompressionType::Zlib => Box::new(ZlibCompressor::new(level)),
        CompressionType::Lz4 => Box::new(Lz4Compressor),
    }
}

/// Identity transform for uncompressed connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCompressor;

impl Compressor for NoCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn max_compressed_length(&self, len: usize) -> usize {
        len
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        dst.extend_from_slice(src);
        Ok(src.len())
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let out = dst
            .get_mut(..src.len())
            .ok_or_else(|| FrameError::Decompress("output buffer too small".to_string()))?;
        out.copy_from_slice(src);
        Ok(src.len())
    }
}

/// Stateful zlib stream with a sync flush after every record.
pub struct ZlibCompressor {
    deflate: Compress,
    inflate: Decompress,
}

impl ZlibCompressor {
    pub fn new(level: u32) -> Self {
        Self {
            deflate: Compress::new(Compression::new(level.min(9)), true),
            inflate: Decompress::new(true),
        }
    }
}

impl std::fmt::Debug for ZlibCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibCompressor")
            .field("total_in", &self.deflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .finish()
    }
}

impl Compressor for ZlibCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zlib
    }

    fn max_compressed_length(&self, len: usize) -> usize {
        // deflate stored-block bound plus stream header and sync marker
        len + len / 1000 + 64
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let start = dst.len();
        dst.reserve(self.max_compressed_length(src.len()));

        let mut input = src;
        loop {
            let before_in = self.deflate.total_in();
            self.deflate
                .compress_vec(input, dst, FlushCompress::Sync)
                .map_err(|e| FrameError::Compress(e.to_string()))?;
            let consumed = (self.deflate.total_in() - before_in) as usize;
            input = &input[consumed..];

            // Flush is complete once zlib stops short of the spare capacity.
            if input.is_empty() && dst.len() < dst.capacity() {
                break;
            }
            dst.reserve(1024);
        }
        Ok(dst.len() - start)
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut read = 0;
        let mut written = 0;
        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            self.inflate
                .decompress(&src[read..], &mut dst[written..], FlushDecompress::Sync)
                .map_err(|e| FrameError::Decompress(e.to_string()))?;
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            read += consumed;
            written += produced;

            if read == src.len() {
                return Ok(written);
            }
            if consumed == 0 && produced == 0 {
                return Err(FrameError::Decompress(
                    "output buffer too small for inflated record".to_string(),
                ));
            }
        }
    }
}

/// LZ4 block compression; each record is an independent block.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn max_compressed_length(&self, len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(len)
    }

    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<usize> {
        let start = dst.len();
        dst.resize(start + self.max_compressed_length(src.len()), 0);
        let written = lz4_flex::block::compress_into(src, &mut dst[start..])
            .map_err(|e| FrameError::Compress(e.to_string()))?;
        dst.truncate(start + written);
        Ok(written)
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4_flex::block::decompress_into(src, dst).map_err(|e| FrameError::Decompress(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        b"MarketPrice BID 101.25 ASK 101.27 "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }

    #[test]
    fn test_zlib_stream_across_records() {
        let mut sender = ZlibCompressor::new(6);
        let mut receiver = ZlibCompressor::new(6);

        for len in [40, 500, 4000] {
            let payload = sample(len);
            let mut wire = Vec::new();
            sender.compress(&payload, &mut wire).unwrap();
            assert!(wire.len() <= sender.max_compressed_length(len));
            if len >= 500 {
                assert!(wire.len() < payload.len() / 4);
            }

            let mut out = vec![0u8; len];
            let n = receiver.decompress(&wire, &mut out).unwrap();
            assert_eq!(&out[..n], &payload[..]);
        }
    }

    #[test]
    fn test_zlib_rejects_garbage() {
        let mut receiver = ZlibCompressor::new(6);
        let mut out = [0u8; 64];
        let result = receiver.decompress(&[0xFF, 0xFF, 0xFF, 0xFF], &mut out);
        assert!(matches!(result, Err(FrameError::Decompress(_))));
    }

    #[test]
    fn test_lz4_block() {
        let mut lz4 = Lz4Compressor;
        let payload = sample(2000);
        let mut wire = Vec::new();
        lz4.compress(&payload, &mut wire).unwrap();
        assert!(wire.len() <= lz4.max_compressed_length(payload.len()));

        let mut out = vec![0u8; 2000];
        let n = lz4.decompress(&wire, &mut out).unwrap();
        assert_eq!(&out[..n], &payload[..]);
    }

    #[test]
    fn test_lz4_output_too_small() {
        let mut lz4 = Lz4Compressor;
        let mut wire = Vec::new();
        lz4.compress(&sample(1000), &mut wire).unwrap();
        let mut out = vec![0u8; 10];
        assert!(lz4.decompress(&wire, &mut out).is_err());
    }

    #[test]
    fn test_none_copies() {
        let mut none = NoCompressor;
        let mut wire = Vec::new();
        assert_eq!(none.compress(b"abc", &mut wire).unwrap(), 3);
        let mut out = [0u8; 2];
        assert!(none.decompress(&wire, &mut out).is_err());
    }

    #[test]
    fn test_type_codes_and_names() {
        for kind in [CompressionType::None, CompressionType::Zlib, CompressionType::Lz4] {
            assert_eq!(CompressionType::from_code(kind.code()), Some(kind));
            assert_eq!(kind.name().parse::<CompressionType>().unwrap(), kind);
            assert_eq!(compressor_for(kind, 6).compression_type(), kind);
        }
        assert_eq!(CompressionType::from_code(9), None);
    }
}
