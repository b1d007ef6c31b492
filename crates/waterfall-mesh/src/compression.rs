//! Concrete compression backends behind the wire codec's negotiated
//! [`CompressionMethod`] flags. `waterfall-core::protocol` only knows the
//! [`Compressor`] capability; this module is where gzip/zlib/bz2/lzma are
//! actually wired up, grounded in the "opaque encode/decode functions"
//! non-goal from `SPEC_FULL.md` §4.1.

use std::io::{self, Read, Write};
use waterfall_core::flags::CompressionMethod;
use waterfall_core::protocol::Compressor;

/// The compression methods this node is willing to use, in preference
/// order. Used both to advertise support in a handshake and to decide,
/// for a given peer, which method (if any) to compress outgoing frames
/// with.
pub const LOCAL_SUPPORTED: [CompressionMethod; 4] = [
    CompressionMethod::Gzip,
    CompressionMethod::Zlib,
    CompressionMethod::Bz2,
    CompressionMethod::Lzma,
];

pub struct GzipCompressor;
impl Compressor for GzipCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Gzip
    }
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let _ = encoder.write_all(data);
        encoder.finish().unwrap_or_default()
    }
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct ZlibCompressor;
impl Compressor for ZlibCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Zlib
    }
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        let _ = encoder.write_all(data);
        encoder.finish().unwrap_or_default()
    }
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct Bz2Compressor;
impl Compressor for Bz2Compressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Bz2
    }
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        let _ = encoder.write_all(data);
        encoder.finish().unwrap_or_default()
    }
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

pub struct LzmaCompressor;
impl Compressor for LzmaCompressor {
    fn method(&self) -> CompressionMethod {
        CompressionMethod::Lzma
    }
    fn compress(&self, data: &[u8]) -> Vec<u8> {
        let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let _ = encoder.write_all(data);
        encoder.finish().unwrap_or_default()
    }
    fn decompress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        xz2::read::XzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// One fresh `Compressor` per call for every method this node supports, in
/// [`LOCAL_SUPPORTED`] order — used by the decode path, which tries each
/// in turn before falling back to plaintext.
pub fn all_supported() -> Vec<Box<dyn Compressor>> {
    vec![
        Box::new(GzipCompressor),
        Box::new(ZlibCompressor),
        Box::new(Bz2Compressor),
        Box::new(LzmaCompressor),
    ]
}

/// The `Compressor` implementation for one specific method, used by the
/// encode path once a method has been negotiated.
pub fn by_method(method: CompressionMethod) -> Box<dyn Compressor> {
    match method {
        CompressionMethod::Gzip => Box::new(GzipCompressor),
        CompressionMethod::Zlib => Box::new(ZlibCompressor),
        CompressionMethod::Bz2 => Box::new(Bz2Compressor),
        CompressionMethod::Lzma => Box::new(LzmaCompressor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_method_roundtrips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        for method in LOCAL_SUPPORTED {
            let compressor = by_method(method);
            let compressed = compressor.compress(&data);
            let decompressed = compressor.decompress(&compressed).unwrap();
            assert_eq!(decompressed, data, "method {:?} failed to roundtrip", method);
        }
    }
}
