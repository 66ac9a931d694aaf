use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::common::{ClusterError, ClusterResult};

pub const NOTHING_COMPRESSION: &str = "nothing";
pub const GZIP_COMPRESSION: &str = "gzip";

/// Byte-to-byte transform applied to a record payload before it is split
/// into chunks, and reversed after the chain is reassembled.
pub trait Compression: Send + Sync {
    fn name(&self) -> &'static str;
    fn compress(&self, content: &[u8]) -> ClusterResult<Vec<u8>>;
    fn uncompress(&self, content: &[u8]) -> ClusterResult<Vec<u8>>;
}

pub struct NothingCompression;

impl Compression for NothingCompression {
    fn name(&self) -> &'static str {
        NOTHING_COMPRESSION
    }

    fn compress(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        Ok(content.to_vec())
    }

    fn uncompress(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        Ok(content.to_vec())
    }
}

pub struct GzipCompression;

impl Compression for GzipCompression {
    fn name(&self) -> &'static str {
        GZIP_COMPRESSION
    }

    fn compress(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(content)?;
        Ok(encoder.finish()?)
    }

    fn uncompress(&self, content: &[u8]) -> ClusterResult<Vec<u8>> {
        let mut decoder = GzDecoder::new(content);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ClusterError::Storage(format!("record content is broken: {}", e)))?;
        Ok(out)
    }
}

pub fn compression_by_name(name: &str) -> ClusterResult<Arc<dyn Compression>> {
    match name {
        NOTHING_COMPRESSION => Ok(Arc::new(NothingCompression)),
        GZIP_COMPRESSION => Ok(Arc::new(GzipCompression)),
        other => Err(ClusterError::InvalidAttribute(format!(
            "unknown compression method '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let gzip = GzipCompression;
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let packed = gzip.compress(&content).unwrap();
        assert!(packed.len() < content.len());
        assert_eq!(gzip.uncompress(&packed).unwrap(), content);
    }

    #[test]
    fn test_gzip_rejects_garbage() {
        let gzip = GzipCompression;
        assert!(gzip.uncompress(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(compression_by_name("gzip").unwrap().name(), "gzip");
        assert_eq!(compression_by_name("nothing").unwrap().name(), "nothing");
        assert!(compression_by_name("lzzzz").is_err());
    }
}
