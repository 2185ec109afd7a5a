//! Envelope body codecs

use std::sync::Arc;

use bytes::Bytes;

use rivulet_common::config::CodecKind;
use rivulet_common::error::{Error, Result};

/// Transforms serialized bodies on their way into and out of a stream
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, raw: &[u8]) -> Result<Bytes>;

    fn decode(&self, encoded: &[u8]) -> Result<Bytes>;
}

/// Stores bodies as-is
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl Codec for PlainCodec {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(raw))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(encoded))
    }
}

/// LZ4 block compression with the uncompressed size prepended
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Codec;

impl Codec for Lz4Codec {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn encode(&self, raw: &[u8]) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(raw)))
    }

    fn decode(&self, encoded: &[u8]) -> Result<Bytes> {
        lz4_flex::decompress_size_prepended(encoded)
            .map(Bytes::from)
            .map_err(|e| Error::Codec(format!("LZ4 decompression failed: {}", e)))
    }
}

/// Codec selected by configuration
pub fn for_kind(kind: CodecKind) -> Arc<dyn Codec> {
    match kind {
        CodecKind::Plain => Arc::new(PlainCodec),
        CodecKind::Lz4 => Arc::new(Lz4Codec),
    }
}
