//! Compression codec registry.
//!
//! Codecs are selected by name at write time; the TOC records the names
//! so readers resolve blocks back to the same codec. Codec index 0 always
//! means uncompressed and never appears in the registry.

use iostore_core::{Error, Result};
use std::io::{Read, Write};
use std::sync::Arc;

/// A block compressor/decompressor.
///
/// `decompress` fills `dst` exactly; block records carry the
/// uncompressed size, so partial output is a corruption error.
pub trait CompressionCodec: Send + Sync {
    /// Registry name, as recorded in the TOC method table.
    fn name(&self) -> &'static str;

    /// Compress `src` into a fresh buffer.
    fn compress(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `src`, filling `dst` exactly.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()>;
}

/// Deflate (zlib framing) codec.
pub struct ZlibCodec {
    level: u32,
}

impl ZlibCodec {
    /// Codec with an explicit compression level (0-9).
    pub fn new(level: u32) -> Self {
        ZlibCodec { level }
    }
}

impl Default for ZlibCodec {
    fn default() -> Self {
        ZlibCodec { level: 6 }
    }
}

impl CompressionCodec for ZlibCodec {
    fn name(&self) -> &'static str {
        "Zlib"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder
            .write_all(src)
            .map_err(|e| Error::CompressionError(format!("zlib compress: {}", e)))?;
        encoder
            .finish()
            .map_err(|e| Error::CompressionError(format!("zlib compress: {}", e)))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let mut decoder = flate2::read::ZlibDecoder::new(src);
        decoder
            .read_exact(dst)
            .map_err(|e| Error::CompressionError(format!("zlib decompress: {}", e)))?;
        let mut excess = [0u8; 1];
        let extra = decoder
            .read(&mut excess)
            .map_err(|e| Error::CompressionError(format!("zlib decompress: {}", e)))?;
        if extra != 0 {
            return Err(Error::CompressionError(
                "zlib stream longer than recorded uncompressed size".to_string(),
            ));
        }
        Ok(())
    }
}

/// Zstandard codec.
pub struct ZstdCodec {
    level: i32,
}

impl ZstdCodec {
    /// Codec with an explicit compression level.
    pub fn new(level: i32) -> Self {
        ZstdCodec { level }
    }
}

impl Default for ZstdCodec {
    fn default() -> Self {
        ZstdCodec { level: 3 }
    }
}

impl CompressionCodec for ZstdCodec {
    fn name(&self) -> &'static str {
        "Zstd"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>> {
        zstd::bulk::compress(src, self.level)
            .map_err(|e| Error::CompressionError(format!("zstd compress: {}", e)))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<()> {
        let written = zstd::bulk::decompress_to_buffer(src, dst)
            .map_err(|e| Error::CompressionError(format!("zstd decompress: {}", e)))?;
        if written != dst.len() {
            return Err(Error::CompressionError(format!(
                "zstd produced {} bytes, expected {}",
                written,
                dst.len()
            )));
        }
        Ok(())
    }
}

/// Codec lookup by name.
///
/// The default registry carries Zlib and Zstd. Registries are explicit
/// values (no process-wide singleton); readers and writer settings hold
/// one, typically shared through an `Arc`.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: Vec<Arc<dyn CompressionCodec>>,
}

impl CodecRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        CodecRegistry { codecs: Vec::new() }
    }

    /// Add a codec. Replaces any codec already registered under the same
    /// name.
    pub fn register(&mut self, codec: Arc<dyn CompressionCodec>) {
        self.codecs.retain(|c| c.name() != codec.name());
        self.codecs.push(codec);
    }

    /// Look up a codec by its TOC method name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CompressionCodec>> {
        self.codecs.iter().find(|c| c.name() == name).cloned()
    }

    /// Names of all registered codecs.
    pub fn names(&self) -> Vec<&'static str> {
        self.codecs.iter().map(|c| c.name()).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut registry = CodecRegistry::empty();
        registry.register(Arc::new(ZlibCodec::default()));
        registry.register(Arc::new(ZstdCodec::default()));
        registry
    }
}
