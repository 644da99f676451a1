//! Inbound transport decompression.
//!
//! With `compress=zlib-stream` the gateway keeps one deflate context for the
//! whole connection and ends every message with a sync flush. Binary frames
//! are buffered until the `00 00 FF FF` suffix arrives.

use crate::config::Compression;
use crate::error::Error;
use flate2::{Decompress, FlushDecompress};

const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];
const INFLATE_CHUNK: usize = 32 * 1024;

/// Turns binary socket frames into text payloads.
pub trait Decompressor: Send {
    /// Feed one binary frame. Returns a payload once a full message is buffered.
    fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, Error>;

    /// Start over for a new connection.
    fn reset(&mut self);

    /// Value of the `compress` query parameter, if any.
    fn query_param(&self) -> Option<&'static str>;
}

/// Select the decompressor for a configured compression mode.
pub fn decompressor_for(compression: Compression) -> Box<dyn Decompressor> {
    match compression {
        Compression::None => Box::new(NoCompression),
        Compression::ZlibStream => Box::new(ZlibStream::new()),
    }
}

/// Binary frames are plain UTF-8.
#[derive(Debug, Default)]
pub struct NoCompression;

impl Decompressor for NoCompression {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, Error> {
        String::from_utf8(chunk.to_vec())
            .map(Some)
            .map_err(|e| Error::ProtocolViolation(format!("binary frame is not UTF-8: {}", e)))
    }

    fn reset(&mut self) {}

    fn query_param(&self) -> Option<&'static str> {
        None
    }
}

pub struct ZlibStream {
    inflate: Decompress,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for ZlibStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZlibStream")
            .field("buffered", &self.buffer.len())
            .field("total_in", &self.inflate.total_in())
            .finish()
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl ZlibStream {
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    fn inflate_buffered(&mut self) -> Result<Vec<u8>, Error> {
        let mut input: &[u8] = &self.buffer;
        let mut out = Vec::with_capacity((input.len() * 4).max(INFLATE_CHUNK));

        loop {
            if out.len() == out.capacity() {
                out.reserve(INFLATE_CHUNK);
            }
            let in_before = self.inflate.total_in();
            let out_before = out.len();

            self.inflate
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Decompression(e.to_string()))?;

            let consumed = (self.inflate.total_in() - in_before) as usize;
            input = &input[consumed..];
            let produced = out.len() - out_before;

            if input.is_empty() && out.len() < out.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        Ok(out)
    }
}

impl Decompressor for ZlibStream {
    fn push(&mut self, chunk: &[u8]) -> Result<Option<String>, Error> {
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let result = self.inflate_buffered();
        self.buffer.clear();
        let bytes = result?;

        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::Decompression(format!("inflated payload is not UTF-8: {}", e)))
    }

    fn reset(&mut self) {
        self.inflate.reset(true);
        self.buffer.clear();
    }

    fn query_param(&self) -> Option<&'static str> {
        Some("zlib-stream")
    }
}
