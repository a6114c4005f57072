//! Streaming inflate for `compress=zlib-stream` transports.

use crate::error::Error;
use crate::protocol::ZLIB_SUFFIX;
use flate2::{Decompress, FlushDecompress, Status};

/// Output growth per inflate pass
const INFLATE_CHUNK: usize = 32 * 1024;

/// Transport compression negotiated at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// Every WebSocket message is one complete frame
    #[default]
    None,
    /// One zlib context shared by every message of the transport
    ZlibStream,
}

impl Compression {
    /// Value of the `compress` query parameter, if any
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::ZlibStream => Some("zlib-stream"),
        }
    }
}

/// Reassembles frames from the inbound byte stream of one transport.
///
/// The inflate context holds the shared dictionary for the whole stream, so a
/// `Decompressor` must be created per transport and never reset in place.
pub struct Decompressor {
    mode: Compression,
    inflate: Decompress,
    buffer: Vec<u8>,
    /// Last bytes of the inbound stream, for markers split across chunks
    tail: Vec<u8>,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("mode", &self.mode)
            .field("total_in", &self.inflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl Decompressor {
    pub fn new(mode: Compression) -> Self {
        Self {
            mode,
            inflate: Decompress::new(true),
            buffer: Vec::new(),
            tail: Vec::with_capacity(ZLIB_SUFFIX.len() * 2),
        }
    }

    pub fn mode(&self) -> Compression {
        self.mode
    }

    /// Feed one inbound chunk.
    ///
    /// Returns the bytes of a complete frame when the stream read so far ends
    /// on a frame boundary, `None` while a frame is still being assembled.
    /// The boundary marker may be split across chunks. Any error leaves the
    /// context unusable.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if self.mode == Compression::None {
            return Ok(Some(chunk.to_vec()));
        }
        if chunk.is_empty() {
            return Ok(None);
        }

        let boundary = self.ends_on_boundary(chunk);
        let flush = if boundary {
            FlushDecompress::Sync
        } else {
            FlushDecompress::None
        };
        self.inflate_into_buffer(chunk, flush)?;

        if boundary {
            self.tail.clear();
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }

    /// Append `chunk` to the remembered tail and test it for the marker.
    fn ends_on_boundary(&mut self, chunk: &[u8]) -> bool {
        let width = ZLIB_SUFFIX.len();
        if chunk.len() >= width {
            self.tail.clear();
            self.tail.extend_from_slice(&chunk[chunk.len() - width..]);
        } else {
            self.tail.extend_from_slice(chunk);
            let excess = self.tail.len().saturating_sub(width);
            self.tail.drain(..excess);
        }
        self.tail == ZLIB_SUFFIX
    }

    fn inflate_into_buffer(&mut self, mut input: &[u8], flush: FlushDecompress) -> Result<(), Error> {
        loop {
            self.buffer.reserve(INFLATE_CHUNK);
            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();

            let status = self.inflate.decompress_vec(input, &mut self.buffer, flush)?;

            let consumed = (self.inflate.total_in() - in_before) as usize;
            let produced = self.inflate.total_out() - out_before;
            input = &input[consumed..];

            match status {
                Status::StreamEnd => return Ok(()),
                Status::BufError if consumed == 0 && produced == 0 => return Ok(()),
                _ => {}
            }

            // Output space left over means inflate has nothing pending
            if input.is_empty() && self.buffer.len() < self.buffer.capacity() {
                return Ok(());
            }
        }
    }
}
