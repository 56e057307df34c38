//! Incremental frame reassembly for both tracker families.
//!
//! A [`FrameReader`] buffers whatever the socket produced and yields one
//! complete, checksum-verified frame at a time. Framing problems are
//! always recoverable: the offending bytes are dropped and the caller is
//! expected to keep the connection open — trackers retransmit on their own
//! cadence.
//!
//! Resynchronization policy is deliberately blunt: a frame that fails its
//! checksum is discarded whole, and a buffer that grows past
//! [`MAX_BUFFERED`] without containing a parseable frame is dropped
//! entirely (soft reset). No sliding-window marker hunt.

use bytes::{Buf, BytesMut};

use crate::checksum::{crc16_itu, crc16_kermit};

/// Safety ceiling for unparsed buffered bytes.
pub const MAX_BUFFERED: usize = 10 * 1024;

/// Which wire family a listener port speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// GT06-style marker-delimited frames (JM-LL301).
    Jimi,
    /// Length-prefixed framed-records (FM/ECO series).
    Ruptela,
}

/// One complete on-wire frame, markers and checksum included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub family: ProtocolFamily,
    pub bytes: Vec<u8>,
}

/// Framing failures. Every variant is recoverable: the reader has already
/// dropped the offending bytes and the connection can continue.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad start marker 0x{found:04X}")]
    BadStartMarker { found: u16 },
    #[error("bad end marker")]
    BadEndMarker,
    #[error("checksum mismatch: frame carries 0x{carried:04X}, computed 0x{computed:04X}")]
    ChecksumMismatch { carried: u16, computed: u16 },
    #[error("unparseable buffer exceeded {MAX_BUFFERED} bytes, dropped {dropped}")]
    BufferReset { dropped: usize },
}

/// Per-connection stream reassembler.
#[derive(Debug)]
pub struct FrameReader {
    family: ProtocolFamily,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(family: ProtocolFamily) -> Self {
        FrameReader {
            family,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    /// Number of bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append raw socket bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Try to extract the next complete frame.
    ///
    /// `Ok(None)` means the buffer does not yet hold a full frame; push more
    /// bytes and call again. After an `Err` the offending bytes are gone and
    /// the reader is ready for the next frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match self.family {
            ProtocolFamily::Jimi => self.next_jimi(),
            ProtocolFamily::Ruptela => self.next_ruptela(),
        }
    }

    fn next_jimi(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 5 {
            return self.need_more();
        }
        let marker = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        // Total size: markers (2 start + 2 end) + length field + declared L.
        let total = match marker {
            0x7878 => self.buf[2] as usize + 5,
            0x7979 => {
                if self.buf.len() < 6 {
                    return self.need_more();
                }
                u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize + 6
            }
            found => {
                // Without a marker there is no frame boundary to skip to.
                self.buf.clear();
                return Err(FrameError::BadStartMarker { found });
            }
        };
        if total > MAX_BUFFERED {
            return self.reset();
        }
        if self.buf.len() < total {
            return self.need_more();
        }
        if self.buf[total - 2] != 0x0D || self.buf[total - 1] != 0x0A {
            self.buf.advance(total);
            return Err(FrameError::BadEndMarker);
        }
        let computed = crc16_itu(&self.buf[2..total - 4]);
        let carried = u16::from_be_bytes([self.buf[total - 4], self.buf[total - 3]]);
        if computed != carried {
            self.buf.advance(total);
            return Err(FrameError::ChecksumMismatch { carried, computed });
        }
        let bytes = self.buf.split_to(total).to_vec();
        Ok(Some(Frame {
            family: ProtocolFamily::Jimi,
            bytes,
        }))
    }

    fn next_ruptela(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < 8 {
            return self.need_more();
        }
        // Length field + declared payload + trailing CRC.
        let total = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize + 4;
        if total > MAX_BUFFERED {
            return self.reset();
        }
        if self.buf.len() < total {
            return self.need_more();
        }
        let computed = crc16_kermit(&self.buf[2..total - 2]);
        let carried = u16::from_be_bytes([self.buf[total - 2], self.buf[total - 1]]);
        if computed != carried {
            self.buf.advance(total);
            return Err(FrameError::ChecksumMismatch { carried, computed });
        }
        let bytes = self.buf.split_to(total).to_vec();
        Ok(Some(Frame {
            family: ProtocolFamily::Ruptela,
            bytes,
        }))
    }

    fn need_more(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() > MAX_BUFFERED {
            return self.reset();
        }
        Ok(None)
    }

    fn reset(&mut self) -> Result<Option<Frame>, FrameError> {
        let dropped = self.buf.len();
        self.buf.clear();
        Err(FrameError::BufferReset { dropped })
    }
}
