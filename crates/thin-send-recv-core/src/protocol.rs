//! Versioned binary stream framing: chunk header encode/decode and magic
//! negotiation.
//!
//! Header/body I/O goes through `std::io::Read`/`Write`, whose `read_exact`
//! and `write_all` already retry transparently on `ErrorKind::Interrupted`
//! (the EINTR case a hand-rolled retry loop would otherwise exist for) —
//! there is no need to duplicate that loop on top of the standard library's.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::types::StreamStats;

/// Current (sender) wire magic: protocol v1.1.
pub const MAGIC_V1_1: u64 = 0x24C4_F02A_AE2E_4FA9;
/// Previous wire magic: protocol v1.0 (legacy 24-byte header).
pub const MAGIC_V1_0: u64 = 0xCA7F_00D5_DE7E_C7ED;
/// Superseded magic: recognised only to produce a clear diagnostic, never accepted.
pub const MAGIC_SUPERSEDED: u64 = 0xE85B_C563_6CC7_2A05;

pub const CMD_DATA: u32 = 0;
pub const CMD_UNMAP: u32 = 1;
pub const CMD_BEGIN_STREAM: u32 = 2;
pub const CMD_END_STREAM: u32 = 3;
pub const CMD_FLAG_OPTIONAL_INFO: u32 = 0x8000_0000;

const HEADER_LEN_V1_1: usize = 28;
const HEADER_LEN_V1_0: usize = 24;
const STATS_BODY_LEN: usize = 24;

/// Which stream versions a receiver will accept. Maps to `--accept-stream-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptedFormat {
    #[default]
    Auto,
    V1_0,
    V1_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    V1_0,
    V1_1,
}

impl ProtocolVersion {
    fn header_len(self) -> usize {
        match self {
            ProtocolVersion::V1_0 => HEADER_LEN_V1_0,
            ProtocolVersion::V1_1 => HEADER_LEN_V1_1,
        }
    }
}

/// One 28-byte (v1.1) or 24-byte (v1.0) chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: u64,
    pub offset: u64,
    pub length: u64,
    pub cmd: u32,
}

impl ChunkHeader {
    pub fn is_optional_info(&self) -> bool {
        self.cmd & CMD_FLAG_OPTIONAL_INFO != 0
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stream magic {magic:#018x} is not recognised")]
    UnrecognizedMagic { magic: u64 },
    #[error("stream magic {magic:#018x} (v1.0 diagnostic-only build) is never accepted")]
    SupersededMagic { magic: u64 },
    #[error("stream uses v1.0 framing but receiver was restricted to v1.1")]
    RestrictedToV11,
    #[error("stream uses v1.1 framing but receiver was restricted to v1.0")]
    RestrictedToV10,
    #[error("magic changed mid-stream: negotiated {negotiated:#018x}, saw {found:#018x}")]
    MagicMismatch { negotiated: u64, found: u64 },
    #[error("v1.0 extent length {0} does not fit in the legacy 32-bit wire field")]
    V10LengthOverflow(u64),
    #[error("chunk read after END_STREAM ({len} trailing bytes)")]
    TrailingGarbage { len: usize },
    #[error("END_STREAM body length {found} does not match expected {expected}")]
    BadStatsBodyLength { found: usize, expected: usize },
    #[error("stream statistics mismatch: expected {expected:?}, received {found:?}")]
    StatsMismatch { expected: StreamStats, found: StreamStats },
    #[error("unknown mandatory command {cmd:#010x}")]
    UnknownMandatoryCommand { cmd: u32 },
    #[error("first chunk was not BEGIN_STREAM (cmd {cmd:#010x})")]
    FirstChunkNotBegin { cmd: u32 },
    #[error("BEGIN_STREAM seen more than once")]
    DuplicateBegin,
    #[error("stream ended with no END_STREAM chunk")]
    MissingEndStream,
    #[error("v1.1 stream contained zero chunks")]
    EmptyV11Stream,
}

/// Writes chunk headers/bodies for the sender. Always speaks v1.1: the
/// sender's magic is fixed to the current protocol version.
pub struct ChunkWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_header_raw(&mut self, header: &ChunkHeader) -> Result<(), ProtocolError> {
        let mut buf = [0u8; HEADER_LEN_V1_1];
        buf[0..8].copy_from_slice(&header.magic.to_be_bytes());
        buf[8..16].copy_from_slice(&header.offset.to_be_bytes());
        buf[16..24].copy_from_slice(&header.length.to_be_bytes());
        buf[24..28].copy_from_slice(&header.cmd.to_be_bytes());
        self.inner.write_all(&buf)?;
        Ok(())
    }

    pub fn write_begin_stream(&mut self) -> Result<(), ProtocolError> {
        self.write_header_raw(&ChunkHeader { magic: MAGIC_V1_1, offset: 0, length: 0, cmd: CMD_BEGIN_STREAM })
    }

    pub fn write_data_header(&mut self, offset: u64, length: u64) -> Result<(), ProtocolError> {
        self.write_header_raw(&ChunkHeader { magic: MAGIC_V1_1, offset, length, cmd: CMD_DATA })
    }

    pub fn write_data_body(&mut self, body: &[u8]) -> Result<(), ProtocolError> {
        self.inner.write_all(body)?;
        Ok(())
    }

    pub fn write_unmap(&mut self, offset: u64, length: u64) -> Result<(), ProtocolError> {
        self.write_header_raw(&ChunkHeader { magic: MAGIC_V1_1, offset, length, cmd: CMD_UNMAP })
    }

    pub fn write_end_stream(&mut self, stats: StreamStats) -> Result<(), ProtocolError> {
        self.write_header_raw(&ChunkHeader {
            magic: MAGIC_V1_1,
            offset: 0,
            length: STATS_BODY_LEN as u64,
            cmd: CMD_END_STREAM,
        })?;
        let mut body = [0u8; STATS_BODY_LEN];
        body[0..8].copy_from_slice(&stats.n_chunks.to_be_bytes());
        body[8..16].copy_from_slice(&stats.n_data.to_be_bytes());
        body[16..24].copy_from_slice(&stats.n_unmap.to_be_bytes());
        self.inner.write_all(&body)?;
        Ok(())
    }

    /// Writes a legacy v1.0 header. Only used by tests that need to produce a
    /// v1.0 fixture stream; the 32-bit on-wire length is checked for overflow
    /// rather than silently truncated, per the v1.0 compatibility note below.
    #[cfg(test)]
    pub fn write_header_v10(&mut self, offset: u64, length: u64, cmd: u32) -> Result<(), ProtocolError> {
        let length_u32: u32 =
            length.try_into().map_err(|_| ProtocolError::V10LengthOverflow(length))?;
        let mut buf = [0u8; HEADER_LEN_V1_0];
        buf[0..8].copy_from_slice(&MAGIC_V1_0.to_be_bytes());
        buf[8..16].copy_from_slice(&offset.to_be_bytes());
        buf[16..20].copy_from_slice(&length_u32.to_be_bytes());
        buf[20..24].copy_from_slice(&cmd.to_be_bytes());
        self.inner.write_all(&buf)?;
        Ok(())
    }
}

/// Reads and negotiates chunk headers for the receiver.
pub struct ChunkReader<R: Read> {
    inner: R,
    restrict: AcceptedFormat,
    negotiated: Option<(u64, ProtocolVersion)>,
    ended: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R, restrict: AcceptedFormat) -> Self {
        Self { inner, restrict, negotiated: None, ended: false }
    }

    pub fn negotiated_version(&self) -> Option<ProtocolVersion> {
        self.negotiated.map(|(_, v)| v)
    }
}

impl<R: Read + std::os::unix::io::AsRawFd> ChunkReader<R> {
    /// Exposes the channel's own descriptor so the caller can splice a DATA
    /// chunk's body straight into the target device via
    /// [`crate::copier::copy_range`], without buffering it through this
    /// reader. Only the header bytes have been consumed off this
    /// descriptor's stream position when a caller reaches for this.
    pub fn channel_fd(&self) -> &R {
        &self.inner
    }

    /// Reads the next bytes at most `buf.len()`, returning `Ok(n)` read.
    /// `Ok(0)` means clean EOF encountered before any byte was read.
    /// A short read (`0 < n < buf.len()`) after any byte was consumed is a
    /// truncation and is turned into an error by the caller.
    fn fill_from_start(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            match self.inner.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn negotiate_magic(&mut self, magic: u64) -> Result<ProtocolVersion, ProtocolError> {
        let version = match magic {
            MAGIC_V1_1 => ProtocolVersion::V1_1,
            MAGIC_V1_0 => ProtocolVersion::V1_0,
            MAGIC_SUPERSEDED => return Err(ProtocolError::SupersededMagic { magic }),
            other => return Err(ProtocolError::UnrecognizedMagic { magic: other }),
        };
        match (self.restrict, version) {
            (AcceptedFormat::V1_1, ProtocolVersion::V1_0) => return Err(ProtocolError::RestrictedToV11),
            (AcceptedFormat::V1_0, ProtocolVersion::V1_1) => return Err(ProtocolError::RestrictedToV10),
            _ => {}
        }
        self.negotiated = Some((magic, version));
        Ok(version)
    }

    /// Reads the next chunk header. `Ok(None)` is clean end-of-channel
    /// (expected only after an END_STREAM chunk has been seen).
    pub fn read_header(&mut self) -> Result<Option<ChunkHeader>, ProtocolError> {
        if self.ended {
            let mut probe = [0u8; 1];
            let n = self.fill_from_start(&mut probe)?;
            if n == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::TrailingGarbage { len: n });
        }

        let header = match self.negotiated {
            Some((magic, version)) => self.read_full_header(magic, version)?,
            None => {
                let mut magic_buf = [0u8; 8];
                let n = self.fill_from_start(&mut magic_buf)?;
                if n == 0 {
                    return Ok(None);
                }
                if n < 8 {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated chunk header",
                    )));
                }
                let magic = u64::from_be_bytes(magic_buf);
                let version = self.negotiate_magic(magic)?;
                self.read_rest_of_header(magic, version)?
            }
        };

        if header.cmd == CMD_END_STREAM {
            self.ended = true;
        }
        Ok(Some(header))
    }

    /// Reads the remainder of the very first header, after the 8-byte magic
    /// has already been consumed and negotiated.
    fn read_rest_of_header(&mut self, magic: u64, version: ProtocolVersion) -> Result<ChunkHeader, ProtocolError> {
        let remaining = version.header_len() - 8;
        let mut buf = vec![0u8; remaining];
        self.inner.read_exact(&mut buf)?;
        Ok(Self::decode_rest(magic, version, &buf))
    }

    /// Reads a full (magic-included) header for any chunk after the first.
    fn read_full_header(&mut self, expected_magic: u64, version: ProtocolVersion) -> Result<ChunkHeader, ProtocolError> {
        let mut buf = vec![0u8; version.header_len()];
        self.inner.read_exact(&mut buf)?;
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != expected_magic {
            return Err(ProtocolError::MagicMismatch { negotiated: expected_magic, found: magic });
        }
        Ok(Self::decode_rest(magic, version, &buf[8..]))
    }

    fn decode_rest(magic: u64, version: ProtocolVersion, rest: &[u8]) -> ChunkHeader {
        match version {
            ProtocolVersion::V1_1 => {
                let offset = u64::from_be_bytes(rest[0..8].try_into().unwrap());
                let length = u64::from_be_bytes(rest[8..16].try_into().unwrap());
                let cmd = u32::from_be_bytes(rest[16..20].try_into().unwrap());
                ChunkHeader { magic, offset, length, cmd }
            }
            ProtocolVersion::V1_0 => {
                let offset = u64::from_be_bytes(rest[0..8].try_into().unwrap());
                let length = u32::from_be_bytes(rest[8..12].try_into().unwrap()) as u64;
                let cmd = u32::from_be_bytes(rest[12..16].try_into().unwrap());
                ChunkHeader { magic, offset, length, cmd }
            }
        }
    }

    pub fn read_body(&mut self, len: u64) -> Result<Vec<u8>, ProtocolError> {
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_stats_body(&mut self, len: u64) -> Result<StreamStats, ProtocolError> {
        if len != STATS_BODY_LEN as u64 {
            return Err(ProtocolError::BadStatsBodyLength { found: len as usize, expected: STATS_BODY_LEN });
        }
        let mut buf = [0u8; STATS_BODY_LEN];
        self.inner.read_exact(&mut buf)?;
        Ok(StreamStats {
            n_chunks: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            n_data: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            n_unmap: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
        })
    }

    /// Silently drains `len` bytes for an unrecognised optional-info command.
    pub fn skip_body(&mut self, len: u64) -> Result<(), ProtocolError> {
        let mut remaining = len;
        let mut scratch = [0u8; 64 * 1024];
        while remaining > 0 {
            let take = remaining.min(scratch.len() as u64) as usize;
            self.inner.read_exact(&mut scratch[..take])?;
            remaining -= take as u64;
        }
        Ok(())
    }
}
