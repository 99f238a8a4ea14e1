//! Dispatches chunks read from the channel, applying DATA writes and UNMAP
//! discards to the target volume, and verifying statistics at END_STREAM
//! at END_STREAM.

use std::io::Read;
use std::os::unix::io::AsRawFd;

use thiserror::Error;

use crate::copier::{self, CopyError};
use crate::discard::{discard_range, DiscardError};
use crate::protocol::{
    AcceptedFormat, ChunkReader, ProtocolError, ProtocolVersion, CMD_BEGIN_STREAM, CMD_DATA, CMD_END_STREAM,
    CMD_FLAG_OPTIONAL_INFO, CMD_UNMAP,
};
use crate::types::StreamStats;

#[derive(Debug, Error)]
pub enum RecvError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("copy error: {0}")]
    Copy(#[from] CopyError),
    #[error("discard error: {0}")]
    Discard(#[from] DiscardError),
    #[error(transparent)]
    Policy(#[from] RecvPolicyError),
}

/// Receive-driver policy decisions (ordering, unknown mandatory commands) —
/// kept distinct from [`ProtocolError`], which is strictly codec/framing.
#[derive(Debug, Error)]
pub enum RecvPolicyError {
    #[error("BEGIN_STREAM was not the first chunk (cmd {cmd:#010x})")]
    FirstChunkNotBegin { cmd: u32 },
    #[error("duplicate BEGIN_STREAM")]
    DuplicateBegin,
    #[error("stream statistics mismatch: expected {expected:?}, received {received:?}")]
    StatsMismatch { expected: StreamStats, received: StreamStats },
    #[error("unknown mandatory command {cmd:#010x}")]
    UnknownMandatoryCommand { cmd: u32 },
    #[error("stream ended without an END_STREAM chunk")]
    MissingEndStream,
    #[error("v1.1 stream contained zero chunks")]
    EmptyV11Stream,
}

/// Receiver-side configuration: magic restriction and whether an
/// unsupported discard is tolerated or fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecvOptions {
    pub accept_format: AcceptedFormat,
    pub discard_unsupported_is_fatal: bool,
}

/// Reads and applies every chunk from `channel` to `target`, returning the
/// final statistics on success. `channel` must be fd-backed (a real pipe,
/// socket, or file) so DATA bodies can be spliced straight into `target`
/// without being buffered through this process.
pub fn recv_stream<R: Read + AsRawFd, T: AsRawFd>(
    channel: R,
    target: &T,
    options: RecvOptions,
) -> Result<StreamStats, RecvError> {
    let mut reader = ChunkReader::new(channel, options.accept_format);
    let mut stats = StreamStats::default();
    let mut seen_begin = false;
    let mut seen_end = false;

    while let Some(header) = reader.read_header()? {
        stats.n_chunks += 1;

        match header.cmd {
            CMD_BEGIN_STREAM => {
                let first_chunk = stats.n_chunks == 1;
                let v10 = reader.negotiated_version() == Some(ProtocolVersion::V1_0);
                if seen_begin {
                    return Err(RecvPolicyError::DuplicateBegin.into());
                }
                if !first_chunk && !v10 {
                    return Err(RecvPolicyError::FirstChunkNotBegin { cmd: header.cmd }.into());
                }
                seen_begin = true;
                log::debug!("received BEGIN_STREAM");
            }
            CMD_DATA => {
                if header.length > 0 {
                    copier::copy_range(reader.channel_fd(), None, target, Some(header.offset), header.length)?;
                }
                stats.n_data += 1;
                log::debug!("received CMD_DATA offset={} length={}", header.offset, header.length);
            }
            CMD_UNMAP => {
                discard_range(target, header.offset, header.length, options.discard_unsupported_is_fatal)?;
                stats.n_unmap += 1;
                log::debug!("received CMD_UNMAP offset={} length={}", header.offset, header.length);
            }
            CMD_END_STREAM => {
                let received = reader.read_stats_body(header.length)?;
                if received != stats {
                    return Err(RecvPolicyError::StatsMismatch { expected: stats, received }.into());
                }
                seen_end = true;
                log::info!(
                    "END_STREAM verified: n_chunks={} n_data={} n_unmap={}",
                    stats.n_chunks,
                    stats.n_data,
                    stats.n_unmap
                );
            }
            other if other & CMD_FLAG_OPTIONAL_INFO != 0 => {
                reader.skip_body(header.length)?;
                log::debug!("skipped optional-info chunk cmd={other:#010x} length={}", header.length);
            }
            other => {
                return Err(RecvPolicyError::UnknownMandatoryCommand { cmd: other }.into());
            }
        }
    }

    if seen_begin && !seen_end {
        return Err(RecvPolicyError::MissingEndStream.into());
    }
    if reader.negotiated_version() == Some(ProtocolVersion::V1_1) && stats.n_chunks == 0 {
        return Err(RecvPolicyError::EmptyV11Stream.into());
    }

    Ok(stats)
}
