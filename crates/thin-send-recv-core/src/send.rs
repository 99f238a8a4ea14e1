//! Wires parsed extents to the stream codec and bulk copier, emitting
//! BEGIN_STREAM, one chunk per extent, and END_STREAM.

use std::io::Write;
use std::os::unix::io::AsRawFd;

use thiserror::Error;

use crate::copier::{self, CopyError};
use crate::metadata::ParsedMetadata;
use crate::protocol::{ChunkWriter, ProtocolError};
use crate::types::{ExtentKind, StreamStats};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("copy error: {0}")]
    Copy(#[from] CopyError),
}

/// Streams every extent in `metadata` to `channel`, reading DATA_PRESENT
/// payload from `source` at the byte offset `extent_begin × block_size × 512`.
/// Returns the statistics the sender transmitted in END_STREAM, for the
/// caller to log.
pub fn send_stream<C: Write + AsRawFd>(
    metadata: &ParsedMetadata,
    source: &impl AsRawFd,
    channel: &mut C,
) -> Result<StreamStats, SendError> {
    let mut stats = StreamStats::new_for_send();

    ChunkWriter::new(&mut *channel).write_begin_stream()?;

    for extent in &metadata.extents {
        let offset = extent.byte_offset(metadata.block_size);
        let length = extent.byte_length(metadata.block_size);

        match extent.kind {
            ExtentKind::DataPresent => {
                ChunkWriter::new(&mut *channel).write_data_header(offset, length)?;
                if length > 0 {
                    copier::copy_range(source, Some(offset), channel, None, length)?;
                }
                stats.n_chunks += 1;
                stats.n_data += 1;
                log::debug!("sent CMD_DATA offset={offset} length={length}");
            }
            ExtentKind::DataAbsent => {
                ChunkWriter::new(&mut *channel).write_unmap(offset, length)?;
                stats.n_chunks += 1;
                stats.n_unmap += 1;
                log::debug!("sent CMD_UNMAP offset={offset} length={length}");
            }
        }
    }

    ChunkWriter::new(&mut *channel).write_end_stream(stats)?;
    log::info!(
        "stream complete: n_chunks={} n_data={} n_unmap={}",
        stats.n_chunks,
        stats.n_data,
        stats.n_unmap
    );
    Ok(stats)
}
