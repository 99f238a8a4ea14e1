//! Issues `BLKDISCARD` in bounded sub-ranges so unmap progress stays visible
//! and cancellation stays responsive.

use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;

/// Discard sub-range size: bounds cancellation latency to roughly one
/// ioctl's worth of kernel work.
pub const DISCARD_CHUNK_BYTES: u64 = 1 << 30;

// BLKDISCARD's ioctl number, from <linux/fs.h>: _IO(0x12, 119).
const BLKDISCARD: libc::c_ulong = 0x1277;

#[derive(Debug, Error)]
pub enum DiscardError {
    #[error("discard ioctl failed at offset {offset} length {length}: {source}")]
    Ioctl { offset: u64, length: u64, #[source] source: std::io::Error },
}

/// Discards `[offset, offset + length)` on `target` in `DISCARD_CHUNK_BYTES`
/// sub-ranges. `EOPNOTSUPP` is swallowed (the range is treated as
/// best-effort-zero) unless `unsupported_is_fatal` is set.
pub fn discard_range(
    target: &impl AsRawFd,
    offset: u64,
    length: u64,
    unsupported_is_fatal: bool,
) -> Result<(), DiscardError> {
    let fd = target.as_raw_fd();
    let mut pos = offset;
    let end = offset + length;
    while pos < end {
        let chunk_len = (end - pos).min(DISCARD_CHUNK_BYTES);
        match issue_discard(fd, pos, chunk_len) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EOPNOTSUPP) && !unsupported_is_fatal => {
                log::warn!("discard not supported for offset={pos} length={chunk_len}, treating as best-effort-zero");
            }
            Err(source) => return Err(DiscardError::Ioctl { offset: pos, length: chunk_len, source }),
        }
        pos += chunk_len;
    }
    Ok(())
}

fn issue_discard(fd: RawFd, offset: u64, length: u64) -> std::io::Result<()> {
    let range: [u64; 2] = [offset, length];
    // SAFETY: `range` is a valid 2-element `u64` array as BLKDISCARD expects
    // ([start, length] in bytes); fd is a valid open block-device descriptor.
    let ret = unsafe { libc::ioctl(fd, BLKDISCARD, range.as_ptr()) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_covers_exact_multiples_and_remainder() {
        // 1 GiB + 1 byte must be split into a 1 GiB chunk and a 1-byte chunk.
        let mut chunks = Vec::new();
        let (offset, length) = (0u64, DISCARD_CHUNK_BYTES + 1);
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let chunk_len = (end - pos).min(DISCARD_CHUNK_BYTES);
            chunks.push(chunk_len);
            pos += chunk_len;
        }
        assert_eq!(chunks, vec![DISCARD_CHUNK_BYTES, 1]);
    }
}
