//! Moves byte ranges between a block device and the channel.
//!
//! Three transfer strategies, chosen once per process and then reused for
//! every chunk:
//!
//! - direct kernel-to-kernel transfer (`splice(2)`) when either endpoint is a
//!   FIFO, looped until the requested length has moved;
//! - a staging pipe plus two `splice(2)` calls when neither endpoint is a
//!   FIFO, which keeps the copy zero-copy across two block-backed
//!   descriptors; each leg advises the kernel to drop written pages from
//!   cache afterwards (`posix_fadvise(..., POSIX_FADV_DONTNEED)`).
//!
//! Offsets are applied with `lseek` before the first byte moves; `off_in`/
//! `off_out` of `None` means "current file position."

use std::os::unix::io::{AsRawFd, RawFd};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("seek failed: {0}")]
    Seek(#[source] std::io::Error),
    #[error("splice returned 0 before {remaining} bytes were moved (truncated transfer)")]
    Truncated { remaining: u64 },
    #[error("i/o error during transfer: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create staging pipe: {0}")]
    PipeCreate(#[source] std::io::Error),
}

/// Seeks `fd` to `offset`, unless `offset` is `None` ("use current position").
fn seek_to(fd: RawFd, offset: Option<u64>) -> Result<(), CopyError> {
    let Some(offset) = offset else { return Ok(()) };
    // SAFETY: fd is a valid, open descriptor owned by the caller for the
    // duration of this call.
    let ret = unsafe { libc::lseek(fd, offset as libc::off_t, libc::SEEK_SET) };
    if ret < 0 {
        return Err(CopyError::Seek(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// `true` if the descriptor refers to a FIFO (named pipe or anonymous pipe).
pub fn is_fifo(fd: RawFd) -> std::io::Result<bool> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `st` is a validly-sized out parameter for `fstat`.
    let ret = unsafe { libc::fstat(fd, &mut st) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(st.st_mode & libc::S_IFMT == libc::S_IFIFO)
}

/// Copies `len` bytes from `input` at `off_in` to `output` at `off_out`.
///
/// Picks the direct splice path when either endpoint is a FIFO (splice
/// requires at least one side to be a pipe), otherwise stages the transfer
/// through a throwaway pipe so both legs can still avoid a userspace copy.
pub fn copy_range(
    input: &impl AsRawFd,
    off_in: Option<u64>,
    output: &impl AsRawFd,
    off_out: Option<u64>,
    len: u64,
) -> Result<(), CopyError> {
    let in_fd = input.as_raw_fd();
    let out_fd = output.as_raw_fd();

    seek_to(in_fd, off_in)?;
    seek_to(out_fd, off_out)?;

    if is_fifo(in_fd)? || is_fifo(out_fd)? {
        splice_direct(in_fd, out_fd, len)
    } else {
        splice_via_staging_pipe(in_fd, out_fd, len)
    }
}

/// Direct `splice(2)` loop: valid whenever at least one side is a pipe.
fn splice_direct(in_fd: RawFd, out_fd: RawFd, len: u64) -> Result<(), CopyError> {
    let mut remaining = len;
    while remaining > 0 {
        let n = raw_splice(in_fd, out_fd, remaining)?;
        if n == 0 {
            return Err(CopyError::Truncated { remaining });
        }
        remaining -= n;
    }
    Ok(())
}

/// Two-leg transfer through a private pipe, for block-device-to-block-device
/// copies where neither side is itself a pipe.
fn splice_via_staging_pipe(in_fd: RawFd, out_fd: RawFd, len: u64) -> Result<(), CopyError> {
    let (read_end, write_end) = make_staging_pipe()?;
    let mut remaining = len;
    while remaining > 0 {
        let staged = raw_splice(in_fd, write_end.0, remaining)?;
        if staged == 0 {
            return Err(CopyError::Truncated { remaining });
        }
        let mut left_in_pipe = staged;
        while left_in_pipe > 0 {
            let n = raw_splice(read_end.0, out_fd, left_in_pipe)?;
            if n == 0 {
                return Err(CopyError::Truncated { remaining: left_in_pipe });
            }
            left_in_pipe -= n;
        }
        drop_written_pages(out_fd);
        remaining -= staged;
    }
    Ok(())
}

/// Advises the kernel to evict the pages just written from the page cache.
/// Best-effort: a failure here doesn't affect correctness, only memory
/// pressure, so it is deliberately not propagated as an error.
fn drop_written_pages(fd: RawFd) {
    // SAFETY: fd is valid; offset/len 0 means "whole file" for fadvise.
    unsafe {
        libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_DONTNEED);
    }
}

struct PipeFd(RawFd);

impl Drop for PipeFd {
    fn drop(&mut self) {
        // SAFETY: fd was returned by pipe2(2) and not yet closed.
        unsafe {
            libc::close(self.0);
        }
    }
}

fn make_staging_pipe() -> Result<(PipeFd, PipeFd), CopyError> {
    let mut fds = [0i32; 2];
    // SAFETY: `fds` is a valid 2-element out array; O_CLOEXEC keeps the pipe
    // from leaking into child processes this tool may spawn.
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(CopyError::PipeCreate(std::io::Error::last_os_error()));
    }
    Ok((PipeFd(fds[0]), PipeFd(fds[1])))
}

/// One `splice(2)` call moving up to `len` bytes from `in_fd`'s current
/// position to `out_fd`'s current position (offsets were already applied by
/// the caller via `lseek`, so both offset pointers passed to the syscall are
/// null). Returns the number of bytes actually moved.
fn raw_splice(in_fd: RawFd, out_fd: RawFd, len: u64) -> Result<u64, CopyError> {
    loop {
        // SAFETY: in_fd/out_fd are valid open descriptors; null offset
        // pointers mean "use and advance the descriptor's file position."
        let ret = unsafe {
            libc::splice(
                in_fd,
                std::ptr::null_mut(),
                out_fd,
                std::ptr::null_mut(),
                len as usize,
                libc::SPLICE_F_MOVE,
            )
        };
        if ret >= 0 {
            return Ok(ret as u64);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(CopyError::Io(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn fifo_detection_on_regular_file_is_false() {
        let f = tempfile::tempfile().unwrap();
        assert!(!is_fifo(f.as_raw_fd()).unwrap());
    }

    #[test]
    fn fifo_detection_on_pipe_is_true() {
        let (r, w) = std::io::pipe().unwrap();
        assert!(is_fifo(r.as_raw_fd()).unwrap());
        assert!(is_fifo(w.as_raw_fd()).unwrap());
        drop(w);
    }

    #[test]
    fn copies_between_two_regular_files_via_staging_pipe() {
        let mut src = tempfile::tempfile().unwrap();
        let payload = vec![0xABu8; 4096];
        src.write_all(&payload).unwrap();
        src.flush().unwrap();

        let dst = tempfile::tempfile().unwrap();
        copy_range(&src, Some(0), &dst, Some(0), payload.len() as u64).unwrap();

        let mut dst = dst;
        dst.seek(SeekFrom::Start(0)).unwrap();
        let mut out = Vec::new();
        dst.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn copies_from_regular_file_into_pipe() {
        let mut src = tempfile::tempfile().unwrap();
        let payload = vec![0x5Au8; 1024];
        src.write_all(&payload).unwrap();
        src.flush().unwrap();

        let (mut r, w) = std::io::pipe().unwrap();
        copy_range(&src, Some(0), &w, None, payload.len() as u64).unwrap();
        drop(w);

        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }
}
