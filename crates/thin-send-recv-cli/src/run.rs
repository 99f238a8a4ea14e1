//! Wires argument resolution to volume discovery, the critical section, dump
//! generation, and the core send/receive drivers.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

use thin_send_recv_core::critical_section::{create_unlinked_tmpfile, CriticalSection, DEFAULT_LOCK_PATH};
use thin_send_recv_core::metadata::Parser;
use thin_send_recv_core::protocol::AcceptedFormat;
use thin_send_recv_core::recv::{recv_stream, RecvOptions};
use thin_send_recv_core::send::send_stream;
use thin_send_recv_core::types::{SnapshotDescriptor, StreamStats};

use crate::cli::SendTarget;
use crate::dump::{generate_diff_dump, generate_full_dump};
use crate::error::AppError;
use crate::pool_control::ProcessPoolControl;
use crate::volume_info::{LvmVolumeInfo, VolumeInfo};

/// Template directory for the unlinked dump scratch file.
const TMP_DIR: &str = "/tmp";

fn ensure_not_tty(fd: RawFd, allow_tty: bool) -> Result<(), AppError> {
    if allow_tty {
        return Ok(());
    }
    // SAFETY: fd is a valid, open descriptor for the duration of this call.
    let is_tty = unsafe { libc::isatty(fd) } == 1;
    if is_tty { Err(AppError::RefusedTty) } else { Ok(()) }
}

fn open_source_direct(path: &str) -> io::Result<std::fs::File> {
    OpenOptions::new().read(true).custom_flags(libc::O_DIRECT | libc::O_CLOEXEC).open(path)
}

/// Wraps the process's stdin/stdout descriptor in an owned, unbuffered
/// `File`. `std::io::Stdin`/`Stdout` layer an 8 KiB `BufReader` and a
/// `LineWriter` over the raw descriptor; mixing that userspace buffer with
/// `copier::copy_range`'s raw-fd `splice` (which reads/writes the descriptor
/// directly, bypassing any buffer) reorders or drops bytes. Going through a
/// bare `File` instead means every read or write this process does to the
/// channel — header or payload alike — touches the descriptor directly, so
/// nothing can get stranded ahead of or behind a spliced payload.
///
/// SAFETY: `fd` is one of the process's own standard descriptors, open for
/// the life of the process; wrapping it in a `File` does not duplicate it,
/// so it is closed exactly once, when the returned `File` drops.
fn raw_channel(fd: RawFd) -> File {
    unsafe { File::from_raw_fd(fd) }
}

/// Toggles the second snapshot's activation for the duration of a diff send,
/// restoring it on drop if this guard is the one that activated it: if the
/// snapshot was inactive, it is activated for the duration of the send and
/// deactivated again afterwards.
struct ActivationGuard<'a> {
    pool_control: &'a ProcessPoolControl,
    snap_name: String,
    thin_id: u32,
    activated_by_us: bool,
}

impl<'a> ActivationGuard<'a> {
    fn for_snapshot(pool_control: &'a ProcessPoolControl, snap_name: &str, desc: &SnapshotDescriptor) -> Result<Self, AppError> {
        if !desc.active {
            pool_control.set_active(desc.thin_id, snap_name, true)?;
        }
        Ok(Self { pool_control, snap_name: snap_name.to_string(), thin_id: desc.thin_id, activated_by_us: !desc.active })
    }
}

impl<'a> Drop for ActivationGuard<'a> {
    fn drop(&mut self) {
        if self.activated_by_us {
            if let Err(e) = self.pool_control.set_active(self.thin_id, &self.snap_name, false) {
                log::warn!("failed to deactivate {}: {e}", self.snap_name);
            }
        }
    }
}

pub fn run_send(target: SendTarget, allow_tty: bool) -> Result<StreamStats, AppError> {
    ensure_not_tty(libc::STDOUT_FILENO, allow_tty)?;

    let volume_info = LvmVolumeInfo;
    let pool_control = ProcessPoolControl;

    let (metadata_text, source_path, _activation_guard) = match target {
        SendTarget::Diff { snap1, snap2 } => {
            let snap1_desc = volume_info.lookup(&snap1)?;
            let snap2_desc = volume_info.lookup(&snap2)?;

            let text = {
                let mut cs = CriticalSection::enter(&pool_control, &snap2_desc.pool_name, Path::new(DEFAULT_LOCK_PATH))?;
                let mut tmp = create_unlinked_tmpfile(Path::new(TMP_DIR))?;
                generate_diff_dump(&snap2_desc.dm_path, snap1_desc.thin_id, snap2_desc.thin_id, &mut tmp, || cs.check_signal().is_err())?
            };

            let guard = ActivationGuard::for_snapshot(&pool_control, &snap2, &snap2_desc)?;
            (text, snap2_desc.dm_path, Some(guard))
        }
        SendTarget::Dump { volume } => {
            let desc = volume_info.lookup(&volume)?;
            let text = {
                let mut cs = CriticalSection::enter(&pool_control, &desc.pool_name, Path::new(DEFAULT_LOCK_PATH))?;
                let mut tmp = create_unlinked_tmpfile(Path::new(TMP_DIR))?;
                generate_full_dump(&desc.dm_path, desc.thin_id, &mut tmp, || cs.check_signal().is_err())?
            };
            (text, desc.dm_path, None)
        }
    };

    let metadata = Parser::parse(&metadata_text)?;
    let source = open_source_direct(&source_path)?;
    let mut channel = raw_channel(libc::STDOUT_FILENO);
    let stats = send_stream(&metadata, &source, &mut channel)?;
    log::info!("send complete: n_chunks={} n_data={} n_unmap={}", stats.n_chunks, stats.n_data, stats.n_unmap);
    Ok(stats)
}

pub fn run_receive(volume: String, accept_format: AcceptedFormat, allow_tty: bool) -> Result<StreamStats, AppError> {
    ensure_not_tty(libc::STDIN_FILENO, allow_tty)?;

    let volume_info = LvmVolumeInfo;
    let desc = volume_info.lookup(&volume)?;
    let target_path = format!("/dev/{}/{}", desc.vg_name, desc.lv_name);
    let target = OpenOptions::new().write(true).custom_flags(libc::O_CLOEXEC).open(&target_path)?;

    let channel = raw_channel(libc::STDIN_FILENO);
    let options = RecvOptions { accept_format, discard_unsupported_is_fatal: false };
    let stats = recv_stream(channel, &target, options)?;
    log::info!("receive complete: n_chunks={} n_data={} n_unmap={}", stats.n_chunks, stats.n_data, stats.n_unmap);
    Ok(stats)
}
