//! Invokes the external metadata-dump generators (delegated to the existing
//! pool-metadata tools), capturing their stdout into the caller's unlinked
//! temp file. Grounded directly on the reference implementation's
//! `thin_delta -m --snap1 .. --snap2 .. <pool>_tmeta` and
//! `thin_dump -m --dev-id .. <pool>_tmeta` invocations.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

/// How often the dump-tool wait loop checks for a pending fatal signal.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: &'static str, #[source] source: std::io::Error },
    #[error("{program} exited with {status}")]
    ToolFailed { program: &'static str, status: std::process::ExitStatus },
    #[error("failed to read generated dump: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} interrupted by a fatal signal")]
    Interrupted { program: &'static str },
}

/// Runs `thin_delta -m --snap1 S1 --snap2 S2 <pool>_tmeta`, capturing stdout
/// into `tmp` (already open, unlinked, close-on-exec). `check_signal` is
/// polled while waiting for the tool to exit and, if it reports a fatal
/// signal arrived, the tool is killed and the call returns
/// `DumpError::Interrupted` instead of waiting further.
pub fn generate_diff_dump(
    pool_dm_path: &str,
    snap1_id: u32,
    snap2_id: u32,
    tmp: &mut File,
    check_signal: impl FnMut() -> bool,
) -> Result<String, DumpError> {
    run_capturing("thin_delta", &diff_dump_args(pool_dm_path, snap1_id, snap2_id), tmp, check_signal)
}

/// Runs `thin_dump -m --dev-id ID <pool>_tmeta`, capturing stdout into `tmp`.
/// See [`generate_diff_dump`] for `check_signal`'s contract.
pub fn generate_full_dump(
    pool_dm_path: &str,
    thin_id: u32,
    tmp: &mut File,
    check_signal: impl FnMut() -> bool,
) -> Result<String, DumpError> {
    run_capturing("thin_dump", &full_dump_args(pool_dm_path, thin_id), tmp, check_signal)
}

fn diff_dump_args(pool_dm_path: &str, snap1_id: u32, snap2_id: u32) -> Vec<String> {
    vec![
        "-m".to_string(),
        "--snap1".to_string(),
        snap1_id.to_string(),
        "--snap2".to_string(),
        snap2_id.to_string(),
        format!("{pool_dm_path}_tmeta"),
    ]
}

fn full_dump_args(pool_dm_path: &str, thin_id: u32) -> Vec<String> {
    vec!["-m".to_string(), "--dev-id".to_string(), thin_id.to_string(), format!("{pool_dm_path}_tmeta")]
}

/// Spawns `program` and waits for it via a poll loop rather than a single
/// blocking `Command::status()` call: `std`'s own wait retries on `EINTR`
/// internally without ever returning control to us, so a plain `status()`
/// call gives the caller no chance to notice a fatal signal until the tool
/// happens to exit on its own. Polling with `try_wait` turns the wait into a
/// real checkpoint `check_signal` can be consulted at.
fn run_capturing(
    program: &'static str,
    args: &[String],
    tmp: &mut File,
    mut check_signal: impl FnMut() -> bool,
) -> Result<String, DumpError> {
    let stdout_handle = tmp.try_clone()?;
    log::debug!("invoking {program} {args:?}");
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::from(stdout_handle))
        .spawn()
        .map_err(|source| DumpError::Spawn { program, source })?;

    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if check_signal() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DumpError::Interrupted { program });
        }
        std::thread::sleep(SIGNAL_POLL_INTERVAL);
    };
    if !status.success() {
        return Err(DumpError::ToolFailed { program, status });
    }
    tmp.seek(SeekFrom::Start(0))?;
    let mut text = String::new();
    tmp.read_to_string(&mut text)?;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_dump_args_name_both_snapshot_ids_and_tmeta_device() {
        assert_eq!(
            diff_dump_args("/dev/mapper/vg0-pool0_tpool0", 3, 4),
            vec!["-m", "--snap1", "3", "--snap2", "4", "/dev/mapper/vg0-pool0_tpool0_tmeta"]
        );
    }

    #[test]
    fn full_dump_args_name_the_single_dev_id() {
        assert_eq!(full_dump_args("/dev/mapper/vg0-pool0_tpool0", 7), vec!["-m", "--dev-id", "7", "/dev/mapper/vg0-pool0_tpool0_tmeta"]);
    }
}
