//! Top-level error type the binary's `main` matches on to pick an exit code:
//! 0 success, 10 operational failure, 20 metadata-parse failure.

use thiserror::Error;

use thin_send_recv_core::critical_section::{CriticalSectionError, PoolControlError};
use thin_send_recv_core::metadata::MetadataError;
use thin_send_recv_core::recv::RecvError;
use thin_send_recv_core::send::SendError;

use crate::cli::{ArgCountError, DirectionError};
use crate::dump::DumpError;
use crate::volume_info::VolumeInfoError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Direction(#[from] DirectionError),
    #[error(transparent)]
    ArgCount(#[from] ArgCountError),
    #[error(transparent)]
    VolumeInfo(#[from] VolumeInfoError),
    #[error(transparent)]
    CriticalSection(#[from] CriticalSectionError),
    #[error("failed to toggle snapshot activation: {0}")]
    Activation(#[from] PoolControlError),
    #[error(transparent)]
    Dump(#[from] DumpError),
    #[error("failed to parse metadata dump: {0}")]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Recv(#[from] RecvError),
    #[error("refusing to use a terminal as the stream channel (pass --allow-tty to override)")]
    RefusedTty,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Maps this error to its process exit code: 20 for a metadata-parse
    /// failure, 10 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Metadata(_) => 20,
            _ => 10,
        }
    }
}
