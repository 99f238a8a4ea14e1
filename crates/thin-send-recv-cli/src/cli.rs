//! Argument parsing and send/receive direction resolution.
//!
//! Two invocation forms, selectable by `--send`/`--receive` or by the
//! invoking binary name containing `send` / `recv|receive`:
//! `send [options] SNAP1 SNAP2` (diff), `send [options] VOLUME` (dump),
//! `recv [options] VOLUME`.

use clap::{Parser, ValueEnum};
use thiserror::Error;

use thin_send_recv_core::protocol::AcceptedFormat;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AcceptFormatArg {
    Auto,
    #[value(name = "1.0")]
    V1_0,
    #[value(name = "1.1")]
    V1_1,
}

impl From<AcceptFormatArg> for AcceptedFormat {
    fn from(arg: AcceptFormatArg) -> Self {
        match arg {
            AcceptFormatArg::Auto => AcceptedFormat::Auto,
            AcceptFormatArg::V1_0 => AcceptedFormat::V1_0,
            AcceptFormatArg::V1_1 => AcceptedFormat::V1_1,
        }
    }
}

/// Replicates a thin-provisioned LVM volume, in full or as an incremental
/// diff between two snapshots, by streaming the wire protocol between a
/// sender and receiver process.
#[derive(Debug, Parser)]
#[command(name = "thin-send-recv", version)]
pub struct Cli {
    /// Act as the sender.
    #[arg(long)]
    pub send: bool,

    /// Act as the receiver.
    #[arg(long)]
    pub receive: bool,

    /// Print a one-line description of the tool and exit.
    #[arg(long)]
    pub about: bool,

    /// Permit a terminal as the stream channel (normally refused, since a
    /// binary stream to/from a tty is almost always a mistake).
    #[arg(long)]
    pub allow_tty: bool,

    /// Which wire-format versions the receiver will accept.
    #[arg(long, value_enum, default_value = "auto")]
    pub accept_stream_format: AcceptFormatArg,

    /// SNAP1 SNAP2 for a diff send, VOLUME for a dump send or a receive.
    pub volumes: Vec<String>,
}

pub const ABOUT_TEXT: &str =
    "thin-send-recv: streams a thin-provisioned LVM volume, or the incremental diff between two of its snapshots, over an arbitrary byte channel.";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectionError {
    #[error("--send and --receive are mutually exclusive")]
    BothFlagsSet,
    #[error("could not determine send/receive direction: pass --send/--receive, or invoke this binary under a name containing \"send\" or \"recv\"/\"receive\"")]
    Indeterminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Resolves the operating direction from explicit flags first, falling back
/// to a substring match on the invoking binary's name.
pub fn resolve_direction(argv0: &str, send_flag: bool, receive_flag: bool) -> Result<Direction, DirectionError> {
    if send_flag && receive_flag {
        return Err(DirectionError::BothFlagsSet);
    }
    if send_flag {
        return Ok(Direction::Send);
    }
    if receive_flag {
        return Ok(Direction::Receive);
    }
    let name = argv0.rsplit(['/', '\\']).next().unwrap_or(argv0).to_lowercase();
    if name.contains("recv") || name.contains("receive") {
        Ok(Direction::Receive)
    } else if name.contains("send") {
        Ok(Direction::Send)
    } else {
        Err(DirectionError::Indeterminate)
    }
}

/// What a `send` invocation's positional arguments mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    Diff { snap1: String, snap2: String },
    Dump { volume: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgCountError {
    #[error("send expects SNAP1 SNAP2 (diff) or VOLUME (dump), got {0} argument(s)")]
    Send(usize),
    #[error("receive expects exactly one VOLUME argument, got {0}")]
    Receive(usize),
}

pub fn parse_send_target(volumes: &[String]) -> Result<SendTarget, ArgCountError> {
    match volumes {
        [snap1, snap2] => Ok(SendTarget::Diff { snap1: snap1.clone(), snap2: snap2.clone() }),
        [volume] => Ok(SendTarget::Dump { volume: volume.clone() }),
        other => Err(ArgCountError::Send(other.len())),
    }
}

pub fn parse_receive_target(volumes: &[String]) -> Result<String, ArgCountError> {
    match volumes {
        [volume] => Ok(volume.clone()),
        other => Err(ArgCountError::Receive(other.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_flags_win_over_binary_name() {
        assert_eq!(resolve_direction("thin-recv", true, false).unwrap(), Direction::Send);
        assert_eq!(resolve_direction("thin-send", false, true).unwrap(), Direction::Receive);
    }

    #[test]
    fn both_flags_is_an_error() {
        assert_eq!(resolve_direction("whatever", true, true).unwrap_err(), DirectionError::BothFlagsSet);
    }

    #[test]
    fn binary_name_dispatch_recognises_send_and_receive_variants() {
        assert_eq!(resolve_direction("/usr/sbin/thin-send-recv-send", false, false).unwrap(), Direction::Send);
        assert_eq!(resolve_direction("thin_recv", false, false).unwrap(), Direction::Receive);
        assert_eq!(resolve_direction("thin-receive", false, false).unwrap(), Direction::Receive);
    }

    #[test]
    fn indeterminate_binary_name_without_flags_is_an_error() {
        assert_eq!(resolve_direction("thin-tool", false, false).unwrap_err(), DirectionError::Indeterminate);
    }

    #[test]
    fn two_positional_args_parse_as_diff() {
        let target = parse_send_target(&["vg0/snap1".to_string(), "vg0/snap2".to_string()]).unwrap();
        assert_eq!(target, SendTarget::Diff { snap1: "vg0/snap1".to_string(), snap2: "vg0/snap2".to_string() });
    }

    #[test]
    fn one_positional_arg_parses_as_dump() {
        let target = parse_send_target(&["vg0/vol".to_string()]).unwrap();
        assert_eq!(target, SendTarget::Dump { volume: "vg0/vol".to_string() });
    }

    #[test]
    fn zero_or_three_positional_args_is_an_error() {
        assert!(parse_send_target(&[]).is_err());
        assert!(parse_send_target(&["a".to_string(), "b".to_string(), "c".to_string()]).is_err());
    }

    #[test]
    fn receive_requires_exactly_one_argument() {
        assert!(parse_receive_target(&["vg0/vol".to_string()]).is_ok());
        assert!(parse_receive_target(&[]).is_err());
        assert!(parse_receive_target(&["a".to_string(), "b".to_string()]).is_err());
    }
}
