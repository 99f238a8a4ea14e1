//! Shells out to the pool-control collaborator: `dmsetup message` to
//! reserve/release a metadata snap, `lvchange` to toggle activation of the
//! second snapshot in diff mode. Grounded directly on the reference
//! implementation's `reserve_metadata_snap`/`release_metadata_snap`
//! (`dmsetup message %s-tpool 0 reserve_metadata_snap`) and its activation
//! toggle (`lvchange --ignoreactivationskip --activate y|n %s`).

use std::process::Command;

use thin_send_recv_core::critical_section::{PoolControl, PoolControlError};

/// Real `PoolControl`, invoking `dmsetup`/`lvchange` via `std::process::Command`.
pub struct ProcessPoolControl;

impl ProcessPoolControl {
    fn run(mut cmd: Command) -> Result<(), PoolControlError> {
        let status = cmd
            .status()
            .map_err(|e| PoolControlError(format!("failed to spawn {:?}: {e}", cmd.get_program())))?;
        if !status.success() {
            return Err(PoolControlError(format!("{:?} exited with {status}", cmd.get_program())));
        }
        Ok(())
    }
}

fn reserve_command(pool_name: &str) -> Command {
    let mut cmd = Command::new("dmsetup");
    cmd.args(["message", &format!("{pool_name}-tpool"), "0", "reserve_metadata_snap"]);
    cmd
}

fn release_command(pool_name: &str) -> Command {
    let mut cmd = Command::new("dmsetup");
    cmd.args(["message", &format!("{pool_name}-tpool"), "0", "release_metadata_snap"]);
    cmd
}

fn activation_command(pool_name: &str, active: bool) -> Command {
    let mut cmd = Command::new("lvchange");
    cmd.arg("--ignoreactivationskip");
    cmd.arg("--activate");
    cmd.arg(if active { "y" } else { "n" });
    cmd.arg(pool_name);
    cmd
}

impl PoolControl for ProcessPoolControl {
    fn reserve_metadata_snap(&self, pool_name: &str) -> Result<(), PoolControlError> {
        Self::run(reserve_command(pool_name))
    }

    fn release_metadata_snap(&self, pool_name: &str) -> Result<(), PoolControlError> {
        Self::run(release_command(pool_name))
    }

    /// `lvchange` activates/deactivates by LV identity, not by pool or thin
    /// id, so the caller passes the fully-qualified `vg/lv` name of the
    /// snapshot being toggled as `pool_name` here; `thin_id` is accepted for
    /// symmetry with the reserve/release calls but unused by this path (see
    /// DESIGN.md).
    fn set_active(&self, _thin_id: u32, pool_name: &str, active: bool) -> Result<(), PoolControlError> {
        Self::run(activation_command(pool_name, active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn reserve_command_targets_tpool_suffix() {
        let cmd = reserve_command("vg0-pool0");
        assert_eq!(cmd.get_program(), "dmsetup");
        assert_eq!(args_of(&cmd), vec!["message", "vg0-pool0-tpool", "0", "reserve_metadata_snap"]);
    }

    #[test]
    fn release_command_targets_tpool_suffix() {
        let cmd = release_command("vg0-pool0");
        assert_eq!(args_of(&cmd), vec!["message", "vg0-pool0-tpool", "0", "release_metadata_snap"]);
    }

    #[test]
    fn activation_command_toggles_y_or_n() {
        assert_eq!(
            args_of(&activation_command("vg0/snap2", true)),
            vec!["--ignoreactivationskip", "--activate", "y", "vg0/snap2"]
        );
        assert_eq!(
            args_of(&activation_command("vg0/snap2", false)),
            vec!["--ignoreactivationskip", "--activate", "n", "vg0/snap2"]
        );
    }
}
