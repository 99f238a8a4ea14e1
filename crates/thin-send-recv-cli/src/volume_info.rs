//! Volume-identity discovery: the `lvs`-equivalent query collaborator this
//! tool delegates to, kept behind a trait so the driver logic in
//! [`crate::cli`] never shells out directly.

use std::process::Command;

use thiserror::Error;

use thin_send_recv_core::types::SnapshotDescriptor;

#[derive(Debug, Error)]
pub enum VolumeInfoError {
    #[error("failed to invoke volume-info query: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("volume-info query exited with status {0}")]
    QueryFailed(std::process::ExitStatus),
    #[error("could not parse volume-info output line: {0:?}")]
    UnparsableLine(String),
}

/// Looks up a logical volume's identity and physical layout. Grounded on
/// `lvs --noheadings -o vg_name,lv_name,pool_lv,lv_dm_path,thin_id,attr`:
/// VG name, LV name, pool name, dm path, thin id, and an attr string whose
/// 5th character is `a` when the volume is active.
pub trait VolumeInfo {
    fn lookup(&self, vg_slash_lv: &str) -> Result<SnapshotDescriptor, VolumeInfoError>;
}

/// Default implementation: shells out to `lvs`.
pub struct LvmVolumeInfo;

impl VolumeInfo for LvmVolumeInfo {
    fn lookup(&self, vg_slash_lv: &str) -> Result<SnapshotDescriptor, VolumeInfoError> {
        let output = Command::new("lvs")
            .arg("--noheadings")
            .arg("-o")
            .arg("vg_name,lv_name,pool_lv,lv_dm_path,thin_id,attr")
            .arg(vg_slash_lv)
            .output()
            .map_err(VolumeInfoError::Spawn)?;
        if !output.status.success() {
            return Err(VolumeInfoError::QueryFailed(output.status));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or("");
        parse_lvs_line(line)
    }
}

/// Parses one line of `lvs --noheadings -o vg_name,lv_name,pool_lv,lv_dm_path,thin_id,attr`
/// output: six whitespace-separated fields, the last an LVM attr string whose
/// 5th character is `a` when the volume is active.
fn parse_lvs_line(line: &str) -> Result<SnapshotDescriptor, VolumeInfoError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let [vg_name, lv_name, pool_name, dm_path, thin_id, attr] = fields.as_slice() else {
        return Err(VolumeInfoError::UnparsableLine(line.to_string()));
    };
    let thin_id: u32 =
        thin_id.parse().map_err(|_| VolumeInfoError::UnparsableLine(line.to_string()))?;
    let active = attr.chars().nth(4) == Some('a');
    Ok(SnapshotDescriptor {
        vg_name: vg_name.to_string(),
        lv_name: lv_name.to_string(),
        pool_name: pool_name.to_string(),
        dm_path: dm_path.to_string(),
        thin_id,
        active,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_active_volume_line() {
        let line = "  vg0   thin1   pool0   /dev/mapper/vg0-thin1   3   Vwi-a-tz--";
        let snap = parse_lvs_line(line).unwrap();
        assert_eq!(snap.vg_name, "vg0");
        assert_eq!(snap.lv_name, "thin1");
        assert_eq!(snap.pool_name, "pool0");
        assert_eq!(snap.dm_path, "/dev/mapper/vg0-thin1");
        assert_eq!(snap.thin_id, 3);
        assert!(snap.active);
    }

    #[test]
    fn parses_inactive_volume_line() {
        let line = "vg0 thin2 pool0 /dev/mapper/vg0-thin2 4 Vwi---tz--";
        let snap = parse_lvs_line(line).unwrap();
        assert!(!snap.active);
    }

    #[test]
    fn rejects_line_with_too_few_fields() {
        let err = parse_lvs_line("vg0 thin1 pool0").unwrap_err();
        assert!(matches!(err, VolumeInfoError::UnparsableLine(_)));
    }
}
