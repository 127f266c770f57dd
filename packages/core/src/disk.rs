//! Block-device scanning via lsblk.
//!
//! Scanning is read-only and unprivileged. The scanner reports every
//! partition on the system; [`filter_mountable_devices`] narrows the list to
//! the NTFS/exFAT partitions this tool can manage.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::error::{Error, IoResultExt, Result};
use crate::fstab::MountIdentity;

/// One partition as reported by lsblk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name, e.g. "nvme0n1p2" or "sda1".
    pub name: String,
    /// Volume label, if set.
    pub label: Option<String>,
    /// Filesystem UUID as reported (original case).
    pub uuid: Option<String>,
    /// Partition UUID as reported (original case).
    pub partuuid: Option<String>,
    /// Filesystem type, e.g. "ntfs", "exfat".
    pub fstype: Option<String>,
    /// Current mount point, if mounted.
    pub mountpoint: Option<String>,
    /// Size in bytes.
    pub size: u64,
    /// Rotational medium (HDD).
    pub rota: bool,
    /// Removable device flag.
    pub removable: bool,
    /// Transport, e.g. "usb", "nvme", "sata".
    pub transport: Option<String>,
    /// Full device node path, e.g. "/dev/sda1".
    pub path: PathBuf,
}

impl BlockDevice {
    /// The identity this device would be managed under: UUID when present,
    /// PARTUUID otherwise. Values are lowercase-normalized by construction.
    pub fn identity(&self) -> Option<MountIdentity> {
        self.uuid
            .as_deref()
            .map(MountIdentity::uuid)
            .or_else(|| self.partuuid.as_deref().map(MountIdentity::partuuid))
    }

    /// Like [`identity`](Self::identity), but an error when the device has
    /// neither a UUID nor a PARTUUID.
    pub fn require_identity(&self) -> Result<MountIdentity> {
        self.identity().ok_or_else(|| Error::InvalidIdentity {
            message: format!("device {} has no UUID or PARTUUID", self.name),
        })
    }

    /// A directory name suggestion for the mount point: the sanitized label,
    /// else a UUID prefix, else the kernel name.
    pub fn suggested_mount_name(&self) -> String {
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty()) {
            return sanitize_mount_name(label);
        }
        if let Some(uuid) = &self.uuid {
            return uuid.to_lowercase().chars().take(8).collect();
        }
        self.name.clone()
    }

    pub fn is_ntfs(&self) -> bool {
        matches!(self.fstype.as_deref(), Some("ntfs") | Some("ntfs3"))
    }

    pub fn is_exfat(&self) -> bool {
        self.fstype.as_deref() == Some("exfat")
    }

    /// Whether this tool manages this kind of partition at all.
    pub fn is_mountable(&self) -> bool {
        self.is_ntfs() || self.is_exfat()
    }

    pub fn is_mounted(&self) -> bool {
        self.mountpoint.is_some()
    }
}

/// Sanitizes a label for use as a mount directory name.
fn sanitize_mount_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Maps a detected filesystem to the kernel driver used in fstab.
pub fn fstype_to_vfs_type(fstype: &str) -> &str {
    match fstype {
        "ntfs" => "ntfs3",
        other => other,
    }
}

/// Maps an fstab vfs type back to the detected filesystem name.
pub fn vfs_type_to_fstype(vfs_type: &str) -> &str {
    match vfs_type {
        "ntfs3" => "ntfs",
        other => other,
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    rota: Option<bool>,
    #[serde(default, rename = "rm")]
    removable: Option<bool>,
    #[serde(default, rename = "tran")]
    transport: Option<String>,
    #[serde(rename = "type")]
    device_type: Option<String>,
    #[serde(default)]
    children: Option<Vec<LsblkDevice>>,
}

/// Lists all partitions by running `lsblk --json --bytes`.
pub fn list_block_devices() -> Result<Vec<BlockDevice>> {
    let output = Command::new("lsblk")
        .args([
            "--json",
            "--bytes",
            "--output",
            "NAME,LABEL,UUID,PARTUUID,FSTYPE,MOUNTPOINT,SIZE,TYPE,ROTA,RM,TRAN",
        ])
        .output()
        .command_context("lsblk")?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: "lsblk".to_string(),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    parse_lsblk(&String::from_utf8_lossy(&output.stdout))
}

fn parse_lsblk(json: &str) -> Result<Vec<BlockDevice>> {
    let parsed: LsblkOutput = serde_json::from_str(json).map_err(|e| Error::LsblkParse {
        message: e.to_string(),
    })?;

    let mut devices = Vec::new();
    collect_partitions(&parsed.blockdevices, None, &mut devices);
    Ok(devices)
}

/// Walks the lsblk tree, keeping partitions. Transport and rotational flags
/// usually live on the parent disk, so they are inherited downwards.
fn collect_partitions(
    nodes: &[LsblkDevice],
    parent: Option<(&Option<String>, Option<bool>)>,
    devices: &mut Vec<BlockDevice>,
) {
    for node in nodes {
        if node.device_type.as_deref() == Some("part") {
            let (parent_tran, parent_rota) = parent.unwrap_or((&None, None));
            devices.push(BlockDevice {
                name: node.name.clone(),
                label: node.label.clone(),
                uuid: node.uuid.clone(),
                partuuid: node.partuuid.clone(),
                fstype: node.fstype.clone(),
                mountpoint: node.mountpoint.clone(),
                size: node.size.unwrap_or(0),
                rota: node.rota.or(parent_rota).unwrap_or(false),
                removable: node.removable.unwrap_or(false),
                transport: node.transport.clone().or_else(|| parent_tran.clone()),
                path: PathBuf::from(format!("/dev/{}", node.name)),
            });
        }

        if let Some(children) = &node.children {
            collect_partitions(children, Some((&node.transport, node.rota)), devices);
        }
    }
}

/// Narrows a scan to the partitions this tool can manage.
pub fn filter_mountable_devices(devices: &[BlockDevice]) -> Vec<&BlockDevice> {
    devices.iter().filter(|d| d.is_mountable()).collect()
}

/// Finds an online partition whose identity matches.
pub fn find_device_by_identity(identity: &MountIdentity) -> Result<Option<BlockDevice>> {
    let devices = list_block_devices()?;
    Ok(devices
        .into_iter()
        .find(|d| d.identity().as_ref() == Some(identity)))
}

/// Checks that the identity's `/dev/disk/by-*` lookup path exists, i.e. the
/// device would actually resolve at boot.
pub fn validate_identity(identity: &MountIdentity) -> Result<()> {
    use crate::fstab::IdentityKind;

    let base = match identity.kind() {
        IdentityKind::Uuid => Path::new("/dev/disk/by-uuid"),
        IdentityKind::Partuuid => Path::new("/dev/disk/by-partuuid"),
    };
    let link = base.join(identity.value());
    if link.exists() {
        return Ok(());
    }
    Err(Error::InvalidIdentity {
        message: format!("{identity} does not resolve at {}", link.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_LSBLK_JSON: &str = r#"{
        "blockdevices": [
            {
                "name": "nvme0n1",
                "size": 500107862016,
                "type": "disk",
                "rota": false,
                "rm": false,
                "tran": "nvme",
                "children": [
                    {
                        "name": "nvme0n1p1",
                        "label": "EFI",
                        "uuid": "1234-5678",
                        "partuuid": "11111111-0001",
                        "fstype": "vfat",
                        "mountpoint": "/boot/efi",
                        "size": 536870912,
                        "type": "part",
                        "rota": false,
                        "rm": false
                    },
                    {
                        "name": "nvme0n1p2",
                        "label": "Games",
                        "uuid": "AABBCCDD11223344",
                        "partuuid": "11111111-0002",
                        "fstype": "ntfs",
                        "mountpoint": null,
                        "size": 499570991104,
                        "type": "part",
                        "rota": false,
                        "rm": false
                    }
                ]
            },
            {
                "name": "sda",
                "size": 128849018880,
                "type": "disk",
                "rota": false,
                "rm": true,
                "tran": "usb",
                "children": [
                    {
                        "name": "sda1",
                        "label": "PORTABLE",
                        "uuid": "DEAD-BEEF",
                        "partuuid": "22222222-0001",
                        "fstype": "exfat",
                        "mountpoint": null,
                        "size": 128849018880,
                        "type": "part",
                        "rota": false,
                        "rm": true
                    }
                ]
            }
        ]
    }"#;

    #[test]
    fn parses_partitions_with_inherited_transport() {
        let devices = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        assert_eq!(devices.len(), 3);

        let games = devices.iter().find(|d| d.name == "nvme0n1p2").unwrap();
        assert_eq!(games.label.as_deref(), Some("Games"));
        assert!(games.is_ntfs());
        assert!(games.is_mountable());
        assert!(!games.is_mounted());
        assert_eq!(games.transport.as_deref(), Some("nvme"));
        assert_eq!(games.path, PathBuf::from("/dev/nvme0n1p2"));

        let portable = devices.iter().find(|d| d.name == "sda1").unwrap();
        assert!(portable.is_exfat());
        assert!(portable.removable);
        assert_eq!(portable.transport.as_deref(), Some("usb"));

        let efi = devices.iter().find(|d| d.name == "nvme0n1p1").unwrap();
        assert!(!efi.is_mountable());
    }

    #[test]
    fn filter_keeps_only_manageable_filesystems() {
        let devices = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        let mountable = filter_mountable_devices(&devices);
        assert_eq!(mountable.len(), 2);
        assert!(mountable.iter().all(|d| d.is_mountable()));
    }

    #[test]
    fn identity_prefers_uuid_and_lowercases() {
        let devices = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        let games = devices.iter().find(|d| d.name == "nvme0n1p2").unwrap();

        let identity = games.identity().unwrap();
        assert_eq!(identity.spec(), "UUID=aabbccdd11223344");

        let mut no_uuid = games.clone();
        no_uuid.uuid = None;
        assert_eq!(
            no_uuid.identity().unwrap().spec(),
            "PARTUUID=11111111-0002"
        );

        no_uuid.partuuid = None;
        assert!(no_uuid.identity().is_none());
        assert!(no_uuid.require_identity().is_err());
    }

    #[test]
    fn suggested_mount_names() {
        let devices = parse_lsblk(SAMPLE_LSBLK_JSON).unwrap();
        let games = devices.iter().find(|d| d.name == "nvme0n1p2").unwrap();
        assert_eq!(games.suggested_mount_name(), "Games");

        let mut unlabeled = games.clone();
        unlabeled.label = None;
        assert_eq!(unlabeled.suggested_mount_name(), "aabbccdd");

        assert_eq!(sanitize_mount_name("My Games"), "My_Games");
        assert_eq!(sanitize_mount_name("Game/Data"), "Game_Data");
        assert_eq!(sanitize_mount_name("Test-Drive_123"), "Test-Drive_123");
    }

    #[test]
    fn fstype_mapping_round_trip() {
        assert_eq!(fstype_to_vfs_type("ntfs"), "ntfs3");
        assert_eq!(fstype_to_vfs_type("exfat"), "exfat");
        assert_eq!(vfs_type_to_fstype("ntfs3"), "ntfs");
        assert_eq!(vfs_type_to_fstype("exfat"), "exfat");
    }
}
