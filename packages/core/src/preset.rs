//! Mount-option presets.
//!
//! Options are generated from three axes: the filesystem (NTFS vs exFAT),
//! the storage medium (flash vs rotational), and the connection scenario
//! (fixed vs removable). [`suggest_config`] picks sensible defaults from the
//! device properties lsblk reports.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Options applied to every managed mount.
pub const BASE_OPTIONS: &str = "umask=000,nofail,rw,noatime";

/// Boot wait for fixed devices (seconds).
pub const DEFAULT_DEVICE_TIMEOUT_SECS: u32 = 3;

/// Idle unmount delay for removable devices (seconds).
pub const DEFAULT_IDLE_TIMEOUT_SECS: u32 = 60;

/// Current user's UID, for ownership options.
pub fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// Current user's primary GID.
pub fn current_gid() -> u32 {
    nix::unistd::getgid().as_raw()
}

/// Filesystems this tool generates presets for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportedFilesystem {
    Ntfs,
    Exfat,
}

impl SupportedFilesystem {
    /// The kernel driver written into fstab.
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Ntfs => "ntfs3",
            Self::Exfat => "exfat",
        }
    }
}

impl TryFrom<&str> for SupportedFilesystem {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "ntfs" | "ntfs3" => Ok(Self::Ntfs),
            "exfat" => Ok(Self::Exfat),
            other => Err(Error::InvalidFilesystem {
                fs: other.to_string(),
            }),
        }
    }
}

/// Storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    /// SSD, SD card, USB stick. Gets TRIM/discard.
    #[default]
    Flash,
    /// Spinning disk. No discard.
    Rotational,
}

/// Connection scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// Always connected; waited for at boot.
    #[default]
    Fixed,
    /// Hot-swappable; automounted on access.
    Removable,
}

/// Systemd timeout knobs. `None` omits the corresponding option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub device_timeout_secs: Option<u32>,
    pub idle_timeout_secs: Option<u32>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            device_timeout_secs: Some(DEFAULT_DEVICE_TIMEOUT_SECS),
            idle_timeout_secs: Some(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }
}

/// Full preset configuration for one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetConfig {
    pub filesystem: SupportedFilesystem,
    pub media_type: MediaType,
    pub device_type: DeviceType,
    pub timeout: TimeoutConfig,
    pub custom_options: Option<String>,
}

impl PresetConfig {
    /// Defaults: flash medium, fixed connection.
    pub fn new(filesystem: SupportedFilesystem) -> Self {
        Self {
            filesystem,
            media_type: MediaType::default(),
            device_type: DeviceType::default(),
            timeout: TimeoutConfig::default(),
            custom_options: None,
        }
    }

    /// Preset for internal/fixed SSDs.
    pub fn ssd(filesystem: SupportedFilesystem) -> Self {
        Self {
            media_type: MediaType::Flash,
            device_type: DeviceType::Fixed,
            ..Self::new(filesystem)
        }
    }

    /// Preset for hot-swappable drives.
    pub fn portable(filesystem: SupportedFilesystem) -> Self {
        Self {
            media_type: MediaType::Flash,
            device_type: DeviceType::Removable,
            ..Self::new(filesystem)
        }
    }

    /// Preset with caller-supplied extra options appended verbatim.
    pub fn custom(filesystem: SupportedFilesystem, options: &str) -> Self {
        Self {
            custom_options: Some(options.to_string()),
            ..Self::new(filesystem)
        }
    }

    /// Generates the comma-joined option string for an fstab entry.
    pub fn generate_options(&self, uid: u32, gid: u32) -> String {
        let mut opts = vec![format!("uid={uid},gid={gid}"), BASE_OPTIONS.to_string()];

        if self.filesystem == SupportedFilesystem::Ntfs {
            opts.push("prealloc".to_string());
        }

        if self.media_type == MediaType::Flash {
            opts.push("discard".to_string());
        }

        match self.device_type {
            DeviceType::Fixed => {
                if let Some(secs) = self.timeout.device_timeout_secs {
                    opts.push(format!("x-systemd.device-timeout={secs}s"));
                }
            }
            DeviceType::Removable => {
                opts.push("noauto".to_string());
                opts.push("x-systemd.automount".to_string());
                if let Some(secs) = self.timeout.idle_timeout_secs {
                    opts.push(format!("x-systemd.idle-timeout={secs}s"));
                }
            }
        }

        if let Some(custom) = self.custom_options.as_deref().filter(|c| !c.is_empty()) {
            opts.push(custom.to_string());
        }

        opts.join(",")
    }
}

/// Recommends a preset from the properties lsblk reports for a device.
///
/// USB transport or an explicit removable flag means removable; a rotational
/// medium disables discard.
pub fn suggest_config(
    filesystem: SupportedFilesystem,
    rota: Option<bool>,
    removable: Option<bool>,
    transport: Option<&str>,
) -> PresetConfig {
    let is_removable = removable.unwrap_or(false) || transport == Some("usb");
    let is_rotational = rota.unwrap_or(false);

    PresetConfig {
        filesystem,
        media_type: if is_rotational {
            MediaType::Rotational
        } else {
            MediaType::Flash
        },
        device_type: if is_removable {
            DeviceType::Removable
        } else {
            DeviceType::Fixed
        },
        timeout: TimeoutConfig::default(),
        custom_options: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_ssd_ntfs_options() {
        let options = PresetConfig::new(SupportedFilesystem::Ntfs).generate_options(1000, 1000);

        assert!(options.starts_with("uid=1000,gid=1000"));
        assert!(options.contains("rw,noatime"));
        assert!(options.contains("prealloc"));
        assert!(options.contains("discard"));
        assert!(options.contains("x-systemd.device-timeout=3s"));
        assert!(!options.contains("noauto"));
    }

    #[test]
    fn exfat_has_no_prealloc() {
        let options = PresetConfig::new(SupportedFilesystem::Exfat).generate_options(1000, 1000);
        assert!(options.contains("discard"));
        assert!(!options.contains("prealloc"));
    }

    #[test]
    fn portable_preset_automounts() {
        let options =
            PresetConfig::portable(SupportedFilesystem::Exfat).generate_options(1000, 1000);
        assert!(options.contains("noauto"));
        assert!(options.contains("x-systemd.automount"));
        assert!(options.contains("x-systemd.idle-timeout=60s"));
        assert!(!options.contains("x-systemd.device-timeout"));
    }

    #[test]
    fn rotational_media_skips_discard() {
        let mut preset = PresetConfig::new(SupportedFilesystem::Exfat);
        preset.media_type = MediaType::Rotational;
        assert!(!preset.generate_options(1000, 1000).contains("discard"));
    }

    #[test]
    fn custom_options_and_ids_are_appended() {
        let preset = PresetConfig::custom(SupportedFilesystem::Ntfs, "rw,sync");
        let options = preset.generate_options(1001, 1002);
        assert!(options.contains("uid=1001,gid=1002"));
        assert!(options.ends_with("rw,sync"));
    }

    #[test]
    fn filesystem_parsing_and_driver() {
        assert_eq!(
            SupportedFilesystem::try_from("NTFS").unwrap(),
            SupportedFilesystem::Ntfs
        );
        assert_eq!(
            SupportedFilesystem::try_from("ntfs3").unwrap(),
            SupportedFilesystem::Ntfs
        );
        assert!(SupportedFilesystem::try_from("btrfs").is_err());
        assert_eq!(SupportedFilesystem::Ntfs.driver_name(), "ntfs3");
        assert_eq!(SupportedFilesystem::Exfat.driver_name(), "exfat");
    }

    #[test]
    fn suggestions_follow_device_properties() {
        let usb = suggest_config(SupportedFilesystem::Exfat, Some(false), Some(false), Some("usb"));
        assert_eq!(usb.device_type, DeviceType::Removable);

        let hdd = suggest_config(SupportedFilesystem::Ntfs, Some(true), Some(false), None);
        assert_eq!(hdd.media_type, MediaType::Rotational);
        assert_eq!(hdd.device_type, DeviceType::Fixed);

        let nvme = suggest_config(SupportedFilesystem::Ntfs, Some(false), Some(false), Some("nvme"));
        assert_eq!(nvme.device_type, DeviceType::Fixed);
        assert_eq!(nvme.media_type, MediaType::Flash);

        let flagged = suggest_config(SupportedFilesystem::Exfat, None, Some(true), None);
        assert_eq!(flagged.device_type, DeviceType::Removable);
    }
}
