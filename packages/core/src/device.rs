//! Unified device abstraction.
//!
//! A [`Device`] merges three sources into one view: the live lsblk scan,
//! the managed fstab entries, and Steam's library folders. Devices that are
//! configured in fstab but not currently attached show up as offline.
//!
//! The configure/deconfigure orchestration lives here too; it decides *what*
//! entry to request and leaves file and session handling entirely to
//! [`FstabManager`](crate::manager::FstabManager).

use std::path::{Path, PathBuf};

use crate::disk::{self, BlockDevice};
use crate::error::Result;
use crate::fstab::{ManagedEntry, MountIdentity};
use crate::manager::FstabManager;
use crate::preset::{self, PresetConfig, SupportedFilesystem};
use crate::session::PrivilegedSession;
use crate::steam::{self, LibraryFolder};

/// Whether the device is currently attached to the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Online,
    Offline,
}

/// One device as presented to callers: physical properties, mount
/// configuration, and Steam associations in a single record.
#[derive(Debug, Clone)]
pub struct Device {
    /// Display name: label, mount point basename, or identity.
    pub name: String,
    /// Managed identity, when one can be derived.
    pub identity: Option<MountIdentity>,
    /// Device node, e.g. `/dev/sda1`. None while offline.
    pub path: Option<PathBuf>,
    /// Volume label.
    pub label: Option<String>,
    /// Detected filesystem, e.g. "ntfs".
    pub fstype: String,
    /// Size in bytes; 0 while offline.
    pub size: u64,
    /// Rotational medium; None when unknown.
    pub rota: Option<bool>,
    /// Removable flag; None when unknown.
    pub removable: Option<bool>,
    /// Transport, e.g. "usb"; None when unknown.
    pub transport: Option<String>,
    /// Where the device is (or would be) mounted.
    mountpoint: Option<PathBuf>,
    /// Currently mounted.
    pub is_mounted: bool,
    pub connection_state: ConnectionState,
    /// The managed fstab entry, when configured.
    pub fstab_entry: Option<ManagedEntry>,
    /// Steam libraries living under this device's mount point.
    pub steam_libraries: Vec<LibraryFolder>,
}

impl Device {
    pub fn is_offline(&self) -> bool {
        self.connection_state == ConnectionState::Offline
    }

    /// Configured in the managed fstab block.
    pub fn is_managed(&self) -> bool {
        self.fstab_entry.is_some()
    }

    /// The actual mount point if mounted, else the configured target.
    pub fn effective_mount_point(&self) -> Option<&Path> {
        self.mountpoint
            .as_deref()
            .or_else(|| self.fstab_entry.as_ref().map(|e| e.mount_point.as_path()))
    }

    fn from_block_device(device: &BlockDevice) -> Self {
        Self {
            name: device
                .label
                .clone()
                .unwrap_or_else(|| device.name.clone()),
            identity: device.identity(),
            path: Some(device.path.clone()),
            label: device.label.clone(),
            fstype: device.fstype.clone().unwrap_or_default(),
            size: device.size,
            rota: Some(device.rota),
            removable: Some(device.removable),
            transport: device.transport.clone(),
            mountpoint: device.mountpoint.as_ref().map(PathBuf::from),
            is_mounted: device.is_mounted(),
            connection_state: ConnectionState::Online,
            fstab_entry: None,
            steam_libraries: Vec::new(),
        }
    }

    fn from_offline_entry(entry: &ManagedEntry) -> Self {
        let name = entry
            .mount_point
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| entry.identity.to_string());

        Self {
            name,
            identity: Some(entry.identity.clone()),
            path: None,
            label: None,
            fstype: disk::vfs_type_to_fstype(&entry.vfs_type).to_string(),
            size: 0,
            rota: None,
            removable: None,
            transport: None,
            mountpoint: Some(entry.mount_point.clone()),
            is_mounted: false,
            connection_state: ConnectionState::Offline,
            fstab_entry: Some(entry.clone()),
            steam_libraries: Vec::new(),
        }
    }

    fn attach_fstab_entry(&mut self, entry: &ManagedEntry) {
        self.fstab_entry = Some(entry.clone());
        self.mountpoint = Some(entry.mount_point.clone());
    }

    fn attach_steam_libraries(&mut self, libraries: &[(String, LibraryFolder)]) {
        if let Some(mount_point) = self.effective_mount_point() {
            self.steam_libraries = libraries
                .iter()
                .filter(|(_, lib)| lib.path.starts_with(mount_point))
                .map(|(_, lib)| lib.clone())
                .collect();
        }
    }
}

/// Configuration for [`list_devices`].
#[derive(Debug, Clone, Default)]
pub struct ListDevicesConfig {
    /// Fstab to read managed entries from; defaults to `/etc/fstab`.
    pub fstab_path: Option<PathBuf>,
    /// Explicit libraryfolders.vdf path; auto-detected when None.
    pub steam_vdf_path: Option<PathBuf>,
    /// Skip Steam association entirely.
    pub skip_steam: bool,
}

impl ListDevicesConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fstab_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.fstab_path = Some(path.into());
        self
    }

    pub fn without_steam(mut self) -> Self {
        self.skip_steam = true;
        self
    }
}

/// Lists all known devices: online mountable partitions plus offline managed
/// entries, each with fstab and Steam associations attached.
pub fn list_devices(config: &ListDevicesConfig) -> Result<Vec<Device>> {
    let manager = match &config.fstab_path {
        Some(path) => FstabManager::with_path(path),
        None => FstabManager::new(),
    };

    let online = disk::list_block_devices()?;
    // A missing or malformed fstab should not hide online devices.
    let managed = manager.entries().unwrap_or_default();

    let libraries = if config.skip_steam {
        Vec::new()
    } else {
        config
            .steam_vdf_path
            .as_deref()
            .map(steam::parse_library_folders)
            .or_else(|| {
                steam::steam_library_vdf_path()
                    .ok()
                    .map(|p| steam::parse_library_folders(&p))
            })
            .and_then(Result::ok)
            .unwrap_or_default()
    };

    Ok(merge_devices(&online, &managed, &libraries))
}

/// Pure merge of the three device sources.
fn merge_devices(
    online: &[BlockDevice],
    managed: &[ManagedEntry],
    libraries: &[(String, LibraryFolder)],
) -> Vec<Device> {
    let mut devices = Vec::new();
    let mut claimed: Vec<&MountIdentity> = Vec::new();

    for block_device in disk::filter_mountable_devices(online) {
        let mut device = Device::from_block_device(block_device);

        if let Some(identity) = &device.identity
            && let Some(entry) = managed.iter().find(|e| &e.identity == identity)
        {
            device.attach_fstab_entry(entry);
            claimed.push(&entry.identity);
        }

        device.attach_steam_libraries(libraries);
        devices.push(device);
    }

    for entry in managed {
        if !claimed.contains(&&entry.identity) {
            let mut device = Device::from_offline_entry(entry);
            device.attach_steam_libraries(libraries);
            devices.push(device);
        }
    }

    devices
}

/// Finds a device by its managed identity.
pub fn find_device<'a>(devices: &'a [Device], identity: &MountIdentity) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.identity.as_ref() == Some(identity))
}

/// Finds a device by mount point (actual or configured).
pub fn find_device_by_mount_point<'a>(
    devices: &'a [Device],
    mount_point: &Path,
) -> Option<&'a Device> {
    devices
        .iter()
        .find(|d| d.effective_mount_point() == Some(mount_point))
}

/// Writes the fstab configuration for a block device and returns the entry
/// that was applied.
///
/// Builds the entry from the preset (ownership goes to the current user) and
/// hands it to the manager; backup, write, and reload all ride the given
/// session, so the caller sees at most one authentication prompt.
pub fn configure_device(
    session: &mut PrivilegedSession,
    manager: &FstabManager,
    device: &BlockDevice,
    config: &PresetConfig,
    mount_point: Option<PathBuf>,
) -> Result<ManagedEntry> {
    let identity = device.require_identity()?;
    let filesystem: SupportedFilesystem =
        device.fstype.as_deref().unwrap_or_default().try_into()?;

    let mount_point = match mount_point {
        Some(path) => path,
        None => crate::fstab::generate_mount_point(&device.suggested_mount_name())?,
    };

    let options = config.generate_options(preset::current_uid(), preset::current_gid());
    let entry = ManagedEntry::new(
        identity.clone(),
        mount_point,
        filesystem.driver_name(),
        options,
    );

    manager.apply(session, &identity, Some(entry.clone()))?;
    Ok(entry)
}

/// Removes a device's managed fstab entry and reloads systemd.
///
/// Deconfiguring an identity that is not managed is a no-op.
pub fn deconfigure_device(
    session: &mut PrivilegedSession,
    manager: &FstabManager,
    identity: &MountIdentity,
) -> Result<()> {
    manager.apply(session, identity, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn games_block_device() -> BlockDevice {
        BlockDevice {
            name: "sda1".to_string(),
            label: Some("Games".to_string()),
            uuid: Some("AABB-CCDD".to_string()),
            partuuid: Some("1111-2222".to_string()),
            fstype: Some("ntfs".to_string()),
            mountpoint: None,
            size: 1 << 40,
            rota: false,
            removable: false,
            transport: Some("sata".to_string()),
            path: PathBuf::from("/dev/sda1"),
        }
    }

    fn games_entry() -> ManagedEntry {
        ManagedEntry::new(
            MountIdentity::uuid("AABB-CCDD"),
            "/home/deck/Drives/Games",
            "ntfs3",
            "rw,nofail",
        )
    }

    #[test]
    fn merge_attaches_entry_to_online_device() {
        let devices = merge_devices(&[games_block_device()], &[games_entry()], &[]);

        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.connection_state, ConnectionState::Online);
        assert!(device.is_managed());
        assert_eq!(
            device.effective_mount_point(),
            Some(Path::new("/home/deck/Drives/Games"))
        );
    }

    #[test]
    fn merge_reports_unmatched_entries_as_offline() {
        let other = ManagedEntry::new(
            MountIdentity::uuid("0000-1111"),
            "/home/deck/Drives/Shelf",
            "exfat",
            "rw,nofail",
        );
        let devices = merge_devices(&[games_block_device()], &[games_entry(), other], &[]);

        assert_eq!(devices.len(), 2);
        let offline = devices.iter().find(|d| d.is_offline()).unwrap();
        assert_eq!(offline.name, "Shelf");
        assert_eq!(offline.fstype, "exfat");
        assert_eq!(offline.size, 0);
        assert!(offline.is_managed());
    }

    #[test]
    fn merge_matches_case_insensitively_via_identity() {
        // The block device reports uppercase; the managed entry is stored
        // lowercase. Identity normalization makes them the same device.
        let devices = merge_devices(&[games_block_device()], &[games_entry()], &[]);
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].is_offline());
    }

    #[test]
    fn steam_libraries_match_by_mount_point_prefix() {
        let libraries = vec![
            (
                "0".to_string(),
                LibraryFolder {
                    path: PathBuf::from("/home/deck/.local/share/Steam"),
                    label: "Default".to_string(),
                    ..Default::default()
                },
            ),
            (
                "1".to_string(),
                LibraryFolder {
                    path: PathBuf::from("/home/deck/Drives/Games/SteamLibrary"),
                    label: "Games".to_string(),
                    ..Default::default()
                },
            ),
            (
                "2".to_string(),
                LibraryFolder {
                    path: PathBuf::from("/home/deck/Drives/Games/SteamLibrary2"),
                    label: "Games2".to_string(),
                    ..Default::default()
                },
            ),
        ];

        let devices = merge_devices(&[games_block_device()], &[games_entry()], &libraries);
        let device = &devices[0];
        assert_eq!(device.steam_libraries.len(), 2);
        assert!(device.steam_libraries.iter().all(|l| l.label.starts_with("Games")));
    }

    #[test]
    fn lookup_helpers() {
        let devices = merge_devices(&[games_block_device()], &[games_entry()], &[]);

        assert!(find_device(&devices, &MountIdentity::uuid("aabb-ccdd")).is_some());
        assert!(find_device(&devices, &MountIdentity::uuid("none")).is_none());
        assert!(
            find_device_by_mount_point(&devices, Path::new("/home/deck/Drives/Games")).is_some()
        );
    }
}
