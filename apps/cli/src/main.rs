//! deckdrive CLI: drive mounting for SteamOS-like handhelds from a terminal.
//!
//! Besides the user-facing commands, this binary doubles as the privileged
//! side of the session protocol: `deckdrive-cli daemon` is what the
//! unprivileged side launches under pkexec or sudo.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

use deckdrive_core::device::{self, ListDevicesConfig};
use deckdrive_core::error::{Error, Result};
use deckdrive_core::fstab::MountIdentity;
use deckdrive_core::manager::FstabManager;
use deckdrive_core::preset::{PresetConfig, SupportedFilesystem, suggest_config};
use deckdrive_core::session::{PrivilegedSession, ProcessSpawner};
use deckdrive_core::{daemon, disk, mount};

/// deckdrive command line tool.
#[derive(Parser)]
#[command(name = "deckdrive-cli")]
#[command(about = "Mount and manage game drives on SteamOS-like systems", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as a privileged daemon, accepting signed commands via stdin.
    ///
    /// This mode is launched via pkexec or sudo by the unprivileged side;
    /// it is not meant to be invoked by hand.
    Daemon,
    /// List known devices (online and configured-but-offline).
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },
    /// Configure a device in fstab and mount it.
    Mount {
        /// Filesystem UUID of the target partition.
        uuid: String,
        /// Mount point override; defaults to ~/Drives/<name>.
        #[arg(long)]
        mount_point: Option<PathBuf>,
        /// Mount preset.
        #[arg(long, value_enum, default_value_t = PresetKind::Auto)]
        preset: PresetKind,
        /// Run ntfsfix automatically if the volume is dirty.
        #[arg(long)]
        repair: bool,
    },
    /// Unmount a configured device.
    Unmount {
        /// Filesystem UUID of the target partition.
        uuid: String,
    },
    /// Remove a device's managed fstab entry.
    Deconfigure {
        /// Filesystem UUID of the target partition.
        uuid: String,
    },
    /// Clear the NTFS dirty flag on a device.
    Repair {
        /// Filesystem UUID of the target partition.
        uuid: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetKind {
    /// Pick from the device's reported properties.
    Auto,
    /// Internal / fixed SSD.
    Ssd,
    /// Hot-swappable drive.
    Portable,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Daemon => daemon::serve().map_err(|e| Error::Generic {
            message: format!("daemon failed: {e}"),
            source: None,
        }),
        Commands::List { json } => list(json),
        Commands::Mount {
            uuid,
            mount_point,
            preset,
            repair,
        } => mount_cmd(&uuid, mount_point, preset, repair),
        Commands::Unmount { uuid } => unmount_cmd(&uuid),
        Commands::Deconfigure { uuid } => deconfigure_cmd(&uuid),
        Commands::Repair { uuid } => repair_cmd(&uuid),
    }
}

/// One session per invocation: sudo for TTY use, the daemon binary being
/// this executable itself.
fn new_session() -> PrivilegedSession {
    let daemon_bin = std::env::current_exe()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| "deckdrive-cli".to_string());
    PrivilegedSession::new(Box::new(ProcessSpawner::sudo(daemon_bin)))
}

fn find_online_device(uuid: &str) -> Result<disk::BlockDevice> {
    let identity = MountIdentity::uuid(uuid);
    disk::find_device_by_identity(&identity)?.ok_or_else(|| Error::InvalidIdentity {
        message: format!("no attached partition with {identity}"),
    })
}

fn list(json: bool) -> Result<()> {
    let devices = device::list_devices(&ListDevicesConfig::new())?;

    if json {
        let values: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "identity": d.identity.as_ref().map(|i| i.spec()),
                    "path": d.path.as_ref().map(|p| p.display().to_string()),
                    "fstype": d.fstype,
                    "size": d.size,
                    "mounted": d.is_mounted,
                    "offline": d.is_offline(),
                    "managed": d.is_managed(),
                    "mount_point": d.effective_mount_point().map(|p| p.display().to_string()),
                    "steam_libraries": d.steam_libraries.len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values).expect("json"));
        return Ok(());
    }

    if devices.is_empty() {
        println!("no mountable or managed devices found");
        return Ok(());
    }

    for d in &devices {
        let state = if d.is_offline() {
            "offline"
        } else if d.is_mounted {
            "mounted"
        } else {
            "attached"
        };
        let managed = if d.is_managed() { "managed" } else { "unmanaged" };
        println!(
            "{:<16} {:<10} {:<10} {:>10}  {}  {}",
            d.name,
            d.fstype,
            state,
            format_size(d.size),
            managed,
            d.effective_mount_point()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn mount_cmd(
    uuid: &str,
    mount_point: Option<PathBuf>,
    preset: PresetKind,
    repair: bool,
) -> Result<()> {
    let target = find_online_device(uuid)?;
    let filesystem: SupportedFilesystem = target.fstype.as_deref().unwrap_or_default().try_into()?;

    let config = match preset {
        PresetKind::Auto => suggest_config(
            filesystem,
            Some(target.rota),
            Some(target.removable),
            target.transport.as_deref(),
        ),
        PresetKind::Ssd => PresetConfig::ssd(filesystem),
        PresetKind::Portable => PresetConfig::portable(filesystem),
    };

    let manager = FstabManager::new();
    let mut session = new_session();

    let entry = device::configure_device(&mut session, &manager, &target, &config, mount_point)?;
    mount::create_mount_point(&mut session, &entry.mount_point)?;

    if let Err(e) = mount::start_mount_unit(&mut session, &entry.mount_point) {
        if mount::detect_dirty_volume(&mut session, &target)? {
            if !repair {
                session.close()?;
                return Err(Error::DirtyVolume {
                    device: target.path.display().to_string(),
                });
            }
            println!("volume is dirty; running ntfsfix on {}", target.path.display());
            mount::repair_dirty_volume(&mut session, &target)?;
            mount::start_mount_unit(&mut session, &entry.mount_point)?;
        } else {
            session.close()?;
            return Err(e);
        }
    }

    session.close()?;
    println!("{} mounted at {}", target.name, entry.mount_point.display());
    Ok(())
}

fn unmount_cmd(uuid: &str) -> Result<()> {
    let identity = MountIdentity::uuid(uuid);
    let manager = FstabManager::new();
    let entry = manager
        .current_entry(&identity)?
        .ok_or_else(|| Error::InvalidIdentity {
            message: format!("{identity} is not managed"),
        })?;

    let mut session = new_session();
    mount::stop_mount_unit(&mut session, &entry.mount_point)?;
    session.close()?;

    println!("unmounted {}", entry.mount_point.display());
    Ok(())
}

fn deconfigure_cmd(uuid: &str) -> Result<()> {
    let identity = MountIdentity::uuid(uuid);
    let manager = FstabManager::new();
    let entry = manager.current_entry(&identity)?;

    let mut session = new_session();
    if let Some(entry) = &entry {
        // Best effort: the unit may not be running.
        if let Err(e) = mount::stop_mount_unit(&mut session, &entry.mount_point) {
            log::debug!("stopping mount unit failed: {e}");
        }
    }
    device::deconfigure_device(&mut session, &manager, &identity)?;
    session.close()?;

    println!("removed managed entry for {identity}");
    Ok(())
}

fn repair_cmd(uuid: &str) -> Result<()> {
    let target = find_online_device(uuid)?;

    let mut session = new_session();
    mount::repair_dirty_volume(&mut session, &target)?;
    session.close()?;

    println!("cleared dirty flag on {}", target.path.display());
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1 << 30;
    const MIB: u64 = 1 << 20;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}
