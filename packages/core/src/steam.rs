//! Steam library integration.
//!
//! Parses Steam's `libraryfolders.vdf` with `keyvalues-serde` and injects new
//! library folders for freshly mounted drives. Injection edits user-owned
//! files and never needs the privileged session; Steam must be shut down
//! first or it will overwrite the file on exit.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// One library folder entry in libraryfolders.vdf.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LibraryFolder {
    /// Path to the library folder.
    pub path: PathBuf,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Content ID; "0" for custom folders.
    #[serde(default)]
    pub contentid: String,
    /// Total size; "0" for custom folders.
    #[serde(default)]
    pub totalsize: String,
    /// Installed app ids and their sizes.
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct LibraryFoldersRoot {
    #[serde(flatten)]
    folders: HashMap<String, LibraryFolder>,
}

/// Locates libraryfolders.vdf under the user's Steam installation.
pub fn steam_library_vdf_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
    let vdf_path = home
        .join(".local/share/Steam/steamapps")
        .join("libraryfolders.vdf");

    if !vdf_path.exists() {
        return Err(Error::SteamVdfNotFound { path: vdf_path });
    }
    Ok(vdf_path)
}

/// Whether a Steam client process is running.
pub fn is_steam_running() -> bool {
    Command::new("pgrep")
        .args(["-x", "steam"])
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Asks Steam to exit and waits for the process to disappear.
pub fn shutdown_steam() -> Result<()> {
    if !is_steam_running() {
        return Ok(());
    }

    Command::new("steam")
        .arg("--shutdown")
        .output()
        .command_context("steam --shutdown")?;

    // Steam acknowledges immediately but winds down slowly.
    for _ in 0..20 {
        if !is_steam_running() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(500));
    }

    Err(Error::SteamProcess {
        message: "Steam did not shut down within timeout".to_string(),
    })
}

/// Parses libraryfolders.vdf from disk. Folders come back sorted by their
/// numeric index.
pub fn parse_library_folders(path: &Path) -> Result<Vec<(String, LibraryFolder)>> {
    let content = fs::read_to_string(path).vdf_context(path)?;
    parse_library_folders_content(&content)
}

fn parse_library_folders_content(content: &str) -> Result<Vec<(String, LibraryFolder)>> {
    let root: LibraryFoldersRoot =
        keyvalues_serde::from_str(content).map_err(|e| Error::VdfParse {
            message: e.to_string(),
        })?;

    let mut folders: Vec<(String, LibraryFolder)> = root
        .folders
        .into_iter()
        .filter(|(id, _)| id.chars().all(|c| c.is_ascii_digit()))
        .collect();

    folders.sort_by_key(|(id, _)| id.parse::<u32>().unwrap_or(u32::MAX));
    Ok(folders)
}

/// Registers a mount point as a Steam library folder.
///
/// Idempotent: a path that is already registered leaves the file untouched.
/// The new entry is spliced in before the final closing brace so Steam's own
/// formatting elsewhere in the file survives.
pub fn inject_library_folder(vdf_path: &Path, mount_path: &Path, label: &str) -> Result<()> {
    let folders = parse_library_folders(vdf_path)?;

    if folders.iter().any(|(_, f)| f.path == mount_path) {
        log::debug!("{} already registered as a Steam library", mount_path.display());
        return Ok(());
    }

    let next_id = folders
        .iter()
        .filter_map(|(id, _)| id.parse::<u32>().ok())
        .max()
        .map_or(1, |n| n + 1);

    let content = fs::read_to_string(vdf_path).vdf_context(vdf_path)?;

    let entry = format!(
        "\t\"{next_id}\"\n\t{{\n\t\t\"path\"\t\t\"{}\"\n\t\t\"label\"\t\t\"{label}\"\n\t\t\"contentid\"\t\t\"0\"\n\t\t\"totalsize\"\t\t\"0\"\n\t\t\"apps\"\n\t\t{{\n\t\t}}\n\t}}",
        mount_path.display()
    );

    let last_brace = content.rfind('}').ok_or_else(|| Error::VdfParse {
        message: "no closing brace in libraryfolders.vdf".to_string(),
    })?;
    let (before, after) = content.split_at(last_brace);
    let updated = format!("{}\n{entry}\n{after}", before.trim_end());

    fs::write(vdf_path, updated).vdf_context(vdf_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_VDF: &str = "\"libraryfolders\"
{
\t\"0\"
\t{
\t\t\"path\"\t\t\"/home/deck/.local/share/Steam\"
\t\t\"label\"\t\t\"\"
\t\t\"contentid\"\t\t\"1234567890\"
\t\t\"totalsize\"\t\t\"0\"
\t\t\"apps\"
\t\t{
\t\t\t\"730\"\t\t\"12345678\"
\t\t\t\"440\"\t\t\"87654321\"
\t\t}
\t}
\t\"1\"
\t{
\t\t\"path\"\t\t\"/run/media/mmcblk0p1\"
\t\t\"label\"\t\t\"SD Card\"
\t\t\"contentid\"\t\t\"0\"
\t\t\"totalsize\"\t\t\"0\"
\t\t\"apps\"
\t\t{
\t\t}
\t}
}";

    #[test]
    fn parses_folders_in_index_order() {
        let folders = parse_library_folders_content(SAMPLE_VDF).unwrap();
        assert_eq!(folders.len(), 2);

        let (id0, folder0) = &folders[0];
        assert_eq!(id0, "0");
        assert_eq!(folder0.path, PathBuf::from("/home/deck/.local/share/Steam"));
        assert_eq!(folder0.apps.len(), 2);
        assert_eq!(folder0.apps.get("730").map(String::as_str), Some("12345678"));

        let (id1, folder1) = &folders[1];
        assert_eq!(id1, "1");
        assert_eq!(folder1.label, "SD Card");
    }

    #[test]
    fn injection_appends_next_index_and_is_idempotent() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE_VDF.as_bytes()).unwrap();

        let mount = Path::new("/home/deck/Drives/Games/SteamLibrary");
        inject_library_folder(file.path(), mount, "Games").unwrap();

        let folders = parse_library_folders(file.path()).unwrap();
        assert_eq!(folders.len(), 3);
        let (id, folder) = &folders[2];
        assert_eq!(id, "2");
        assert_eq!(folder.path, mount);
        assert_eq!(folder.label, "Games");

        // Second injection of the same path changes nothing.
        let before = fs::read_to_string(file.path()).unwrap();
        inject_library_folder(file.path(), mount, "Games").unwrap();
        assert_eq!(fs::read_to_string(file.path()).unwrap(), before);
    }
}
