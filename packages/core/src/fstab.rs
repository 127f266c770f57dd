//! Fstab document model.
//!
//! [`FstabDocument`] is a pure parser/serializer for `/etc/fstab` content: no
//! I/O happens here. The file is treated as an ordered sequence of opaque
//! lines (reproduced byte-for-byte, never reordered) plus at most one
//! *managed block*, a marker-delimited span that this tool owns outright.
//! Mutations ([`FstabDocument::upsert`], [`FstabDocument::remove`]) touch
//! only the managed block and are idempotent.
//!
//! Reading and writing the real file belongs to [`crate::manager`].

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default fstab path.
pub const FSTAB_PATH: &str = "/etc/fstab";

/// Marker opening the managed block.
pub const MANAGED_BLOCK_BEGIN: &str = "# BEGIN DECKDRIVE-MANAGED";

/// Marker closing the managed block.
pub const MANAGED_BLOCK_END: &str = "# END DECKDRIVE-MANAGED";

/// Notice rendered inside the managed block.
const MANAGED_BLOCK_NOTICE: &str = "# Written by deckdrive. Do not edit this block by hand.";

/// Identifier namespace for a managed device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    Uuid,
    Partuuid,
}

impl IdentityKind {
    /// The fstab spec prefix for this namespace.
    pub fn prefix(&self) -> &'static str {
        match self {
            IdentityKind::Uuid => "UUID",
            IdentityKind::Partuuid => "PARTUUID",
        }
    }
}

/// A device identity as recorded in the managed block.
///
/// Values are normalized to lowercase on construction: the
/// `/dev/disk/by-uuid` and `/dev/disk/by-partuuid` lookups are case-sensitive
/// and use lowercase names, while tools like blkid report NTFS serials in
/// uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountIdentity {
    kind: IdentityKind,
    value: String,
}

impl MountIdentity {
    pub fn new(kind: IdentityKind, value: impl AsRef<str>) -> Self {
        Self {
            kind,
            value: value.as_ref().to_lowercase(),
        }
    }

    pub fn uuid(value: impl AsRef<str>) -> Self {
        Self::new(IdentityKind::Uuid, value)
    }

    pub fn partuuid(value: impl AsRef<str>) -> Self {
        Self::new(IdentityKind::Partuuid, value)
    }

    /// Parses an fstab spec field like `UUID=abcd-1234`.
    pub fn parse_spec(spec: &str) -> Option<Self> {
        if let Some(value) = spec.strip_prefix("UUID=") {
            Some(Self::uuid(value))
        } else {
            spec.strip_prefix("PARTUUID=").map(Self::partuuid)
        }
    }

    pub fn kind(&self) -> IdentityKind {
        self.kind
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// The fstab spec field, e.g. `UUID=abcd-1234`.
    pub fn spec(&self) -> String {
        format!("{}={}", self.kind.prefix(), self.value)
    }
}

impl fmt::Display for MountIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind.prefix(), self.value)
    }
}

/// Conversions accepted wherever mount options are taken.
pub trait IntoMountOptions {
    fn into_options(self) -> Vec<String>;
}

impl IntoMountOptions for &str {
    fn into_options(self) -> Vec<String> {
        self.split(',').map(str::to_string).collect()
    }
}

impl IntoMountOptions for String {
    fn into_options(self) -> Vec<String> {
        self.as_str().into_options()
    }
}

impl IntoMountOptions for Vec<String> {
    fn into_options(self) -> Vec<String> {
        self
    }
}

/// One entry in the managed block.
///
/// Option order is significant and reproduced verbatim. The dump and fsck
/// fields are always rendered as `0 0`; these mounts are neither dumped nor
/// fsck-ordered at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedEntry {
    pub identity: MountIdentity,
    pub mount_point: PathBuf,
    pub vfs_type: String,
    pub options: Vec<String>,
}

impl ManagedEntry {
    pub fn new(
        identity: MountIdentity,
        mount_point: impl Into<PathBuf>,
        vfs_type: impl Into<String>,
        options: impl IntoMountOptions,
    ) -> Self {
        Self {
            identity,
            mount_point: mount_point.into(),
            vfs_type: vfs_type.into(),
            options: options.into_options(),
        }
    }

    /// Renders the entry as an fstab line.
    pub fn to_line(&self) -> String {
        format!(
            "{}  {}  {}  {}  0  0",
            self.identity.spec(),
            escape_fstab_path(&self.mount_point.to_string_lossy()),
            self.vfs_type,
            self.options.join(",")
        )
    }

    /// Parses one managed-block entry line.
    fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(Error::FstabParse {
                message: format!("expected 6 fields, found {}: '{line}'", fields.len()),
            });
        }

        let identity = MountIdentity::parse_spec(fields[0]).ok_or_else(|| Error::FstabParse {
            message: format!("unrecognized device spec '{}'", fields[0]),
        })?;

        Ok(Self {
            identity,
            mount_point: PathBuf::from(unescape_fstab_path(fields[1])),
            vfs_type: fields[2].to_string(),
            options: fields[3].split(',').map(str::to_string).collect(),
        })
    }
}

/// Escapes whitespace and backslashes in fstab paths as octal sequences.
fn escape_fstab_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            ' ' => escaped.push_str(r"\040"),
            '\t' => escaped.push_str(r"\011"),
            '\n' => escaped.push_str(r"\012"),
            '\\' => escaped.push_str(r"\134"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Reverses [`escape_fstab_path`].
fn unescape_fstab_path(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars
                .clone()
                .take(3)
                .take_while(char::is_ascii_digit)
                .collect();
            if digits.len() == 3
                && let Ok(byte) = u8::from_str_radix(&digits, 8)
            {
                result.push(byte as char);
                for _ in 0..3 {
                    chars.next();
                }
                continue;
            }
        }
        result.push(c);
    }
    result
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ManagedBlock {
    entries: Vec<ManagedEntry>,
    /// True when the block did not exist in the parsed input and was created
    /// by the first upsert; rendering then appends it at end-of-file.
    synthesized: bool,
}

/// A parsed fstab file: opaque lines around at most one managed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabDocument {
    pre: Vec<String>,
    block: Option<ManagedBlock>,
    post: Vec<String>,
    trailing_newline: bool,
}

impl FstabDocument {
    /// Parses fstab content.
    ///
    /// Fails only on inconsistent markers: an unterminated block, a stray end
    /// marker, a second block, or unparseable entry lines inside the block.
    /// Everything outside the markers is opaque and preserved exactly.
    pub fn parse(content: &str) -> Result<Self> {
        let trailing_newline = content.ends_with('\n');
        let mut raw: Vec<&str> = if content.is_empty() {
            Vec::new()
        } else {
            content.split('\n').collect()
        };
        if trailing_newline {
            raw.pop();
        }

        enum Section {
            Before,
            Inside,
            After,
        }

        let mut section = Section::Before;
        let mut pre = Vec::new();
        let mut post = Vec::new();
        let mut entries: Vec<ManagedEntry> = Vec::new();
        let mut seen_block = false;

        for line in raw {
            let trimmed = line.trim();

            if trimmed == MANAGED_BLOCK_BEGIN {
                if seen_block {
                    return Err(Error::MalformedManagedBlock {
                        message: "more than one managed block".to_string(),
                    });
                }
                seen_block = true;
                section = Section::Inside;
                continue;
            }

            if trimmed == MANAGED_BLOCK_END {
                match section {
                    Section::Inside => {
                        section = Section::After;
                        continue;
                    }
                    _ => {
                        return Err(Error::MalformedManagedBlock {
                            message: "end marker without begin marker".to_string(),
                        });
                    }
                }
            }

            match section {
                Section::Before => pre.push(line.to_string()),
                Section::After => post.push(line.to_string()),
                Section::Inside => {
                    // Comment and blank lines inside the block (the notice)
                    // are regenerated on render.
                    if trimmed.is_empty() || trimmed.starts_with('#') {
                        continue;
                    }
                    let entry = ManagedEntry::parse_line(line)?;
                    if entries.iter().any(|e| e.identity == entry.identity) {
                        return Err(Error::MalformedManagedBlock {
                            message: format!("duplicate entry for {}", entry.identity),
                        });
                    }
                    entries.push(entry);
                }
            }
        }

        if matches!(section, Section::Inside) {
            return Err(Error::MalformedManagedBlock {
                message: "begin marker without end marker".to_string(),
            });
        }

        Ok(Self {
            pre,
            block: seen_block.then_some(ManagedBlock {
                entries,
                synthesized: false,
            }),
            post,
            trailing_newline,
        })
    }

    /// Serializes the document.
    ///
    /// Opaque lines come back in their original order and position. A block
    /// synthesized by [`upsert`](Self::upsert) is appended at end-of-file,
    /// preceded by a blank line when the file is non-empty and does not
    /// already end in one.
    pub fn render(&self) -> String {
        let mut lines: Vec<String> = self.pre.clone();
        let mut trailing_newline = self.trailing_newline;

        if let Some(block) = &self.block {
            if block.synthesized {
                if !lines.is_empty() && !lines.last().is_some_and(|l| l.trim().is_empty()) {
                    lines.push(String::new());
                }
                // A synthesized block also gives the file a proper terminator.
                trailing_newline = true;
            }
            lines.push(MANAGED_BLOCK_BEGIN.to_string());
            lines.push(MANAGED_BLOCK_NOTICE.to_string());
            for entry in &block.entries {
                lines.push(entry.to_line());
            }
            lines.push(MANAGED_BLOCK_END.to_string());
        }

        lines.extend(self.post.iter().cloned());

        let mut out = lines.join("\n");
        if trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// True once the document carries a managed block (parsed or synthesized).
    pub fn has_managed_block(&self) -> bool {
        self.block.is_some()
    }

    /// Entries of the managed block, in insertion order.
    pub fn entries(&self) -> &[ManagedEntry] {
        self.block.as_ref().map(|b| b.entries.as_slice()).unwrap_or(&[])
    }

    /// Looks up the managed entry for an identity.
    pub fn entry(&self, identity: &MountIdentity) -> Option<&ManagedEntry> {
        self.entries().iter().find(|e| &e.identity == identity)
    }

    /// Inserts or replaces the entry for `entry.identity`.
    ///
    /// A matching entry is replaced *in place*, keeping its position in the
    /// block; a new identity appends. Synthesizes the managed block if the
    /// document has none yet.
    pub fn upsert(&mut self, entry: ManagedEntry) {
        let block = self.block.get_or_insert_with(|| ManagedBlock {
            entries: Vec::new(),
            synthesized: true,
        });
        match block.entries.iter_mut().find(|e| e.identity == entry.identity) {
            Some(existing) => *existing = entry,
            None => block.entries.push(entry),
        }
    }

    /// Removes the entry for an identity. Removing an absent identity is a
    /// no-op, not an error; the block skeleton itself is left in place.
    pub fn remove(&mut self, identity: &MountIdentity) -> bool {
        let Some(block) = &mut self.block else {
            return false;
        };
        let before = block.entries.len();
        block.entries.retain(|e| &e.identity != identity);
        block.entries.len() != before
    }
}

/// Base directory for generated mount points (`~/Drives`).
///
/// Resolved from the current home directory so SteamOS-like systems where
/// the user is not `deck` (ChimeraOS, Bazzite, HoloISO) work the same way.
pub fn default_mount_base() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(Error::HomeDirNotFound)?;
    Ok(home.join("Drives"))
}

/// Mount point for a named drive under the default base.
pub fn generate_mount_point(mount_name: &str) -> Result<PathBuf> {
    Ok(default_mount_base()?.join(mount_name))
}

/// Fixed sibling path holding the pre-mutation backup of an fstab file.
pub fn backup_path(fstab_path: &Path) -> PathBuf {
    let file_name = fstab_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fstab".to_string());
    fstab_path.with_file_name(format!("{file_name}.deckdrive.bak"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN_FSTAB: &str = "\
# /etc/fstab: static file system information.

# <file system>  <mount point>  <type>  <options>  <dump>  <pass>
UUID=abc-123  /  ext4  defaults  0  1
UUID=def-456  /boot/efi  vfat  umask=0077  0  1
";

    const MANAGED_FSTAB: &str = "\
# /etc/fstab: static file system information.
UUID=abc-123  /  ext4  defaults  0  1

# BEGIN DECKDRIVE-MANAGED
# Written by deckdrive. Do not edit this block by hand.
UUID=1234-5678  /home/deck/Drives/GamesSSD  ntfs3  uid=1000,gid=1000,rw,umask=000,discard,nofail  0  0
# END DECKDRIVE-MANAGED

# Custom user entries
UUID=custom  /mnt/custom  ext4  defaults  0  0
";

    fn games_entry() -> ManagedEntry {
        ManagedEntry::new(
            MountIdentity::uuid("ABCD-1234"),
            "/home/deck/Drives/Games",
            "ntfs3",
            "uid=1000,gid=1000,rw,nofail",
        )
    }

    #[test]
    fn identity_is_normalized_to_lowercase() {
        let identity = MountIdentity::uuid("ABCD-1234");
        assert_eq!(identity.value(), "abcd-1234");
        assert_eq!(identity.spec(), "UUID=abcd-1234");
        assert_eq!(identity, MountIdentity::uuid("abcd-1234"));

        let part = MountIdentity::parse_spec("PARTUUID=AABB-CCDD").unwrap();
        assert_eq!(part.kind(), IdentityKind::Partuuid);
        assert_eq!(part.spec(), "PARTUUID=aabb-ccdd");

        assert!(MountIdentity::parse_spec("LABEL=Games").is_none());
    }

    #[test]
    fn parse_and_render_round_trips_managed_file() {
        let doc = FstabDocument::parse(MANAGED_FSTAB).unwrap();
        assert!(doc.has_managed_block());
        assert_eq!(doc.entries().len(), 1);
        assert_eq!(doc.entries()[0].identity, MountIdentity::uuid("1234-5678"));
        assert_eq!(doc.render(), MANAGED_FSTAB);
    }

    #[test]
    fn parse_and_render_round_trips_plain_file() {
        let doc = FstabDocument::parse(PLAIN_FSTAB).unwrap();
        assert!(!doc.has_managed_block());
        assert_eq!(doc.render(), PLAIN_FSTAB);

        // A file without a trailing newline stays without one.
        let no_newline = "UUID=abc  /  ext4  defaults  0  1";
        let doc = FstabDocument::parse(no_newline).unwrap();
        assert_eq!(doc.render(), no_newline);

        let empty = FstabDocument::parse("").unwrap();
        assert_eq!(empty.render(), "");
    }

    #[test]
    fn upsert_synthesizes_block_at_end_of_file() {
        let mut doc = FstabDocument::parse(PLAIN_FSTAB).unwrap();
        doc.upsert(games_entry());

        let rendered = doc.render();
        assert!(rendered.starts_with(PLAIN_FSTAB));
        assert!(rendered.contains(MANAGED_BLOCK_BEGIN));
        assert!(rendered.contains(
            "UUID=abcd-1234  /home/deck/Drives/Games  ntfs3  uid=1000,gid=1000,rw,nofail  0  0"
        ));
        assert!(rendered.ends_with(&format!("{MANAGED_BLOCK_END}\n")));

        // The separator blank line is present exactly once.
        assert!(rendered.contains(&format!("0  1\n\n{MANAGED_BLOCK_BEGIN}")));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut doc = FstabDocument::parse(MANAGED_FSTAB).unwrap();
        doc.upsert(ManagedEntry::new(
            MountIdentity::uuid("9999-0000"),
            "/home/deck/Drives/Second",
            "exfat",
            "rw,nofail",
        ));
        doc.upsert(ManagedEntry::new(
            MountIdentity::uuid("1234-5678"),
            "/home/deck/Drives/Renamed",
            "ntfs3",
            "rw",
        ));

        // The replaced entry keeps its original position at the head of the
        // block; it does not move to the end.
        let entries = doc.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identity, MountIdentity::uuid("1234-5678"));
        assert_eq!(entries[0].mount_point, PathBuf::from("/home/deck/Drives/Renamed"));
        assert_eq!(entries[1].identity, MountIdentity::uuid("9999-0000"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut once = FstabDocument::parse(PLAIN_FSTAB).unwrap();
        once.upsert(games_entry());
        let mut twice = once.clone();
        twice.upsert(games_entry());

        assert_eq!(once.render(), twice.render());
        assert_eq!(twice.entries().len(), 1);
    }

    #[test]
    fn remove_after_upsert_preserves_opaque_content() {
        let mut doc = FstabDocument::parse(PLAIN_FSTAB).unwrap();
        let entry = games_entry();
        doc.upsert(entry.clone());
        assert!(doc.remove(&entry.identity));

        let rendered = doc.render();
        // Opaque lines are untouched; only the empty block skeleton remains.
        assert!(rendered.starts_with(PLAIN_FSTAB));
        assert!(rendered.contains(MANAGED_BLOCK_BEGIN));
        assert!(!rendered.contains("abcd-1234"));

        // Removing a missing identity is a no-op.
        assert!(!doc.remove(&MountIdentity::uuid("not-there")));
    }

    #[test]
    fn remove_on_document_without_block_is_noop() {
        let mut doc = FstabDocument::parse(PLAIN_FSTAB).unwrap();
        assert!(!doc.remove(&MountIdentity::uuid("abcd-1234")));
        assert_eq!(doc.render(), PLAIN_FSTAB);
    }

    #[test]
    fn unterminated_block_is_malformed() {
        let content = format!("UUID=a  /  ext4  defaults  0  1\n{MANAGED_BLOCK_BEGIN}\n");
        assert!(matches!(
            FstabDocument::parse(&content),
            Err(Error::MalformedManagedBlock { .. })
        ));

        let stray_end = format!("{MANAGED_BLOCK_END}\n");
        assert!(matches!(
            FstabDocument::parse(&stray_end),
            Err(Error::MalformedManagedBlock { .. })
        ));

        let double = format!(
            "{MANAGED_BLOCK_BEGIN}\n{MANAGED_BLOCK_END}\n{MANAGED_BLOCK_BEGIN}\n{MANAGED_BLOCK_END}\n"
        );
        assert!(matches!(
            FstabDocument::parse(&double),
            Err(Error::MalformedManagedBlock { .. })
        ));
    }

    #[test]
    fn escaped_mount_points_round_trip() {
        let entry = ManagedEntry::new(
            MountIdentity::uuid("1234"),
            "/home/deck/Drives/My Drive",
            "ntfs3",
            "defaults",
        );
        let line = entry.to_line();
        assert!(line.contains(r"/home/deck/Drives/My\040Drive"));

        let parsed = ManagedEntry::parse_line(&line).unwrap();
        assert_eq!(parsed.mount_point, PathBuf::from("/home/deck/Drives/My Drive"));
        assert_eq!(parsed, entry);
    }

    #[test]
    fn entry_line_parse_rejects_garbage() {
        assert!(ManagedEntry::parse_line("UUID=a  /mnt  ntfs3  rw  0").is_err());
        assert!(ManagedEntry::parse_line("LABEL=x  /mnt  ntfs3  rw  0  0").is_err());
    }

    #[test]
    fn options_preserve_order() {
        let entry = ManagedEntry::new(
            MountIdentity::uuid("1234"),
            "/mnt/t",
            "ntfs3",
            "gid=1000,uid=1000,noatime,rw",
        );
        assert_eq!(entry.options, vec!["gid=1000", "uid=1000", "noatime", "rw"]);
        assert!(entry.to_line().contains("gid=1000,uid=1000,noatime,rw"));
    }

    #[test]
    fn backup_path_is_fixed_sibling() {
        assert_eq!(
            backup_path(Path::new("/etc/fstab")),
            PathBuf::from("/etc/fstab.deckdrive.bak")
        );
    }
}
