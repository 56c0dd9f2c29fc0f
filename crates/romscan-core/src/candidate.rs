use std::path::{Path, PathBuf};

/// How a candidate file is laid out on disk, which decides how it is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    /// Raw binary, checksummed as-is.
    Plain,
    Cue,
    Gdi,
    Chd,
    /// GameCube / Wii disc images carrying a game id in their header.
    WiiLike,
    /// Zip archive; members are expanded on demand.
    Compressed,
    /// Multi-part playable list (`.m3u`).
    Manifest,
}

impl ContainerKind {
    /// Classify a file by its extension (case-insensitive).
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "cue" => ContainerKind::Cue,
            "gdi" => ContainerKind::Gdi,
            "chd" => ContainerKind::Chd,
            "gcm" | "iso" | "wbfs" | "ciso" => ContainerKind::WiiLike,
            "zip" => ContainerKind::Compressed,
            "m3u" => ContainerKind::Manifest,
            _ => ContainerKind::Plain,
        }
    }
}

/// One file (or archive member) awaiting identification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Path on disk; for archive members this is the archive itself.
    pub path: PathBuf,
    pub kind: ContainerKind,
    /// Member name inside `path` when this candidate came from archive expansion.
    pub archive_member: Option<String>,
}

impl Candidate {
    pub fn new(path: PathBuf) -> Self {
        let kind = ContainerKind::from_path(&path);
        Self {
            path,
            kind,
            archive_member: None,
        }
    }

    /// A member of an expanded archive, classified by the member's own name.
    pub fn archive_member(archive: &Path, member: String) -> Self {
        let kind = match ContainerKind::from_path(Path::new(&member)) {
            // Nested archives and sheets cannot be opened in place; treat their bytes as-is.
            ContainerKind::Compressed
            | ContainerKind::Cue
            | ContainerKind::Gdi
            | ContainerKind::Chd
            | ContainerKind::Manifest => ContainerKind::Plain,
            k => k,
        };
        Self {
            path: archive.to_path_buf(),
            kind,
            archive_member: Some(member),
        }
    }

    /// Path string recorded in collections: `archive.zip#member` for members.
    pub fn content_path(&self) -> String {
        let base = self.path.to_string_lossy();
        match &self.archive_member {
            Some(member) => format!("{}#{}", base, member),
            None => base.into_owned(),
        }
    }

    /// Short name for status messages.
    pub fn display_name(&self) -> String {
        match &self.archive_member {
            Some(member) => member.clone(),
            None => self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.to_string_lossy().into_owned()),
        }
    }
}
