//! Disc-sheet parsing and platform serial detection.
//!
//! Cue and gdi sheets are resolved to their primary data track, whose leading
//! sectors are searched for a product code. Detection is best-effort: when no
//! serial is found the caller falls back to a checksum of the data track.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::candidate::ContainerKind;
use crate::error::{Result, ScanError};

/// How far into a data track serial detectors look.
const SERIAL_SCAN_LIMIT: u64 = 512 * 1024;

/// Dreamcast high-density area starts at this LBA.
const GDI_HIGH_DENSITY_LBA: u64 = 45000;

static PSX_BOOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i-u)BOOT\d?\s*=\s*cdrom0?:\\?([a-z]{4})[_-]?(\d{3})\.?(\d{2})").unwrap()
});

/// (header magic, serial offset from magic, serial length)
const SEGA_HEADERS: &[(&[u8], usize, usize)] = &[
    (b"SEGA SEGASATURN ", 0x20, 10),
    (b"SEGA SEGAKATANA ", 0x40, 10),
];

const GAMECUBE_MAGIC: [u8; 4] = [0xC2, 0x33, 0x9F, 0x3D];
const WII_MAGIC: [u8; 4] = [0x5D, 0x1C, 0x9E, 0xA3];

/// What an extractor learned about a disc image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscInfo {
    /// `None` means "serial not detected".
    pub serial: Option<String>,
    /// Checksum, when the format stores or yields one cheaply.
    pub checksum: Option<u32>,
    /// File holding the logical content (the data track for sheets).
    pub data_file: PathBuf,
    /// Byte length of the logical content.
    pub byte_len: u64,
}

/// Format-specific serial/checksum extraction for disc images.
pub trait DiscExtractor {
    fn extract(&self, path: &Path, kind: ContainerKind) -> Result<DiscInfo>;
}

/// Built-in extractor covering cue, gdi, chd and GameCube/Wii images.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExtractor;

impl DiscExtractor for DefaultExtractor {
    fn extract(&self, path: &Path, kind: ContainerKind) -> Result<DiscInfo> {
        match kind {
            ContainerKind::Cue => {
                let sheet = read_sheet(path)?;
                let track = cue_data_track(&sheet)
                    .ok_or_else(|| ScanError::malformed(path, "no data track in cue sheet"))?;
                detect_in_track(&resolve_sibling(path, &track))
            }
            ContainerKind::Gdi => {
                let sheet = read_sheet(path)?;
                let track = gdi_data_track(&sheet)
                    .ok_or_else(|| ScanError::malformed(path, "no data track in gdi sheet"))?;
                detect_in_track(&resolve_sibling(path, &track))
            }
            ContainerKind::WiiLike => {
                let byte_len = file_len(path)?;
                let header = read_prefix(path, 0x20)?;
                Ok(DiscInfo {
                    serial: wii_like_serial(&header),
                    checksum: None,
                    data_file: path.to_path_buf(),
                    byte_len,
                })
            }
            // Hunks are compressed; no serial without decoding them.
            ContainerKind::Chd | ContainerKind::Plain => Ok(DiscInfo {
                serial: None,
                checksum: None,
                data_file: path.to_path_buf(),
                byte_len: file_len(path)?,
            }),
            ContainerKind::Compressed | ContainerKind::Manifest => Err(ScanError::malformed(
                path,
                "not a disc image",
            )),
        }
    }
}

fn read_sheet(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| ScanError::unreadable(path, e))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn file_len(path: &Path) -> Result<u64> {
    fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| ScanError::unreadable(path, e))
}

fn read_prefix(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| ScanError::unreadable(path, e))?;
    let mut bytes = Vec::new();
    file.take(limit)
        .read_to_end(&mut bytes)
        .map_err(|e| ScanError::unreadable(path, e))?;
    Ok(bytes)
}

fn resolve_sibling(sheet: &Path, name: &str) -> PathBuf {
    match sheet.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

fn detect_in_track(track: &Path) -> Result<DiscInfo> {
    let byte_len = file_len(track)?;
    let head = read_prefix(track, SERIAL_SCAN_LIMIT)?;
    let serial = playstation_serial(&head).or_else(|| sega_serial(&head));
    Ok(DiscInfo {
        serial,
        checksum: None,
        data_file: track.to_path_buf(),
        byte_len,
    })
}

/// Split a sheet line into tokens, keeping quoted names intact.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for ch in line.chars() {
        match ch {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// File name of the first non-audio track in a cue sheet.
pub fn cue_data_track(sheet: &str) -> Option<String> {
    let mut current_file: Option<String> = None;
    let mut first_file: Option<String> = None;

    for line in sheet.lines() {
        let tokens = tokenize(line.trim());
        let Some(keyword) = tokens.first() else {
            continue;
        };
        match keyword.to_ascii_uppercase().as_str() {
            "FILE" if tokens.len() >= 2 => {
                current_file = Some(tokens[1].clone());
                if first_file.is_none() {
                    first_file = current_file.clone();
                }
            }
            "TRACK" if tokens.len() >= 3 => {
                if !tokens[2].eq_ignore_ascii_case("AUDIO") {
                    if let Some(file) = &current_file {
                        return Some(file.clone());
                    }
                }
            }
            _ => {}
        }
    }
    first_file
}

/// File name of the primary data track in a gdi sheet.
///
/// Prefers the first data track in the high-density area.
pub fn gdi_data_track(sheet: &str) -> Option<String> {
    let mut first_data: Option<String> = None;

    // First line is the track count.
    for line in sheet.lines().skip(1) {
        let tokens = tokenize(line.trim());
        if tokens.len() < 5 {
            continue;
        }
        let (Ok(lba), Ok(ctrl)) = (tokens[1].parse::<u64>(), tokens[2].parse::<u32>()) else {
            continue;
        };
        if ctrl != 4 {
            continue;
        }
        if lba >= GDI_HIGH_DENSITY_LBA {
            return Some(tokens[4].clone());
        }
        if first_data.is_none() {
            first_data = Some(tokens[4].clone());
        }
    }
    first_data
}

/// PlayStation product code from a SYSTEM.CNF boot line, e.g. `SLUS-00594`.
pub fn playstation_serial(bytes: &[u8]) -> Option<String> {
    let caps = PSX_BOOT_RE.captures(bytes)?;
    let prefix = std::str::from_utf8(&caps[1]).ok()?.to_ascii_uppercase();
    let major = std::str::from_utf8(&caps[2]).ok()?;
    let minor = std::str::from_utf8(&caps[3]).ok()?;
    Some(format!("{}-{}{}", prefix, major, minor))
}

/// Product number from a Saturn or Dreamcast IP header.
pub fn sega_serial(bytes: &[u8]) -> Option<String> {
    for (magic, offset, len) in SEGA_HEADERS {
        let Some(pos) = bytes.windows(magic.len()).position(|w| w == *magic) else {
            continue;
        };
        let start = pos + offset;
        let field = bytes.get(start..start + len)?;
        let serial = String::from_utf8_lossy(field).trim().to_string();
        if !serial.is_empty() {
            return Some(serial);
        }
    }
    None
}

/// Six-character game id from a GameCube or Wii disc header.
pub fn wii_like_serial(header: &[u8]) -> Option<String> {
    if header.len() < 0x20 {
        return None;
    }
    let is_wii = header[0x18..0x1C] == WII_MAGIC;
    let is_gamecube = header[0x1C..0x20] == GAMECUBE_MAGIC;
    if !is_wii && !is_gamecube {
        return None;
    }
    let id = &header[..6];
    if !id.iter().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(String::from_utf8_lossy(id).into_owned())
}
