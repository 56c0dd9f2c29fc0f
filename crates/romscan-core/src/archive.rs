use std::fs::File;
use std::io::Read;
use std::path::Path;

use encoding_rs::SHIFT_JIS;
use zip::ZipArchive;

use crate::error::{Result, ScanError};

/// Decode a member name, trying UTF-8 first, then Shift_JIS
fn decode_member_name(raw: &[u8]) -> String {
    if let Ok(s) = std::str::from_utf8(raw) {
        return s.to_string();
    }

    // Common for Japanese archives
    let (decoded, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return decoded.into_owned();
    }

    String::from_utf8_lossy(raw).into_owned()
}

/// A file stored in an archive, as listed by its central directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMember {
    pub name: String,
    pub index: usize,
    /// Uncompressed size
    pub size: u64,
    /// CRC-32 recorded in the central directory
    pub crc32: u32,
}

fn open(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| ScanError::unreadable(path, e))?;
    ZipArchive::new(file).map_err(|e| match e {
        zip::result::ZipError::Io(io) => ScanError::unreadable(path, io),
        other => ScanError::malformed(path, other.to_string()),
    })
}

/// List every file member of a zip archive, sorted by name.
///
/// Directory entries are skipped. A corrupt central directory is reported as
/// `MalformedContainer` for this archive only.
pub fn list_members(path: &Path) -> Result<Vec<ArchiveMember>> {
    let mut archive = open(path)?;
    let mut members = Vec::with_capacity(archive.len());

    for i in 0..archive.len() {
        let entry = archive
            .by_index_raw(i)
            .map_err(|e| ScanError::malformed(path, e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = decode_member_name(entry.name_raw());
        if name.is_empty() {
            continue;
        }
        members.push(ArchiveMember {
            name,
            index: i,
            size: entry.size(),
            crc32: entry.crc32(),
        });
    }

    members.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(members)
}

/// Read a member's decompressed bytes, capped at `limit`.
pub fn read_member_prefix(path: &Path, member: &ArchiveMember, limit: usize) -> Result<Vec<u8>> {
    let mut archive = open(path)?;
    let entry = archive
        .by_index(member.index)
        .map_err(|e| ScanError::malformed(path, e.to_string()))?;
    let mut bytes = Vec::with_capacity(limit.min(member.size as usize));
    entry
        .take(limit as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| ScanError::unreadable(path, e))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_list_members_reports_stored_crc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.zip");
        write_zip(&path, &[("b.nes", b"second"), ("a.nes", b"first")]);

        let members = list_members(&path).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "a.nes");
        assert_eq!(members[0].size, 5);
        assert_eq!(members[0].crc32, crc32fast::hash(b"first"));
        assert_eq!(members[1].crc32, crc32fast::hash(b"second"));
    }

    #[test]
    fn test_read_member_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pack.zip");
        write_zip(&path, &[("disc.iso", b"GALE01 header bytes")]);

        let member = list_members(&path).unwrap().remove(0);
        let bytes = read_member_prefix(&path, &member, 6).unwrap();
        assert_eq!(bytes, b"GALE01");
    }

    #[test]
    fn test_corrupt_archive_is_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        let mut junk = b"PK\x03\x04".to_vec();
        junk.extend(std::iter::repeat(0x5Au8).take(256));
        std::fs::write(&path, &junk).unwrap();

        let err = list_members(&path).unwrap_err();
        assert!(matches!(err, ScanError::MalformedContainer { .. }));
    }

    #[test]
    fn test_missing_archive_is_unreadable() {
        let dir = tempdir().unwrap();
        let err = list_members(&dir.path().join("nope.zip")).unwrap_err();
        assert!(matches!(err, ScanError::Unreadable { .. }));
    }

    #[test]
    fn test_decode_shift_jis_name() {
        // "ゲーム" in Shift_JIS
        let raw = [0x83, 0x51, 0x81, 0x5B, 0x83, 0x80];
        assert_eq!(decode_member_name(&raw), "ゲーム");
    }
}
