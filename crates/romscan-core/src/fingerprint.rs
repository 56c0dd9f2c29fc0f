use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::archive::{self, ArchiveMember};
use crate::candidate::{Candidate, ContainerKind};
use crate::disc::{self, DiscExtractor};
use crate::error::{Result, ScanError};

const READ_CHUNK: usize = 64 * 1024;

/// Checksum and byte length of an archive file as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveSum {
    pub checksum: u32,
    pub byte_len: u64,
}

/// What identifies a candidate's payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub checksum: Option<u32>,
    /// Checksum of the enclosing archive, for archive members.
    pub archive_checksum: Option<u32>,
    pub serial: Option<String>,
    pub byte_len: u64,
    pub archive_byte_len: u64,
    /// File to checksum later when only a serial was computed.
    pub(crate) checksum_source: Option<PathBuf>,
}

impl Fingerprint {
    /// Tag recorded alongside a match: `"%08X|crc"` or `"<serial>|serial"`.
    pub fn tag(&self) -> String {
        if let Some(serial) = &self.serial {
            return format!("{}|serial", serial);
        }
        format!("{:08X}|crc", self.checksum.unwrap_or(0))
    }

    /// Compute the checksum if only a serial was extracted.
    ///
    /// Used to confirm serial hits on tables whose serials are shared
    /// between platform variants.
    pub fn ensure_checksum(&mut self) -> Result<Option<u32>> {
        if self.checksum.is_none() {
            if let Some(source) = &self.checksum_source {
                let (crc, _) = checksum_file(source)?;
                self.checksum = Some(crc);
            }
        }
        Ok(self.checksum)
    }
}

/// CRC-32 and length of a file's raw bytes.
pub fn checksum_file(path: &Path) -> Result<(u32, u64)> {
    let file = File::open(path).map_err(|e| ScanError::unreadable(path, e))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| ScanError::unreadable(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize(), total))
}

/// Checksum of a whole archive file.
pub fn archive_sum(path: &Path) -> Result<ArchiveSum> {
    let (checksum, byte_len) = checksum_file(path)?;
    Ok(ArchiveSum { checksum, byte_len })
}

/// Fingerprint a top-level candidate.
///
/// Archive members go through [`compute_member`] instead.
pub fn compute(candidate: &Candidate, extractor: &dyn DiscExtractor) -> Result<Fingerprint> {
    let path = candidate.path.as_path();
    match candidate.kind {
        ContainerKind::Plain => {
            let (crc, len) = checksum_file(path)?;
            Ok(Fingerprint {
                checksum: Some(crc),
                byte_len: len,
                ..Default::default()
            })
        }
        ContainerKind::Cue | ContainerKind::Gdi | ContainerKind::Chd | ContainerKind::WiiLike => {
            let info = extractor.extract(path, candidate.kind)?;
            if info.serial.is_some() {
                return Ok(Fingerprint {
                    checksum: info.checksum,
                    serial: info.serial,
                    byte_len: info.byte_len,
                    checksum_source: Some(info.data_file),
                    ..Default::default()
                });
            }
            debug!(
                "No serial detected in {}, falling back to checksum",
                path.display()
            );
            let (crc, len) = match info.checksum {
                Some(crc) => (crc, info.byte_len),
                None => checksum_file(&info.data_file)?,
            };
            Ok(Fingerprint {
                checksum: Some(crc),
                byte_len: len,
                checksum_source: Some(info.data_file),
                ..Default::default()
            })
        }
        ContainerKind::Compressed => {
            let sum = archive_sum(path)?;
            Ok(Fingerprint {
                checksum: Some(sum.checksum),
                byte_len: sum.byte_len,
                ..Default::default()
            })
        }
        ContainerKind::Manifest => Err(ScanError::malformed(path, "manifests are not fingerprinted")),
    }
}

/// Fingerprint an archive member from its central-directory entry.
///
/// The member checksum is the stored CRC-32, so the archive is not reopened;
/// only GameCube/Wii members have their header read for a game id.
pub fn compute_member(
    candidate: &Candidate,
    member: &ArchiveMember,
    outer: ArchiveSum,
) -> Result<Fingerprint> {
    let serial = if candidate.kind == ContainerKind::WiiLike {
        let header = archive::read_member_prefix(&candidate.path, member, 0x20)?;
        disc::wii_like_serial(&header)
    } else {
        None
    };

    Ok(Fingerprint {
        checksum: Some(member.crc32),
        archive_checksum: Some(outer.checksum),
        serial,
        byte_len: member.size,
        archive_byte_len: outer.byte_len,
        checksum_source: None,
    })
}
