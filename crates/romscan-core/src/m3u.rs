//! Multi-part manifests: read them and fold disc matches into one entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::accumulator::{MatchResult, ResultAccumulator};
use crate::error::{Result, ScanError};

/// Trailing `(Disc 1)`, `(Disc 1 of 2)`, `(CD 2)`, `(2 of 3)`.
static DISC_INDICATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*\((?:(?:Disc|Disk|CD)\s+(?:\d+|[A-Z])(?:\s+of\s+\d+)?|\d+\s+of\s+\d+)\)$")
        .unwrap()
});

/// Strip one trailing disc indicator from a title.
///
/// Titles whose last parenthetical is not a disc indicator are returned
/// unchanged.
pub fn strip_disc_indicator(label: &str) -> String {
    let trimmed = label.trim_end();
    match DISC_INDICATOR_RE.captures(trimmed) {
        Some(caps) if !caps[1].trim().is_empty() => caps[1].trim_end().to_string(),
        _ => label.to_string(),
    }
}

/// Ordered content paths listed in a manifest.
///
/// Blank lines and `#` directives are ignored; relative entries resolve
/// against the manifest's directory.
pub fn read_manifest(path: &Path) -> Result<Vec<PathBuf>> {
    let bytes = fs::read(path).map_err(|e| ScanError::unreadable(path, e))?;
    let text = String::from_utf8_lossy(&bytes);
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let entries = text
        .lines()
        .map(|line| line.trim_start_matches('\u{feff}').trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let entry = Path::new(line);
            if entry.is_absolute() {
                entry.to_path_buf()
            } else {
                base.join(entry)
            }
        })
        .collect();
    Ok(entries)
}

/// Collapse the discs a manifest references into one match for the manifest.
///
/// The first matching disc (in accumulator order) supplies label, tag and
/// collection; the label loses its disc indicator. Returns whether a
/// collapse happened.
pub fn collapse_manifest(
    manifest: &Path,
    entries: &[PathBuf],
    results: &mut ResultAccumulator,
) -> Result<bool> {
    // Path equality compares components, so `dir/./a.cue` and `dir//a.cue` match `dir/a.cue`.
    let discs = results.extract_if(|r| {
        r.archive_member.is_none()
            && entries
                .iter()
                .any(|entry| entry.as_path() == Path::new(&r.content_path))
    });
    let Some(first) = discs.first() else {
        return Ok(false);
    };

    debug!(
        "Collapsing {} disc match(es) into {}",
        discs.len(),
        manifest.display()
    );
    results.add(MatchResult {
        content_path: manifest.to_string_lossy().into_owned(),
        display_label: strip_disc_indicator(&first.display_label),
        fingerprint_tag: first.fingerprint_tag.clone(),
        collection_name: first.collection_name.clone(),
        archive_member: None,
    })?;
    Ok(true)
}

/// Run the collapse pass for every manifest found during a scan.
///
/// Unreadable manifests are logged and skipped. Returns the number of
/// manifests that absorbed at least one match.
pub fn collapse_all(manifests: &[PathBuf], results: &mut ResultAccumulator) -> Result<usize> {
    let mut collapsed = 0;
    for manifest in manifests {
        let entries = match read_manifest(manifest) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Skipping manifest: {}", e);
                continue;
            }
        };
        if collapse_manifest(manifest, &entries, results)? {
            collapsed += 1;
        }
    }
    Ok(collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_disc_indicator_recognizer() {
        assert_eq!(strip_disc_indicator("Game (Disc 1)"), "Game");
        assert_eq!(strip_disc_indicator("Game (Disc 1 of 2)"), "Game");
        assert_eq!(strip_disc_indicator("Game (USA) (CD 2)"), "Game (USA)");
        assert_eq!(strip_disc_indicator("Game (2 of 3)"), "Game");
        assert_eq!(strip_disc_indicator("Game (Disc B)"), "Game");
        assert_eq!(
            strip_disc_indicator("Game (Disc Special Edition)"),
            "Game (Disc Special Edition)"
        );
        assert_eq!(strip_disc_indicator("Game (1999)"), "Game (1999)");
        assert_eq!(strip_disc_indicator("Game (Disc 1) (Rev 1)"), "Game (Disc 1) (Rev 1)");
        assert_eq!(strip_disc_indicator("(Disc 1)"), "(Disc 1)");
    }

    #[test]
    fn test_read_manifest_resolves_relative_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Foo.m3u");
        fs::write(&path, "#EXTM3U\nFoo (Disc 1).cue\n\n/abs/Foo (Disc 2).cue\n").unwrap();

        let entries = read_manifest(&path).unwrap();
        assert_eq!(
            entries,
            vec![
                dir.path().join("Foo (Disc 1).cue"),
                PathBuf::from("/abs/Foo (Disc 2).cue"),
            ]
        );
    }

    #[test]
    fn test_collapse_takes_first_match_metadata() {
        let mut acc = ResultAccumulator::new();
        for (path, label, tag) in [
            ("/r/Other.bin", "Other", "11111111|crc"),
            ("/r/Foo (Disc 2).cue", "Foo (Disc 2)", "S2|serial"),
            ("/r/Foo (Disc 1).cue", "Foo (Disc 1)", "S1|serial"),
        ] {
            acc.add(MatchResult {
                content_path: path.to_string(),
                display_label: label.to_string(),
                fingerprint_tag: tag.to_string(),
                collection_name: "System.lpl".to_string(),
                archive_member: None,
            })
            .unwrap();
        }

        let entries = vec![
            PathBuf::from("/r/Foo (Disc 1).cue"),
            PathBuf::from("/r/Foo (Disc 2).cue"),
        ];
        assert!(collapse_manifest(Path::new("/r/Foo.m3u"), &entries, &mut acc).unwrap());

        let results: Vec<_> = acc.iter().cloned().collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content_path, "/r/Other.bin");
        assert_eq!(results[1].content_path, "/r/Foo.m3u");
        assert_eq!(results[1].display_label, "Foo");
        assert_eq!(results[1].fingerprint_tag, "S2|serial");
    }

    #[test]
    fn test_collapse_matches_dot_relative_entries() {
        let dir = tempdir().unwrap();
        let manifest = dir.path().join("Foo.m3u");
        fs::write(&manifest, "./Foo (Disc 1).cue\n./Foo (Disc 2).cue\n").unwrap();

        let mut acc = ResultAccumulator::new();
        for disc in 1..=2 {
            acc.add(MatchResult {
                content_path: dir
                    .path()
                    .join(format!("Foo (Disc {}).cue", disc))
                    .to_string_lossy()
                    .into_owned(),
                display_label: format!("Foo (Disc {})", disc),
                fingerprint_tag: format!("S{}|serial", disc),
                collection_name: "System.lpl".to_string(),
                archive_member: None,
            })
            .unwrap();
        }

        assert_eq!(collapse_all(&[manifest.clone()], &mut acc).unwrap(), 1);
        let results: Vec<_> = acc.iter().cloned().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content_path, manifest.to_string_lossy());
        assert_eq!(results[0].display_label, "Foo");
    }

    #[test]
    fn test_collapse_without_matches_is_noop() {
        let mut acc = ResultAccumulator::new();
        let entries = vec![PathBuf::from("/r/Missing.cue")];
        assert!(!collapse_manifest(Path::new("/r/Foo.m3u"), &entries, &mut acc).unwrap());
        assert!(acc.is_empty());
    }
}
