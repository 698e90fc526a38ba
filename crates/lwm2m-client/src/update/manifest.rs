//! Package manifest verification
//!
//! A software package unpacks to a directory holding `checksums.txt` in
//! `sha256sum` output format and the files it lists:
//!
//! ```text
//! 3f79bb7b435b05321651daefd374cdc681dc06faa65e374e38337b88ca046dea  lwm2md
//! 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08 *lib/plugin.so
//! ```

use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::UpdateError;

pub const MANIFEST_FILE: &str = "checksums.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: [u8; 32],
    /// Relative to the package directory
    pub path: PathBuf,
}

/// Parse `sha256sum` output lines
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>, UpdateError> {
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_line(line).ok_or_else(|| {
            UpdateError::Integrity(format!("malformed manifest line {}", index + 1))
        })?);
    }
    if entries.is_empty() {
        return Err(UpdateError::Integrity("manifest lists no files".into()));
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Option<ManifestEntry> {
    let (hex_digest, rest) = (line.get(..64)?, line.get(64..)?);
    let mut digest = [0u8; 32];
    hex::decode_to_slice(hex_digest, &mut digest).ok()?;
    let name = rest
        .strip_prefix("  ")
        .or_else(|| rest.strip_prefix(" *"))?;
    if name.is_empty() {
        return None;
    }
    let path = PathBuf::from(name);
    let contained = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    contained.then_some(ManifestEntry { digest, path })
}

pub fn sha256_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Recompute every digest listed in `dir/checksums.txt`
///
/// Hashing runs on the blocking pool. Returns the number of verified files.
pub async fn verify_dir(dir: &Path) -> Result<usize, UpdateError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let text = match tokio::fs::read_to_string(&manifest_path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(UpdateError::Integrity(format!("{} missing", MANIFEST_FILE)))
        }
        Err(e) => return Err(UpdateError::Integrity(format!("{}: {}", MANIFEST_FILE, e))),
    };
    let entries = parse_manifest(&text)?;
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        for entry in &entries {
            let path = dir.join(&entry.path);
            let actual = sha256_file(&path).map_err(|e| {
                UpdateError::Integrity(format!("{}: {}", entry.path.display(), e))
            })?;
            if actual != entry.digest {
                return Err(UpdateError::Integrity(format!(
                    "digest mismatch for {}",
                    entry.path.display()
                )));
            }
            debug!(file = %entry.path.display(), "Digest verified");
        }
        Ok(entries.len())
    })
    .await
    .map_err(|e| UpdateError::Integrity(format!("verification task failed: {}", e)))?
}
