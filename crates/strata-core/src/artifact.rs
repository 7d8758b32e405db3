//! Compiled-artifact snapshotting and byte-level comparison.
//!
//! Before recompiling a file, its previous object and interface artifacts
//! are set aside under a backup name. After the compile, the fresh artifact
//! is compared byte for byte against the backup; only a real difference
//! propagates work (re-links, dependent recompiles). The backups are then
//! removed, with bounded retries since a scanner or indexer may briefly
//! hold the file open.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::project::exts;

const REMOVE_RETRIES: u32 = 5;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Backup name for an artifact: `foo.cmo` becomes `foo.cmo_old`.
pub fn backup_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(exts::BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Move an artifact aside to its backup name, replacing any stale backup.
/// Returns the backup path if the artifact existed.
pub fn snapshot(artifact: &Path) -> io::Result<Option<PathBuf>> {
    if !artifact.exists() {
        return Ok(None);
    }
    let backup = backup_path(artifact);
    if backup.exists() {
        fs::remove_file(&backup)?;
    }
    fs::rename(artifact, &backup)?;
    debug!("snapshotted {:?} -> {:?}", artifact, backup);
    Ok(Some(backup))
}

/// Compare two optional files byte for byte.
///
/// Two absent files are equal; an absent file never equals a present one.
pub fn same_contents(a: Option<&Path>, b: Option<&Path>) -> io::Result<bool> {
    match (a, b) {
        (None, None) => Ok(true),
        (Some(a), Some(b)) => {
            let a_exists = a.exists();
            let b_exists = b.exists();
            match (a_exists, b_exists) {
                (false, false) => Ok(true),
                (true, true) => files_equal(a, b),
                _ => Ok(false),
            }
        }
        _ => Ok(false),
    }
}

fn files_equal(a: &Path, b: &Path) -> io::Result<bool> {
    if fs::metadata(a)?.len() != fs::metadata(b)?.len() {
        return Ok(false);
    }
    let mut ra = BufReader::new(File::open(a)?);
    let mut rb = BufReader::new(File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];
    loop {
        let na = ra.read(&mut buf_a)?;
        let nb = rb.read(&mut buf_b)?;
        if na != nb || buf_a[..na] != buf_b[..nb] {
            return Ok(false);
        }
        if na == 0 {
            return Ok(true);
        }
    }
}

/// Remove a file, retrying a few times on failure. Used for backup
/// cleanup where another process may transiently hold the file.
pub fn remove_with_retry(path: &Path) {
    if !path.exists() {
        return;
    }
    for attempt in 0..REMOVE_RETRIES {
        match fs::remove_file(path) {
            Ok(()) => return,
            Err(err) => {
                debug!("removing {:?} failed (attempt {}): {}", path, attempt + 1, err);
                thread::sleep(REMOVE_RETRY_DELAY);
            }
        }
    }
    warn!("could not remove {:?} after {} attempts", path, REMOVE_RETRIES);
}
