use super::VerificationStatus;
use crate::identity::WorkUnit;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::warn;

pub const VERIFIED_SUFFIX: &str = ".verified";
pub const ERROR_SUFFIX: &str = ".verify_error";

impl VerificationStatus {
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Verified => VERIFIED_SUFFIX,
            Self::Failed => ERROR_SUFFIX,
        }
    }

    fn other(&self) -> Self {
        match self {
            Self::Verified => Self::Failed,
            Self::Failed => Self::Verified,
        }
    }
}

/// Sentinel as found in a log directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentinel {
    pub status: VerificationStatus,
    pub path: PathBuf,
    pub content: String,
}

pub fn sentinel_path(log_dir: &Path, unit: &WorkUnit, status: VerificationStatus) -> PathBuf {
    log_dir.join(format!("{}{}", unit.local_name(), status.suffix()))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write the sentinel for `status` and drop a stale one of the opposite status
pub fn write_sentinel(
    log_dir: &Path,
    unit: &WorkUnit,
    status: VerificationStatus,
    content: &str,
) -> io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;

    let path = sentinel_path(log_dir, unit, status);
    let mut partial = path.clone().into_os_string();
    partial.push(".partial");

    fs::write(&partial, content)?;
    remove_if_present(&sentinel_path(log_dir, unit, status.other()))?;
    fs::rename(&partial, &path)?;

    Ok(path)
}

/// Read the sentinel of a unit, `None` if verification has not run yet
pub fn read_sentinel(log_dir: &Path, unit: &WorkUnit) -> io::Result<Option<Sentinel>> {
    let verified = sentinel_path(log_dir, unit, VerificationStatus::Verified);
    let failed = sentinel_path(log_dir, unit, VerificationStatus::Failed);

    let read = |status: VerificationStatus, path: PathBuf| -> io::Result<Option<Sentinel>> {
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(Sentinel {
                status,
                path,
                content,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    };

    // a failure always wins, even if a stale success survived next to it
    match read(VerificationStatus::Failed, failed)? {
        Some(sentinel) => {
            if verified.exists() {
                warn!(unit = %unit, "Found both sentinels, treating the unit as failed");
            }
            Ok(Some(sentinel))
        }
        None => read(VerificationStatus::Verified, verified),
    }
}
