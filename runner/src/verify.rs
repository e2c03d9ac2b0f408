//! Output verification and the sentinel contract between the two stages.
//!
//! Verifying a unit checks that every expected output exists with a
//! nonzero size and, for stage 2 images, that the external format checker
//! accepts it. The outcome is recorded as exactly one sentinel file in the
//! visit log directory, which is what gates stage 2 and what operators
//! look at.

pub mod checker;
pub mod sentinel;

#[cfg(test)]
mod verify_test;

use crate::{
    identity::{focal_plane_exposures, Stage, VisitId, WorkUnit},
    layout,
};
use checker::FormatChecker;
use rayon::prelude::*;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("Failed to write sentinel in {log_dir:?}")]
    Sentinel {
        log_dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Stored as -1 or 1 in the tracker's status columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum VerificationStatus {
    Failed = -1,
    Verified = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDetail {
    /// files that are absent or empty
    MissingOutputFile(Vec<String>),
    /// files rejected by the format checker, with its output
    CorruptFormat(Vec<(String, String)>),
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingOutputFile(files) => {
                writeln!(f, "MissingOutputFile")?;
                for file in files {
                    writeln!(f, "{file}")?;
                }
            }
            Self::CorruptFormat(files) => {
                writeln!(f, "CorruptFormat")?;
                for (file, output) in files {
                    writeln!(f, "{file}")?;
                    for line in output.lines() {
                        writeln!(f, "    {line}")?;
                    }
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub detail: Option<FailureDetail>,
    pub sentinel: PathBuf,
}

/// Every file a unit must leave behind in `location`
///
/// Stage 1 has to leave the parameter files of every sensor exposure of the
/// focal plane, `exposures` per sensor, since stage 2 reads them.
pub fn expected_outputs(unit: &WorkUnit, location: &Path, exposures: u16) -> Vec<PathBuf> {
    let obs = unit.observation();

    match unit.chip() {
        None => {
            let parameter_dir = location.join(layout::parameter_dir_name(obs));
            let chip_files = focal_plane_exposures(exposures)
                .flat_map(|chip| layout::chip_parameter_files(obs, &chip));

            std::iter::once(location.join(layout::node_tarball(obs)))
                .chain(
                    layout::visit_parameter_files(obs)
                        .into_iter()
                        .chain(chip_files)
                        .map(|name| parameter_dir.join(name)),
                )
                .collect()
        }
        Some(chip) => layout::chip_outputs(unit.visit(), chip)
            .into_iter()
            .map(|output| location.join(output.archive_path))
            .collect(),
    }
}

fn is_present(path: &Path) -> bool {
    fs::metadata(path).map_or(false, |metadata| metadata.is_file() && metadata.len() > 0)
}

/// files that are absent or have zero size
pub fn missing_outputs(files: &[PathBuf]) -> Vec<String> {
    files
        .iter()
        .filter(|path| !is_present(path))
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

/// files the checker rejects, paired with its output
pub fn corrupt_outputs(
    files: &[PathBuf],
    checker: &(dyn FormatChecker + Sync),
) -> Vec<(String, String)> {
    files
        .par_iter()
        .filter_map(|path| {
            let report = checker.check(path);

            (!report.clean).then(|| (path.to_string_lossy().into_owned(), report.output))
        })
        .collect()
}

pub struct VerificationGate<'a> {
    checker: &'a (dyn FormatChecker + Sync),
    exposures: u16,
}

impl<'a> VerificationGate<'a> {
    /// `exposures` per sensor, as configured in `general.exposures`
    pub fn new(checker: &'a (dyn FormatChecker + Sync), exposures: u16) -> Self {
        Self { checker, exposures }
    }

    /// check the outputs of `unit` in `location` without touching any sentinel
    pub fn inspect(&self, unit: &WorkUnit, location: &Path) -> Option<FailureDetail> {
        let expected = expected_outputs(unit, location, self.exposures);
        let missing = missing_outputs(&expected);

        // format checks are pointless on an incomplete set
        if !missing.is_empty() {
            return Some(FailureDetail::MissingOutputFile(missing));
        }

        if unit.stage() == Stage::Chip {
            let corrupt = corrupt_outputs(&expected, self.checker);

            if !corrupt.is_empty() {
                return Some(FailureDetail::CorruptFormat(corrupt));
            }
        }

        None
    }

    /// verify the outputs of `unit` and record the outcome as a sentinel in `log_dir`
    #[instrument(skip(self), level = "info")]
    pub fn verify(
        &self,
        unit: &WorkUnit,
        location: &Path,
        log_dir: &Path,
    ) -> Result<VerificationResult, VerifyError> {
        let detail = self.inspect(unit, location);

        let (status, content) = match detail {
            None => (
                VerificationStatus::Verified,
                format!(
                    "{unit}: verified {} files\n",
                    expected_outputs(unit, location, self.exposures).len()
                ),
            ),
            Some(ref detail) => (VerificationStatus::Failed, format!("{unit}: {detail}")),
        };

        let sentinel = sentinel::write_sentinel(log_dir, unit, status, &content).map_err(
            |source| VerifyError::Sentinel {
                log_dir: log_dir.to_path_buf(),
                source,
            },
        )?;

        match status {
            VerificationStatus::Verified => info!(unit = %unit, "Verified"),
            VerificationStatus::Failed => warn!(unit = %unit, sentinel = ?sentinel, "Verification failed"),
        }

        Ok(VerificationResult {
            status,
            detail,
            sentinel,
        })
    }
}

/// Problems found across all sensors and exposures of a visit
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FocalPlaneReport {
    pub checked: usize,
    pub missing: Vec<String>,
    pub corrupt: Vec<(String, String)>,
}

impl FocalPlaneReport {
    /// 2 for missing files, 4 for corrupt files, 6 for both
    pub fn exit_code(&self) -> u8 {
        let mut code = 0;

        if !self.missing.is_empty() {
            code += 2;
        }
        if !self.corrupt.is_empty() {
            code += 4;
        }

        code
    }
}

/// Check the archived images of a whole visit below `output_root`
pub fn verify_focal_plane(
    visit: &VisitId,
    output_root: &Path,
    exposures: u16,
    checker: Option<&(dyn FormatChecker + Sync)>,
) -> FocalPlaneReport {
    let expected = focal_plane_exposures(exposures)
        .flat_map(|chip| {
            expected_outputs(&WorkUnit::Chip(visit.clone(), chip), output_root, exposures)
        })
        .collect::<Vec<_>>();
    let missing = missing_outputs(&expected);

    let corrupt = match checker {
        Some(checker) => {
            let present = expected
                .iter()
                .filter(|path| is_present(path))
                .cloned()
                .collect::<Vec<_>>();

            corrupt_outputs(&present, checker)
        }
        None => Vec::new(),
    };

    FocalPlaneReport {
        checked: expected.len(),
        missing,
        corrupt,
    }
}
