use crate::config::PipelineConfig;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use tracing::{debug, trace};

/// First line of a clean report of the FITS checker
pub const CLEAN_PREFIX: &str = "verification OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatReport {
    pub clean: bool,
    pub output: String,
}

/// Validates the internal format of a single output file
pub trait FormatChecker {
    fn check(&self, path: &Path) -> FormatReport;
}

/// Runs an external checker executable, `fitsverify -q -e <file>` by default
#[derive(Debug, Clone)]
pub struct ExecChecker {
    pub exec: PathBuf,
    pub params: Vec<OsString>,
}

impl ExecChecker {
    pub fn new(exec: PathBuf) -> Self {
        Self {
            exec,
            params: vec![OsString::from("-q"), OsString::from("-e")],
        }
    }

    pub fn load(config: &PipelineConfig) -> Self {
        Self::new(config.general.fits_checker.clone())
    }
}

impl FormatChecker for ExecChecker {
    #[tracing::instrument(level = "debug", skip(self))]
    fn check(&self, path: &Path) -> FormatReport {
        match Command::new(&self.exec)
            .args(self.params.iter())
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
        {
            Ok(output) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                trace!("Output from checker: {stdout}");

                let clean = stdout
                    .lines()
                    .next()
                    .map_or(false, |line| line.trim_start().starts_with(CLEAN_PREFIX));

                if clean {
                    FormatReport {
                        clean,
                        output: stdout,
                    }
                } else {
                    debug!(status = ?output.status, "Checker rejected file");

                    let mut report = stdout;
                    report.push_str(&String::from_utf8_lossy(&output.stderr));

                    FormatReport {
                        clean,
                        output: report.trim_end().to_owned(),
                    }
                }
            }
            Err(e) => FormatReport {
                clean: false,
                output: format!("failed to run {}: {e}", self.exec.to_string_lossy()),
            },
        }
    }
}
