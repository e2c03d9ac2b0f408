mod local;


use crate::script::{EXIT_BINARY, EXIT_EMIT, EXIT_STAGE_IN, EXIT_STAGE_OUT, EXIT_VERIFY};
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

pub use local::LocalExecutor;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Failed to build thread pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to read manifest {path:?}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a manifest line did not succeed, derived from its exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Failure {
    StageIn,
    ExternalBinary,
    StageOut,
    Verification,
    Emit,
    /// killed by a signal
    Signal,
    /// could not be started at all
    Spawn,
    Other(i32),
}

impl Failure {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(EXIT_STAGE_IN) => Self::StageIn,
            Some(EXIT_BINARY) => Self::ExternalBinary,
            Some(EXIT_STAGE_OUT) => Self::StageOut,
            Some(EXIT_VERIFY) => Self::Verification,
            Some(EXIT_EMIT) => Self::Emit,
            Some(code) => Self::Other(code),
            None => Self::Signal,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StageIn => write!(f, "staging input failed"),
            Self::ExternalBinary => write!(f, "simulation binary failed"),
            Self::StageOut => write!(f, "staging output failed"),
            Self::Verification => write!(f, "verification failed"),
            Self::Emit => write!(f, "emit failed"),
            Self::Signal => write!(f, "killed by signal"),
            Self::Spawn => write!(f, "failed to start"),
            Self::Other(code) => write!(f, "exited with status {code}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub failed: Vec<(String, Failure)>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.total - self.failed.len()
    }
}

#[derive(Clone, Debug)]
pub enum Executors {
    Local(LocalExecutor),
}

impl Executors {
    pub fn load(name: &str, threads: Option<usize>, pause: Duration) -> Result<Self, ExecutorError> {
        match name {
            "local" => Ok(Self::Local(LocalExecutor::new(threads, pause))),
            _ => Err(ExecutorError::UnsupportedExecutor(name.to_owned())),
        }
    }

    pub fn execute(&self, lines: Vec<String>) -> Result<RunSummary, ExecutorError> {
        match self {
            Self::Local(executor) => executor.execute(lines),
        }
    }

    /// run every line of a manifest file
    pub fn execute_manifest(&self, path: &std::path::Path) -> Result<RunSummary, ExecutorError> {
        let lines = crate::manifest::read_lines(path).map_err(|source| ExecutorError::Manifest {
            path: path.to_path_buf(),
            source,
        })?;

        self.execute(lines)
    }
}
