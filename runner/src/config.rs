
use crate::identity::Stage;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {0:?}")]
    ReadConfig(PathBuf, #[source] Error),
    #[error("Failed to parse config file")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Required key {0} is not set")]
    MissingKey(String),
    #[error("{0} must be an absolute path")]
    RelativePath(String),
    #[error("Scheduler not supported: {0}")]
    UnsupportedScheduler(String),
    #[error("Scheduler {0} requires a `{0}` section")]
    MissingSection(String),
    #[error("Execution scratch {scratch:?} aliases {tier} at {shared:?}")]
    AliasedScratch {
        tier: String,
        scratch: PathBuf,
        shared: PathBuf,
    },
    #[error("Dataset {0} is misconfigured")]
    Dataset(String),
    #[error("Preflight checks failed")]
    Preflight,
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    // named datasets staged into every job, e.g. focal plane data or SED libraries
    #[serde(default)]
    pub data: BTreeMap<String, DatasetConfig>,
    #[serde(default)]
    pub stage1: StageConfig,
    #[serde(default)]
    pub stage2: StageConfig,
    pub pbs: Option<BatchConfig>,
    pub slurm: Option<BatchConfig>,

    #[serde(alias = "db")]
    pub database: Option<DatabaseConfig>,

    // file this config was loaded from, passed on to the generated scripts
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct GeneralConfig {
    /// runner executable invoked by the verify and emit steps
    #[serde(default = "default_runner")]
    pub runner: PathBuf,
    /// install prefix of the simulation binaries on the execution nodes
    pub bin_dir: Option<PathBuf>,
    #[serde(default = "default_fits_checker")]
    pub fits_checker: PathBuf,
    /// upper bound of the random delay before a job touches shared storage
    #[serde(default)]
    pub sleep_max: u32,
    #[serde(default)]
    pub debug_level: u8,
    /// exposures per sensor
    #[serde(default = "default_exposures")]
    pub exposures: u16,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
    /// node local root for datasets that are copied instead of linked
    pub scratch_data: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            runner: default_runner(),
            bin_dir: None,
            fits_checker: default_fits_checker(),
            sleep_max: 0,
            debug_level: 0,
            exposures: default_exposures(),
            manifest_name: default_manifest_name(),
            scratch_data: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub submission: Option<PathBuf>,
    pub stage1: Option<PathBuf>,
    pub stage2: Option<PathBuf>,
    pub save: Option<PathBuf>,
    pub scratch: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatasetConfig {
    pub shared_path: Option<PathBuf>,
    // archive inside of shared_path, required unless the dataset is used in place
    pub tarball: Option<String>,
    // directory whose presence marks a complete local copy
    pub check_dir: Option<PathBuf>,
    // entries linked into the job data directory, defaults to the dataset name
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub use_shared_in_place: bool,
    #[serde(default = "default_stages")]
    pub stages: Vec<Stage>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    // Name of the script writer, see Writers::load for the selection process
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            scheduler: default_scheduler(),
        }
    }
}

/// Resource request of a batch scheduler
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,
    pub email: Option<String>,
    #[serde(default = "default_one")]
    pub nodes: u32,
    #[serde(default = "default_one")]
    pub cores_per_node: u32,
    pub memory_mb: Option<u32>,
    #[serde(default = "default_walltime")]
    pub walltime: String,
    pub queue: Option<String>,
    pub account: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl PipelineConfig {
    /// read and parse a config file, remembering where it came from
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigErrors::ReadConfig(path.to_path_buf(), e))?;
        let mut config = Self::from_yaml(&content)?;

        config.source = Some(fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
        debug!(source = ?config.source, "Loaded configuration");

        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn stage(&self, stage: Stage) -> &StageConfig {
        match stage {
            Stage::Visit => &self.stage1,
            Stage::Chip => &self.stage2,
        }
    }

    /// resource section of a batch scheduler, if present
    pub fn batch(&self, scheduler: &str) -> Option<&BatchConfig> {
        match scheduler {
            "pbs" => self.pbs.as_ref(),
            "slurm" => self.slurm.as_ref(),
            _ => None,
        }
    }

    /// resolve a required root, rejecting unset and relative paths
    pub fn require_path(key: &str, value: Option<&PathBuf>) -> Result<PathBuf, ConfigErrors> {
        match value {
            None => Err(ConfigErrors::MissingKey(key.to_owned())),
            Some(path) if !path.is_absolute() => Err(ConfigErrors::RelativePath(key.to_owned())),
            Some(path) => Ok(path.clone()),
        }
    }

    pub fn preflight_checks(&mut self) -> Result<(), ConfigErrors> {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        for (key, value) in [
            ("paths.submission", &self.paths.submission),
            ("paths.stage1", &self.paths.stage1),
            ("paths.stage2", &self.paths.stage2),
            ("paths.save", &self.paths.save),
            ("paths.scratch", &self.paths.scratch),
        ] {
            if let Err(e) = Self::require_path(key, value.as_ref()) {
                error!("{e}");
                contains_error = true;
            }
        }

        for stage in Stage::ALL {
            let config = match stage {
                Stage::Visit => &mut self.stage1,
                Stage::Chip => &mut self.stage2,
            };
            config.scheduler = config.scheduler.to_lowercase();

            match config.scheduler.as_str() {
                "shell" | "direct-shell" => {}
                "pbs" | "resource-managed-batch" => {
                    config.scheduler = "pbs".to_owned();

                    if self.pbs.is_none() {
                        error!("stage{stage}.scheduler is pbs but no pbs section is defined");
                        contains_error = true;
                    }
                }
                "slurm" => {
                    if self.slurm.is_none() {
                        error!("stage{stage}.scheduler is slurm but no slurm section is defined");
                        contains_error = true;
                    }
                }
                scheduler => {
                    error!("stage{stage}.scheduler ({scheduler}) is not supported, please use shell, pbs or slurm");
                    contains_error = true;
                }
            }
        }

        if self.general.exposures == 0 || self.general.exposures > 1000 {
            error!(
                "general.exposures must be between 1 and 1000, got {}",
                self.general.exposures
            );
            contains_error = true;
        }

        if self.general.bin_dir.is_none() {
            warn!("general.bin_dir is not set, binaries are expected on the PATH of the execution nodes");
        }

        if self.general.runner.is_absolute() {
            match check_executable(&self.general.runner) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "general.runner {} is not executable, jobs will fail to verify",
                    self.general.runner.to_string_lossy()
                ),
                Err(e) => warn!(
                    "Failed to determine if general.runner ({}) is an executable: {e}",
                    self.general.runner.to_string_lossy()
                ),
            }
        }

        if self.data.is_empty() {
            warn!("No dataset was defined, jobs will run without staged data");
        }

        for (name, dataset) in self.data.iter_mut() {
            if dataset.shared_path.is_none() {
                error!("data.{name}.shared_path must be set");
                contains_error = true;
            }

            if !dataset.use_shared_in_place {
                if dataset.tarball.is_none() {
                    error!("data.{name}.tarball is required unless use_shared_in_place is set");
                    contains_error = true;
                }
                if dataset.check_dir.is_none() {
                    error!("data.{name}.check_dir is required unless use_shared_in_place is set");
                    contains_error = true;
                }
                if self.general.scratch_data.is_none() {
                    error!("data.{name} is copied to the nodes but general.scratch_data is not set");
                    contains_error = true;
                }
            }

            if dataset.links.is_empty() {
                dataset.links.push(name.clone());
            }

            if dataset.stages.is_empty() {
                warn!("data.{name} is not used by any stage");
            }
        }

        if contains_error {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(())
        }
    }
}

fn default_runner() -> PathBuf {
    PathBuf::from("phosim-runner")
}

fn default_fits_checker() -> PathBuf {
    PathBuf::from("fitsverify")
}

fn default_exposures() -> u16 {
    2
}

fn default_manifest_name() -> String {
    "allVisits-Jobs.lis".to_owned()
}

fn default_stages() -> Vec<Stage> {
    Stage::ALL.to_vec()
}

fn default_scheduler() -> String {
    "shell".to_owned()
}

fn default_job_name() -> String {
    "phosim".to_owned()
}

fn default_one() -> u32 {
    1
}

fn default_walltime() -> String {
    "12:00:00".to_owned()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("phosim-jobs.db")
}
