//! Resolution of storage tiers into concrete paths for a single work unit.

#[cfg(test)]
mod planner_test;

use crate::{
    config::{ConfigErrors, DatasetConfig, PipelineConfig},
    identity::{Stage, WorkUnit},
    layout,
};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StorageTier {
    /// where scripts and the stage 1 manifest are written
    Submission,
    /// shared inputs of stage 1
    SharedStage1,
    /// shared outputs of stage 1, inputs of stage 2
    SharedStage2,
    /// final images, logs and sentinels
    SavePath,
    /// per job scratch directory, removed once the job is done
    ExecutionScratch,
}

impl StorageTier {
    pub const ALL: [StorageTier; 5] = [
        StorageTier::Submission,
        StorageTier::SharedStage1,
        StorageTier::SharedStage2,
        StorageTier::SavePath,
        StorageTier::ExecutionScratch,
    ];

    /// configuration key of the tier root
    pub fn key(&self) -> &'static str {
        match self {
            Self::Submission => "paths.submission",
            Self::SharedStage1 => "paths.stage1",
            Self::SharedStage2 => "paths.stage2",
            Self::SavePath => "paths.save",
            Self::ExecutionScratch => "paths.scratch",
        }
    }
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submission => "Submission",
            Self::SharedStage1 => "SharedStage1",
            Self::SharedStage2 => "SharedStage2",
            Self::SavePath => "SavePath",
            Self::ExecutionScratch => "ExecutionScratch",
        };

        f.write_str(name)
    }
}

/// Every path a work unit touches, a pure function of the configuration and the unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    unit: WorkUnit,
    submission: PathBuf,
    stage1: PathBuf,
    stage2: PathBuf,
    save: PathBuf,
    scratch: PathBuf,
    output_root: PathBuf,
}

impl PathSet {
    pub fn plan(config: &PipelineConfig, unit: &WorkUnit) -> Result<Self, ConfigErrors> {
        let paths = &config.paths;
        let root = |tier: StorageTier, value: Option<&PathBuf>| {
            PipelineConfig::require_path(tier.key(), value)
        };
        let visit = unit.visit().to_string();

        let submission = root(StorageTier::Submission, paths.submission.as_ref())?;
        let stage1_root = root(StorageTier::SharedStage1, paths.stage1.as_ref())?;
        let stage2_root = root(StorageTier::SharedStage2, paths.stage2.as_ref())?;
        let save_root = root(StorageTier::SavePath, paths.save.as_ref())?;
        let scratch_root = root(StorageTier::ExecutionScratch, paths.scratch.as_ref())?;

        let planned = Self {
            unit: unit.clone(),
            submission,
            stage1: stage1_root.join(&visit),
            stage2: stage2_root.join(&visit),
            save: save_root.join(&visit),
            scratch: scratch_root.join(unit.to_string()),
            output_root: save_root,
        };

        // the scratch directory is removed recursively at the end of every job
        for tier in [StorageTier::SharedStage1, StorageTier::SharedStage2] {
            let shared = planned.get(tier);

            if shared.starts_with(&planned.scratch) {
                return Err(ConfigErrors::AliasedScratch {
                    tier: tier.to_string(),
                    scratch: planned.scratch.clone(),
                    shared: shared.to_path_buf(),
                });
            }
        }

        trace!(unit = %unit, paths = ?planned, "Planned paths");

        Ok(planned)
    }

    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn get(&self, tier: StorageTier) -> &Path {
        match tier {
            StorageTier::Submission => &self.submission,
            StorageTier::SharedStage1 => &self.stage1,
            StorageTier::SharedStage2 => &self.stage2,
            StorageTier::SavePath => &self.save,
            StorageTier::ExecutionScratch => &self.scratch,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (StorageTier, &Path)> + '_ {
        StorageTier::ALL.into_iter().map(|tier| (tier, self.get(tier)))
    }

    /// logs and sentinels of the visit
    pub fn log_dir(&self) -> PathBuf {
        self.save.join(layout::LOG_DIR)
    }

    /// stage 1 parameter files and the stage 2 scripts of the visit
    pub fn parameter_dir(&self) -> PathBuf {
        self.stage2
            .join(layout::parameter_dir_name(self.unit.observation()))
    }

    /// root of the `eimage/` and `raw/` archive trees
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// location the verification gate inspects for this unit
    pub fn verify_location(&self) -> &Path {
        match self.unit.stage() {
            Stage::Visit => &self.stage2,
            Stage::Chip => &self.output_root,
        }
    }
}

/// How a dataset reaches the data directory of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingStrategy {
    /// link directly into shared storage
    LinkShared,
    /// copy and extract a tarball to node local storage unless `check_dir` already exists there
    CopyExtract {
        tarball: PathBuf,
        check_dir: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataStaging {
    pub name: String,
    /// directory the links point into
    pub source: PathBuf,
    pub links: Vec<String>,
    pub strategy: StagingStrategy,
}

impl DataStaging {
    fn plan(
        name: &str,
        dataset: &DatasetConfig,
        config: &PipelineConfig,
    ) -> Result<Self, ConfigErrors> {
        let key = |field: &str| format!("data.{name}.{field}");
        let shared = PipelineConfig::require_path(&key("shared_path"), dataset.shared_path.as_ref())?;
        let links = if dataset.links.is_empty() {
            vec![name.to_owned()]
        } else {
            dataset.links.clone()
        };

        if dataset.use_shared_in_place {
            return Ok(Self {
                name: name.to_owned(),
                source: shared,
                links,
                strategy: StagingStrategy::LinkShared,
            });
        }

        let local_root = PipelineConfig::require_path(
            "general.scratch_data",
            config.general.scratch_data.as_ref(),
        )?;
        let tarball = dataset
            .tarball
            .as_ref()
            .ok_or_else(|| ConfigErrors::MissingKey(key("tarball")))?;
        let check_dir = dataset
            .check_dir
            .as_ref()
            .ok_or_else(|| ConfigErrors::MissingKey(key("check_dir")))?;

        if tarball.is_empty() || check_dir.is_absolute() {
            return Err(ConfigErrors::Dataset(name.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            strategy: StagingStrategy::CopyExtract {
                tarball: shared.join(tarball),
                check_dir: local_root.join(check_dir),
            },
            source: local_root,
            links,
        })
    }
}

/// Datasets required by a stage, each with its staging strategy
pub fn plan_datasets(config: &PipelineConfig, stage: Stage) -> Result<Vec<DataStaging>, ConfigErrors> {
    config
        .data
        .iter()
        .filter(|(_, dataset)| dataset.stages.contains(&stage))
        .map(|(name, dataset)| DataStaging::plan(name, dataset, config))
        .collect()
}
