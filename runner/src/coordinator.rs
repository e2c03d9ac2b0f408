//! Generation of job scripts and manifests for both stages.
//!
//! Stage 1 works on instance catalogs and produces one script per visit
//! plus a single manifest. Stage 2 is emitted per visit once the visit's
//! stage 1 sentinel exists: a verified visit gets one script per sensor
//! exposure and its own manifest, a failed visit gets a placeholder that
//! carries the failure detail instead.


use crate::{
    config::{ConfigErrors, PipelineConfig},
    identity::{
        focal_plane_exposures, trimfile, ChipExposure, ObservationId, Stage, VisitId, WorkUnit,
    },
    layout,
    manifest::{Manifest, ManifestBuilder, ManifestEntry},
    planner::{plan_datasets, DataStaging, PathSet, StorageTier},
    script::{ScriptContext, ScriptError, ScriptSpec, Writers},
    tracker::Trackers,
    verify::{
        checker::FormatChecker, sentinel, VerificationGate, VerificationResult,
        VerificationStatus, VerifyError,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info, instrument, warn};

/// Suffix of the placeholder written instead of a stage 2 manifest
pub const BLOCKED_SUFFIX: &str = ".verify_error";

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigErrors),
    #[error("Failed to write script")]
    Script(#[from] ScriptError),
    #[error("Verification failed to record its outcome")]
    Verify(#[from] VerifyError),
    #[error("I/O failure on {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CoordinatorError + '_ {
    move |source| CoordinatorError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn remove_if_present(path: &Path) -> Result<(), CoordinatorError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(path)(e)),
        _ => Ok(()),
    }
}

/// Remove stage 2 scripts of `observation` left over from an earlier run
fn prune_scripts(
    parameter_dir: &Path,
    observation: &ObservationId,
    keep: &BTreeSet<PathBuf>,
) -> Result<(), CoordinatorError> {
    let prefix = layout::chip_script_prefix(observation);
    let mut pruned = 0;

    let entries = match fs::read_dir(parameter_dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        entries => entries.map_err(io_error(parameter_dir))?,
    };

    for entry in entries {
        let path = entry.map_err(io_error(parameter_dir))?.path();
        let stale = path
            .file_name()
            .and_then(|name| name.to_str())
            .map_or(false, |name| name.starts_with(&prefix))
            && !keep.contains(&path);

        if stale {
            remove_if_present(&path)?;
            pruned += 1;
        }
    }

    if pruned > 0 {
        info!(pruned, "Removed stage 2 scripts missing from the new manifest");
    }

    Ok(())
}

/// An input that did not make it into the stage 1 manifest
#[derive(Debug)]
pub struct SkippedInput {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug)]
pub struct VisitReport {
    pub manifest: Manifest,
    pub skipped: Vec<SkippedInput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChipOutcome {
    /// stage 1 verified, stage 2 scripts and manifest written
    Manifest(Manifest),
    /// stage 1 failed, placeholder written in place of the manifest
    Blocked { placeholder: PathBuf },
    /// stage 1 has not been verified yet
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    /// no sentinel, nothing to emit
    Pending,
    /// stage 2 unit recorded with its verification status
    Recorded(VerificationStatus),
    /// stage 1 unit, stage 2 was emitted from its sentinel
    Chips(ChipOutcome),
}

pub struct Coordinator<'a> {
    config: &'a PipelineConfig,
    tracker: &'a Trackers,
    rng: StdRng,
}

impl<'a> Coordinator<'a> {
    pub fn new(config: &'a PipelineConfig, tracker: &'a Trackers) -> Self {
        Self {
            config,
            tracker,
            rng: StdRng::from_entropy(),
        }
    }

    /// deterministic jitter, mostly for tests
    pub fn with_seed(config: &'a PipelineConfig, tracker: &'a Trackers, seed: u64) -> Self {
        Self {
            config,
            tracker,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn jitter(&mut self) -> u32 {
        match self.config.general.sleep_max {
            0 => 0,
            max => self.rng.gen_range(0..=max),
        }
    }

    fn track(&self, unit: &WorkUnit, script: &Path) {
        if let Err(e) = self.tracker.submitted(unit, script) {
            error!(unit = %unit, error = ?e, "Failed to record submission: {e}");
        }
    }

    fn write_unit(
        &mut self,
        writers: &Writers,
        datasets: &[DataStaging],
        paths: &PathSet,
    ) -> Result<ManifestEntry, CoordinatorError> {
        let ctx = ScriptContext {
            config: self.config,
            paths,
            datasets,
            jitter: self.jitter(),
        };
        let entry = writers.write_script(&ScriptSpec::new(paths.unit().clone()), &ctx)?;
        self.track(paths.unit(), &entry.script);

        Ok(entry)
    }

    /// stage the inputs of a visit into SharedStage1 and write its script
    fn prepare_visit(
        &mut self,
        writers: &Writers,
        datasets: &[DataStaging],
        paths: &PathSet,
        catalog: &Path,
        extra: Option<&Path>,
    ) -> Result<ManifestEntry, CoordinatorError> {
        let obs = paths.unit().observation();
        let shared = paths.get(StorageTier::SharedStage1);
        let log_dir = paths.log_dir();

        for directory in [shared, log_dir.as_path()] {
            fs::create_dir_all(directory).map_err(io_error(directory))?;
        }

        let staged = shared.join(layout::catalog_name(obs));
        fs::copy(catalog, &staged).map_err(io_error(catalog))?;

        if let Some(extra) = extra {
            let staged = shared.join(layout::extra_commands_name(obs));
            fs::copy(extra, &staged).map_err(io_error(extra))?;
        }

        self.write_unit(writers, datasets, paths)
    }

    /// Write one stage 1 script per visit and the stage 1 manifest
    #[instrument(skip_all, level = "info")]
    pub fn generate_visits<I: IntoIterator<Item = PathBuf>>(
        &mut self,
        catalogs: I,
        extra: Option<&Path>,
    ) -> Result<VisitReport, CoordinatorError> {
        let config = self.config;
        let writers = Writers::load(config, Stage::Visit)?;
        let datasets = plan_datasets(config, Stage::Visit)?;
        let submission =
            PipelineConfig::require_path("paths.submission", config.paths.submission.as_ref())?;
        let mut builder = ManifestBuilder::new(submission.join(&config.general.manifest_name));
        let mut skipped = Vec::new();
        let mut seen = BTreeSet::new();

        for catalog in catalogs {
            let visit = match trimfile::resolve_visit(&catalog, extra) {
                Ok(visit) => visit,
                Err(e) => {
                    error!(catalog = ?catalog, "Skipping instance catalog: {e}");
                    skipped.push(SkippedInput {
                        path: catalog,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !seen.insert(visit.clone()) {
                warn!(catalog = ?catalog, visit = %visit, "Visit was already generated from another catalog");
                skipped.push(SkippedInput {
                    path: catalog,
                    reason: format!("duplicate visit {visit}"),
                });
                continue;
            }

            let paths = PathSet::plan(config, &WorkUnit::Visit(visit))?;

            match self.prepare_visit(&writers, &datasets, &paths, &catalog, extra) {
                Ok(entry) => builder.push(entry),
                Err(e) => {
                    error!(catalog = ?catalog, unit = %paths.unit(), error = ?e, "Failed to prepare visit: {e}");
                    skipped.push(SkippedInput {
                        path: catalog,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let manifest_path = submission.join(&config.general.manifest_name);
        let manifest = builder.finish().map_err(io_error(&manifest_path))?;
        info!(
            visits = manifest.len(),
            skipped = skipped.len(),
            "Generated stage 1"
        );

        Ok(VisitReport { manifest, skipped })
    }

    /// Emit stage 2 of a visit according to its stage 1 sentinel
    #[instrument(skip(self, visit, only), level = "info", fields(visit = %visit))]
    pub fn generate_chips(
        &mut self,
        visit: &VisitId,
        only: &[ChipExposure],
    ) -> Result<ChipOutcome, CoordinatorError> {
        let config = self.config;
        let unit = WorkUnit::Visit(visit.clone());
        let paths = PathSet::plan(config, &unit)?;
        let log_dir = paths.log_dir();
        let manifest_path = paths
            .get(StorageTier::SavePath)
            .join(layout::chip_manifest_name(visit));
        let mut placeholder = manifest_path.clone().into_os_string();
        placeholder.push(BLOCKED_SUFFIX);
        let placeholder = PathBuf::from(placeholder);

        let sentinel = sentinel::read_sentinel(&log_dir, &unit).map_err(io_error(&log_dir))?;

        match sentinel {
            None => {
                info!("Stage 1 has not been verified yet");
                Ok(ChipOutcome::Pending)
            }
            Some(sentinel) if sentinel.status == VerificationStatus::Failed => {
                remove_if_present(&manifest_path)?;
                fs::write(&placeholder, &sentinel.content).map_err(io_error(&placeholder))?;
                warn!(placeholder = ?placeholder, "Stage 1 failed verification, no stage 2 jobs emitted");

                Ok(ChipOutcome::Blocked { placeholder })
            }
            Some(_) => {
                remove_if_present(&placeholder)?;

                let writers = Writers::load(config, Stage::Chip)?;
                let datasets = plan_datasets(config, Stage::Chip)?;
                let mut builder = ManifestBuilder::new(manifest_path.clone());
                let exposures = focal_plane_exposures(config.general.exposures)
                    .filter(|chip| only.is_empty() || only.contains(chip))
                    .collect::<Vec<_>>();

                for chip in only.iter().filter(|chip| !exposures.contains(chip)) {
                    warn!(chip = %chip, "Requested exposure is not part of the focal plane, ignoring it");
                }

                let mut scripts = BTreeSet::new();
                for chip in exposures {
                    let paths = PathSet::plan(config, &WorkUnit::Chip(visit.clone(), chip))?;
                    let entry = self.write_unit(&writers, &datasets, &paths)?;
                    scripts.insert(entry.script.clone());
                    builder.push(entry);
                }

                prune_scripts(&paths.parameter_dir(), &visit.observation, &scripts)?;

                Ok(ChipOutcome::Manifest(
                    builder.finish().map_err(io_error(&manifest_path))?,
                ))
            }
        }
    }

    /// Emit stage 2 for several visits, failures stay local to their visit
    pub fn generate_all_chips(
        &mut self,
        visits: &[VisitId],
        only: &[ChipExposure],
    ) -> Result<Vec<(VisitId, Result<ChipOutcome, CoordinatorError>)>, CoordinatorError> {
        let mut outcomes = Vec::with_capacity(visits.len());

        for visit in visits {
            match self.generate_chips(visit, only) {
                Err(CoordinatorError::Config(e)) => return Err(CoordinatorError::Config(e)),
                Err(e) => {
                    error!(visit = %visit, error = ?e, "Failed to emit stage 2: {e}");
                    outcomes.push((visit.clone(), Err(e)));
                }
                Ok(outcome) => outcomes.push((visit.clone(), Ok(outcome))),
            }
        }

        Ok(outcomes)
    }

    /// Visits with a directory in the save tier
    pub fn discover_visits(&self) -> Result<Vec<VisitId>, CoordinatorError> {
        let save = PipelineConfig::require_path("paths.save", self.config.paths.save.as_ref())?;
        let mut visits = Vec::new();

        for entry in fs::read_dir(&save).map_err(io_error(&save))? {
            let entry = entry.map_err(io_error(&save))?;

            if !entry.file_type().map_or(false, |kind| kind.is_dir()) {
                continue;
            }
            if let Some(visit) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<VisitId>().ok())
            {
                visits.push(visit);
            }
        }

        visits.sort();

        Ok(visits)
    }

    /// Verify a unit in `location`, defaulting to where its stage stages out to
    pub fn verify(
        &self,
        unit: &WorkUnit,
        location: Option<&Path>,
        checker: &(dyn FormatChecker + Sync),
    ) -> Result<VerificationResult, CoordinatorError> {
        let paths = PathSet::plan(self.config, unit)?;
        let location = location.unwrap_or_else(|| paths.verify_location());

        Ok(VerificationGate::new(checker, self.config.general.exposures).verify(
            unit,
            location,
            &paths.log_dir(),
        )?)
    }

    /// Final step of every job: record the outcome and, for stage 1, emit stage 2
    #[instrument(skip(self), level = "info")]
    pub fn emit(&mut self, unit: &WorkUnit) -> Result<EmitOutcome, CoordinatorError> {
        let paths = PathSet::plan(self.config, unit)?;
        let log_dir = paths.log_dir();

        let status = match sentinel::read_sentinel(&log_dir, unit).map_err(io_error(&log_dir))? {
            Some(sentinel) => sentinel.status,
            None => {
                warn!(unit = %unit, "No sentinel found, was the unit verified?");
                return Ok(EmitOutcome::Pending);
            }
        };

        if let Err(e) = self.tracker.finished(unit, status) {
            error!(unit = %unit, error = ?e, "Failed to record result: {e}");
        }

        match unit {
            WorkUnit::Visit(visit) => Ok(EmitOutcome::Chips(self.generate_chips(visit, &[])?)),
            WorkUnit::Chip(..) => Ok(EmitOutcome::Recorded(status)),
        }
    }
}
