//! Rendering of the per unit job scripts.
//!
//! A [`ScriptSpec`] lists the scheduler agnostic steps of a job. Every
//! [`ScriptWriter`] renders those steps into a POSIX shell script; the
//! variants only differ in their header directives and in how the script
//! is handed to the scheduler. The step bodies are shared through the
//! default trait methods.

pub mod pbs;
pub mod shell;
pub mod slurm;

#[cfg(test)]
mod script_test;

use crate::{
    config::{ConfigErrors, PipelineConfig},
    identity::{Stage, WorkUnit},
    layout,
    manifest::ManifestEntry,
    planner::{DataStaging, PathSet, StagingStrategy, StorageTier},
};
use once_cell::sync::Lazy;
use std::{
    borrow::Cow,
    collections::BTreeSet,
    fmt::Write as _,
    fs,
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// Exit codes of the generated scripts
pub const EXIT_STAGE_IN: i32 = 10;
pub const EXIT_BINARY: i32 = 11;
pub const EXIT_STAGE_OUT: i32 = 12;
pub const EXIT_VERIFY: i32 = 13;
pub const EXIT_EMIT: i32 = 14;

/// Preprocessing binaries of stage 1, each reads the instance catalog on stdin
pub const VISIT_BINARIES: [(&str, &str); 4] = [
    ("atmosphere", "ancillary/atmosphere/turb2d"),
    ("optics", "ancillary/optics_parameters/optics_parameters"),
    ("tracking", "ancillary/tracking/tracking"),
    ("trim", "ancillary/trim/trim"),
];

/// Binaries of stage 2 with the parameter file kind they read on stdin
pub const CHIP_BINARIES: [(&str, &str, &str); 4] = [
    ("raytrace", "raytrace/lsst", layout::CHIP_PARAMETER_KINDS[0]),
    ("background", "ancillary/Add_Background/add_background", layout::CHIP_PARAMETER_KINDS[1]),
    ("cosmic rays", "ancillary/cosmic_rays/create_rays", layout::CHIP_PARAMETER_KINDS[2]),
    ("e2adc", "ancillary/e2adc/e2adc", layout::CHIP_PARAMETER_KINDS[3]),
];

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Failed to write script {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    StageIn,
    Execute,
    StageOut,
    Verify,
    Emit,
}

impl Step {
    pub const SEQUENCE: [Step; 5] = [
        Step::StageIn,
        Step::Execute,
        Step::StageOut,
        Step::Verify,
        Step::Emit,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            Self::StageIn => "Stage in",
            Self::Execute => "Execute",
            Self::StageOut => "Stage out",
            Self::Verify => "Verify",
            Self::Emit => "Emit",
        }
    }
}

/// Ordered steps of a single job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSpec {
    unit: WorkUnit,
    steps: Vec<Step>,
}

impl ScriptSpec {
    pub fn new(unit: WorkUnit) -> Self {
        Self {
            unit,
            steps: Step::SEQUENCE.to_vec(),
        }
    }

    pub fn unit(&self) -> &WorkUnit {
        &self.unit
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// Everything resolved up-front that a writer needs to render one unit
#[derive(Debug, Clone, Copy)]
pub struct ScriptContext<'a> {
    pub config: &'a PipelineConfig,
    pub paths: &'a PathSet,
    pub datasets: &'a [DataStaging],
    /// seconds to wait before touching shared storage
    pub jitter: u32,
}

static CREATOR: Lazy<String> = Lazy::new(|| {
    let user = nix::unistd::User::from_uid(nix::unistd::getuid())
        .ok()
        .flatten()
        .map(|user| user.name)
        .unwrap_or_else(|| "unknown".to_owned());
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|host| host.into_string().ok())
        .unwrap_or_else(|| "unknown".to_owned());

    format!("{user}@{host}")
});

/// Quote a value for POSIX sh if it contains anything but plain path characters
pub fn quote(value: &str) -> Cow<'_, str> {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:,+@%".contains(c));

    if plain {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

pub fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy()).into_owned()
}

fn section(script: &mut String, title: &str) {
    let _ = write!(
        script,
        "\n### ---------------------------------------\n### {title}\n### ---------------------------------------\n"
    );
}

fn binary_path(config: &PipelineConfig, exec: &str) -> String {
    match config.general.bin_dir {
        Some(ref bin_dir) => quote_path(&bin_dir.join(exec)),
        None => quote(exec).into_owned(),
    }
}

/// `<runner> [--config <file>] <subcommand>`
fn runner_command(config: &PipelineConfig, subcommand: &str) -> String {
    let mut command = quote_path(&config.general.runner);

    if let Some(ref source) = config.source {
        let _ = write!(command, " --config {}", quote_path(source));
    }
    let _ = write!(command, " {subcommand}");

    command
}

fn stage_dataset(script: &mut String, dataset: &DataStaging) {
    let name = &dataset.name;
    let source = &dataset.source;
    let _ = writeln!(script, "# dataset {name}");

    if let StagingStrategy::CopyExtract { tarball, check_dir } = &dataset.strategy {
        let archive = tarball
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let _ = write!(
            script,
            "if [ ! -d {check} ]; then\n  mkdir -p {source} || fail {EXIT_STAGE_IN} \"cannot create {source}\"\n  cp {tarball} {source}/ || fail {EXIT_STAGE_IN} \"cannot copy dataset {name}\"\n  (cd {source} && tar xf {archive} && rm -f {archive}) || fail {EXIT_STAGE_IN} \"cannot extract dataset {name}\"\nfi\n",
            check = quote_path(check_dir),
            source = quote_path(source),
            tarball = quote_path(tarball),
            archive = quote(&archive),
        );
    }

    for link in dataset.links.iter() {
        let _ = writeln!(
            script,
            "ln -sfn {} {}/{} || fail {EXIT_STAGE_IN} \"cannot link dataset {name}\"",
            quote_path(&source.join(link)),
            layout::DATA_DIR,
            quote(link)
        );
    }
}

/// Capability of rendering a [`ScriptSpec`] for one kind of scheduler
pub trait ScriptWriter {
    /// name used in the configuration
    fn name(&self) -> &'static str;

    fn extension(&self) -> &'static str {
        "sh"
    }

    /// interpreter line and scheduler directives
    fn render_header(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String;

    /// manifest line that submits `script`
    fn invocation(&self, script: &Path, ctx: &ScriptContext) -> String;

    fn render_prelude(&self, spec: &ScriptSpec, _ctx: &ScriptContext) -> String {
        let unit = spec.unit();

        format!(
            "### ---------------------------------------\n### Script created by: {creator}\n### Work unit:         {unit}\n### Stage:             {stage}\n### Scheduler:         {name}\n### ---------------------------------------\n\nfail() {{\n  echo \"$2\" >&2\n  exit \"$1\"\n}}\n",
            creator = *CREATOR,
            stage = unit.stage(),
            name = self.name(),
        )
    }

    fn render_stage_in(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let paths = ctx.paths;
        let unit = spec.unit();
        let obs = unit.observation();
        let scratch = quote_path(paths.get(StorageTier::ExecutionScratch));
        let mut script = String::new();

        if ctx.jitter > 0 {
            let _ = write!(
                script,
                "echo \"Sleeping for {jitter} seconds\"\nsleep {jitter}\n",
                jitter = ctx.jitter
            );
        }

        let _ = write!(
            script,
            "mkdir -p {scratch} || fail {EXIT_STAGE_IN} \"cannot create {scratch}\"\ncd {scratch} || fail {EXIT_STAGE_IN} \"cannot enter {scratch}\"\nmkdir -p {} {} || fail {EXIT_STAGE_IN} \"cannot create work directories\"\n",
            layout::DATA_DIR,
            layout::OUTPUT_DIR
        );

        for dataset in ctx.datasets {
            stage_dataset(&mut script, dataset);
        }

        match unit.chip() {
            None => {
                let _ = writeln!(
                    script,
                    "cp -R {}/. . || fail {EXIT_STAGE_IN} \"cannot copy visit inputs\"",
                    quote_path(paths.get(StorageTier::SharedStage1))
                );
            }
            Some(chip) => {
                let tarball = layout::node_tarball(obs);
                let parameter_dir = paths.parameter_dir();
                let parameters = layout::chip_parameter_files(obs, chip)
                    .into_iter()
                    .chain(layout::visit_parameter_files(obs))
                    .map(|name| quote_path(&parameter_dir.join(name)))
                    .collect::<Vec<_>>()
                    .join(" ");

                let _ = write!(
                    script,
                    "cp {shared} . || fail {EXIT_STAGE_IN} \"cannot copy {tarball}\"\ntar xzf {tarball} && rm -f {tarball} || fail {EXIT_STAGE_IN} \"cannot extract {tarball}\"\ncp {parameters} . || fail {EXIT_STAGE_IN} \"cannot copy parameter files\"\n",
                    shared = quote_path(&paths.get(StorageTier::SharedStage2).join(&tarball)),
                );
            }
        }

        script
    }

    fn render_execute(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let unit = spec.unit();
        let obs = unit.observation();
        let mut script = String::new();

        let invocations = match unit.chip() {
            None => VISIT_BINARIES
                .iter()
                .map(|(name, exec)| (*name, *exec, layout::catalog_name(obs)))
                .collect::<Vec<_>>(),
            Some(chip) => CHIP_BINARIES
                .iter()
                .map(|(name, exec, kind)| (*name, *exec, layout::chip_parameter_file(kind, obs, chip)))
                .collect(),
        };

        for (name, exec, input) in invocations {
            let _ = write!(
                script,
                "echo \"Running {name}\"\n{} < {} || fail {EXIT_BINARY} \"{name} exited with status $?\"\n",
                binary_path(ctx.config, exec),
                quote(&input)
            );
        }

        script
    }

    fn render_stage_out(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let paths = ctx.paths;
        let unit = spec.unit();
        let obs = unit.observation();
        let mut script = String::new();

        match unit.chip() {
            None => {
                let parameter_dir = quote_path(&paths.parameter_dir());
                let tarball = quote_path(
                    &paths
                        .get(StorageTier::SharedStage2)
                        .join(layout::node_tarball(obs)),
                );

                // every parameter file moves, including those of each sensor exposure
                let _ = write!(
                    script,
                    "mkdir -p {parameter_dir} || fail {EXIT_STAGE_OUT} \"cannot create {parameter_dir}\"\nmv ./*.pars {parameter_dir}/ || fail {EXIT_STAGE_OUT} \"cannot move parameter files\"\ntar czf {tarball} --exclude=./{} --exclude=./{} . || fail {EXIT_STAGE_OUT} \"cannot archive node files\"\n",
                    layout::DATA_DIR,
                    layout::OUTPUT_DIR,
                );
            }
            Some(chip) => {
                let root = paths.output_root();
                let outputs = layout::chip_outputs(unit.visit(), chip);
                let directories = outputs
                    .iter()
                    .filter_map(|output| output.archive_path.parent())
                    .map(|parent| quote_path(&root.join(parent)))
                    .collect::<BTreeSet<_>>();

                for directory in directories {
                    let _ = writeln!(
                        script,
                        "mkdir -p {directory} || fail {EXIT_STAGE_OUT} \"cannot create {directory}\""
                    );
                }

                for output in outputs {
                    let _ = writeln!(
                        script,
                        "cp {}/{} {} || fail {EXIT_STAGE_OUT} \"cannot save {}\"",
                        layout::OUTPUT_DIR,
                        quote(&output.exec_name),
                        quote_path(&root.join(&output.archive_path)),
                        output.exec_name
                    );
                }
            }
        }

        script
    }

    fn render_verify(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let unit = spec.unit();

        format!(
            "{} --location {}\nverify_status=$?\n",
            runner_command(ctx.config, &format!("verify {unit}")),
            quote_path(ctx.paths.verify_location())
        )
    }

    /// emit, then clean up and exit with the verification status
    fn render_emit(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let unit = spec.unit();
        let scratch = quote_path(ctx.paths.get(StorageTier::ExecutionScratch));

        format!(
            "{emit}\nemit_status=$?\ncd / && rm -rf {scratch}\nif [ \"$verify_status\" -ne 0 ]; then\n  fail {EXIT_VERIFY} \"verification failed for {unit}\"\nfi\nif [ \"$emit_status\" -ne 0 ]; then\n  fail {EXIT_EMIT} \"emit failed for {unit}\"\nfi\necho \"Finished {unit}\"\nexit 0\n",
            emit = runner_command(ctx.config, &format!("emit {unit}")),
        )
    }

    fn render(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let mut script = self.render_header(spec, ctx);
        script.push_str(&self.render_prelude(spec, ctx));

        for step in spec.steps() {
            section(&mut script, step.title());

            script.push_str(&match step {
                Step::StageIn => self.render_stage_in(spec, ctx),
                Step::Execute => self.render_execute(spec, ctx),
                Step::StageOut => self.render_stage_out(spec, ctx),
                Step::Verify => self.render_verify(spec, ctx),
                Step::Emit => self.render_emit(spec, ctx),
            });
        }

        script
    }
}

/// All supported script writers, selected by the `stageN.scheduler` key
#[derive(Debug, Clone)]
pub enum Writers {
    Shell(shell::ShellWriter),
    Pbs(pbs::PbsWriter),
    Slurm(slurm::SlurmWriter),
}

impl Writers {
    pub fn load(config: &PipelineConfig, stage: Stage) -> Result<Self, ConfigErrors> {
        let scheduler = config.stage(stage).scheduler.to_lowercase();

        match scheduler.as_str() {
            "shell" | "direct-shell" => Ok(Self::Shell(shell::ShellWriter::load(config))),
            "pbs" | "resource-managed-batch" => Ok(Self::Pbs(pbs::PbsWriter::load(config)?)),
            "slurm" => Ok(Self::Slurm(slurm::SlurmWriter::load(config)?)),
            _ => Err(ConfigErrors::UnsupportedScheduler(scheduler)),
        }
    }

    pub fn writer(&self) -> &dyn ScriptWriter {
        match self {
            Self::Shell(writer) => writer,
            Self::Pbs(writer) => writer,
            Self::Slurm(writer) => writer,
        }
    }

    /// where the script of a unit lives
    pub fn script_path(&self, paths: &PathSet) -> PathBuf {
        let unit = paths.unit();
        let extension = self.writer().extension();

        match unit.chip() {
            None => paths
                .get(StorageTier::Submission)
                .join(layout::visit_script_name(unit.visit(), extension)),
            Some(chip) => paths
                .parameter_dir()
                .join(layout::chip_script_name(unit.observation(), chip, extension)),
        }
    }

    /// render the script to disk and return its manifest entry
    pub fn write_script(
        &self,
        spec: &ScriptSpec,
        ctx: &ScriptContext,
    ) -> Result<ManifestEntry, ScriptError> {
        let writer = self.writer();
        let path = self.script_path(ctx.paths);
        let error = |source| ScriptError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(error)?;
        }
        fs::write(&path, writer.render(spec, ctx)).map_err(error)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(error)?;

        debug!(unit = %spec.unit(), script = ?path, writer = writer.name(), "Wrote script");

        Ok(ManifestEntry {
            invocation: writer.invocation(&path, ctx),
            script: path,
        })
    }
}
