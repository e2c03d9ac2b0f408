use super::{quote, ScriptContext, ScriptSpec, Step, Writers, CHIP_BINARIES, VISIT_BINARIES};
use crate::{
    config::{config_test::fixture, ConfigErrors, PipelineConfig},
    identity::{focal_plane_exposures, Stage, WorkUnit},
    layout,
    planner::{plan_datasets, PathSet},
    verify::{
        checker::{FormatChecker, FormatReport},
        VerificationGate,
    },
};
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
};

fn render(config: &PipelineConfig, unit: &str) -> (String, String) {
    let unit = unit.parse::<WorkUnit>().unwrap();
    let paths = PathSet::plan(config, &unit).unwrap();
    let datasets = plan_datasets(config, unit.stage()).unwrap();
    let writers = Writers::load(config, unit.stage()).unwrap();
    let ctx = ScriptContext {
        config,
        paths: &paths,
        datasets: &datasets,
        jitter: 7,
    };
    let spec = ScriptSpec::new(unit);
    let script_path = writers.script_path(&paths);

    (
        writers.writer().render(&spec, &ctx),
        writers.writer().invocation(&script_path, &ctx),
    )
}

fn with_batch(root: &Path, scheduler: &str) -> PipelineConfig {
    let mut config = fixture(root);
    let resources = serde_yaml::from_str(
        "job_name: phosim\nemail: ops@example.org\nnodes: 1\ncores_per_node: 8\nmemory_mb: 2000\nwalltime: '04:00:00'\nqueue: long\n",
    )
    .unwrap();

    match scheduler {
        "pbs" => config.pbs = Some(resources),
        _ => config.slurm = Some(resources),
    }
    config.stage1.scheduler = scheduler.to_owned();
    config.stage2.scheduler = scheduler.to_owned();
    config
}

#[test]
pub fn steps_are_rendered_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (script, _) = render(&fixture(dir.path()), "9999999-fr");

    let positions = Step::SEQUENCE
        .iter()
        .map(|step| script.find(&format!("### {}\n", step.title())).unwrap())
        .collect::<Vec<_>>();

    assert!(script.starts_with("#!/bin/sh\n"));
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
pub fn stage1_script_body() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display();
    let (script, invocation) = render(&fixture(dir.path()), "9999999-fr");

    assert_eq!(invocation, format!("sh {root}/submit/9999999-fr.sh"));
    assert!(script.contains("sleep 7\n"));
    assert!(script.contains(&format!("mkdir -p {root}/scratch/9999999-fr ")));
    assert!(script.contains(&format!(
        "ln -sfn {root}/shared/data/focal_plane data/focal_plane"
    )));
    assert!(script.contains(&format!("cp -R {root}/stage1/9999999-fr/. .")));
    assert!(script.contains("/opt/phosim/ancillary/atmosphere/turb2d < trimfile_9999999 || fail 11"));
    assert!(script.contains("/opt/phosim/ancillary/trim/trim < trimfile_9999999"));
    assert!(script.contains(&format!(
        "tar czf {root}/stage2/9999999-fr/nodeFiles9999999.tar.gz"
    )));
    assert!(script.contains(&format!(
        "mv ./*.pars {root}/stage2/9999999-fr/run9999999/ || fail 12"
    )));
    assert!(script.contains(&format!(
        "/opt/phosim/bin/phosim-runner verify 9999999-fr --location {root}/stage2/9999999-fr\nverify_status=$?"
    )));
    assert!(script.contains("/opt/phosim/bin/phosim-runner emit 9999999-fr\nemit_status=$?"));
    assert!(script.contains(&format!("rm -rf {root}/scratch/9999999-fr\n")));
    assert!(script.contains("fail 13 \"verification failed for 9999999-fr\""));
}

#[test]
pub fn stage2_script_body() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display();
    let (script, invocation) = render(&fixture(dir.path()), "9999999-fr-R01_S12_E001");

    assert_eq!(
        invocation,
        format!("sh {root}/stage2/9999999-fr/run9999999/exec_9999999_R01_S12_E001.sh")
    );
    assert!(script.contains(&format!(
        "cp {root}/stage2/9999999-fr/nodeFiles9999999.tar.gz ."
    )));
    assert!(script.contains(&format!(
        "{root}/stage2/9999999-fr/run9999999/raytracecommands_9999999_R01_S12_E001.pars"
    )));
    assert!(script.contains(&format!(
        "{root}/stage2/9999999-fr/run9999999/tracking_9999999.pars"
    )));
    assert!(script.contains(
        "/opt/phosim/raytrace/lsst < raytracecommands_9999999_R01_S12_E001.pars || fail 11"
    ));
    assert!(script.contains(&format!(
        "cp output/eimage_9999999_f2_R01_S12_E001.fits.gz {root}/save/eimage/v09999999-fr/E001/R01/eimage_9999999_R01_S12_E001.fits.gz"
    )));
    assert!(script.contains(&format!(
        "cp output/imsim_9999999_f2_R01_S12_C17_E001.fits.gz {root}/save/raw/v09999999-fr/E001/R01/S12/imsim_9999999_R01_S12_C17_E001.fits.gz"
    )));
    assert_eq!(script.matches("cp output/").count(), 17);
    assert!(script.contains(&format!("--location {root}/save\n")));
}

#[test]
pub fn config_is_passed_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture(dir.path());
    config.source = Some(dir.path().join("phosim.yaml"));

    let (script, _) = render(&config, "9999999-fr");

    assert!(script.contains(&format!(
        "phosim-runner --config {}/phosim.yaml emit 9999999-fr",
        dir.path().display()
    )));
}

#[test]
pub fn shell_trace() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture(dir.path());
    config.general.debug_level = 1;

    let (_, invocation) = render(&config, "9999999-fr");

    assert!(invocation.starts_with("sh -x "));
}

#[test]
pub fn pbs_directives() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display();
    let (script, invocation) = render(&with_batch(dir.path(), "pbs"), "9999999-fr-R01_S12_E001");

    assert_eq!(
        invocation,
        format!("qsub {root}/stage2/9999999-fr/run9999999/exec_9999999_R01_S12_E001.sh")
    );
    for directive in [
        "#PBS -N phosim\n",
        "#PBS -M ops@example.org\n",
        "#PBS -m a\n",
        "#PBS -j oe\n",
        "#PBS -l walltime=04:00:00\n",
        "#PBS -l nodes=1:ppn=8\n",
        "#PBS -l pmem=2000MB\n",
        "#PBS -q long\n",
    ] {
        assert!(script.contains(directive), "missing {directive}");
    }
    assert!(script.contains(&format!(
        "#PBS -o {root}/save/9999999-fr/logs/R01_S12_E001.out\n"
    )));
    // directives must precede the first command
    assert!(script.find("#PBS -q").unwrap() < script.find("fail() {").unwrap());
}

#[test]
pub fn slurm_directives() {
    let dir = tempfile::tempdir().unwrap();
    let (script, invocation) = render(&with_batch(dir.path(), "slurm"), "9999999-fr");

    assert!(invocation.starts_with("sbatch "));
    assert!(script.contains("#SBATCH --time=04:00:00\n"));
    assert!(script.contains("#SBATCH --ntasks-per-node=8\n"));
    assert!(script.contains("#SBATCH --partition=long\n"));
}

#[test]
pub fn batch_writer_needs_section() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture(dir.path());
    config.stage2.scheduler = "pbs".to_owned();

    assert!(matches!(
        Writers::load(&config, Stage::Chip),
        Err(ConfigErrors::MissingSection(_))
    ));

    config.stage2.scheduler = "condor".to_owned();
    assert!(matches!(
        Writers::load(&config, Stage::Chip),
        Err(ConfigErrors::UnsupportedScheduler(_))
    ));
}

#[test]
pub fn written_scripts_are_executable() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());
    let unit = "9999999-fr".parse::<WorkUnit>().unwrap();
    let paths = PathSet::plan(&config, &unit).unwrap();
    let writers = Writers::load(&config, Stage::Visit).unwrap();
    let ctx = ScriptContext {
        config: &config,
        paths: &paths,
        datasets: &[],
        jitter: 0,
    };

    let entry = writers.write_script(&ScriptSpec::new(unit), &ctx).unwrap();
    let metadata = std::fs::metadata(&entry.script).unwrap();

    assert_eq!(entry.script, dir.path().join("submit/9999999-fr.sh"));
    assert_eq!(metadata.permissions().mode() & 0o777, 0o755);
    assert!(!std::fs::read_to_string(&entry.script).unwrap().contains("sleep"));
}

#[test]
pub fn quoting() {
    assert_eq!(quote("/data/run1"), "/data/run1");
    assert_eq!(quote("/data/my run"), "'/data/my run'");
    assert_eq!(quote("it's"), r"'it'\''s'");
    assert_eq!(quote(""), "''");
}

struct AcceptAll;

impl FormatChecker for AcceptAll {
    fn check(&self, _path: &Path) -> FormatReport {
        FormatReport {
            clean: true,
            output: "verification OK".to_owned(),
        }
    }
}

/// executable that drains stdin and then runs `body`
fn stub(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, format!("#!/bin/sh\ncat > /dev/null\n{body}")).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_unit(config: &PipelineConfig, unit: &WorkUnit) -> PathBuf {
    let paths = PathSet::plan(config, unit).unwrap();
    let datasets = plan_datasets(config, unit.stage()).unwrap();
    let writers = Writers::load(config, unit.stage()).unwrap();
    let ctx = ScriptContext {
        config,
        paths: &paths,
        datasets: &datasets,
        jitter: 0,
    };

    writers.write_script(&ScriptSpec::new(unit.clone()), &ctx).unwrap().script
}

fn run_script(script: &Path) {
    let output = Command::new("sh").arg(script).output().unwrap();

    assert_eq!(
        output.status.code(),
        Some(0),
        "{} failed: {}",
        script.display(),
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
pub fn stage2_runs_on_stage1_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let bin = root.join("bin");
    let mut config = fixture(root);
    config.general.bin_dir = Some(bin.clone());
    config.general.runner = bin.join("phosim-runner");
    stub(&config.general.runner, "exit 0\n");

    let visit = "9999999-fr".parse::<WorkUnit>().unwrap();
    let chip = "9999999-fr-R01_S12_E000".parse::<WorkUnit>().unwrap();
    let obs = visit.observation().clone();

    // trim leaves every parameter file of the visit behind
    let parameters = layout::visit_parameter_files(&obs)
        .into_iter()
        .chain(
            focal_plane_exposures(config.general.exposures)
                .flat_map(|exposure| layout::chip_parameter_files(&obs, &exposure)),
        )
        .map(|name| format!("echo pars > {name}\n"))
        .collect::<String>();
    for (name, exec) in VISIT_BINARIES {
        stub(&bin.join(exec), if name == "trim" { parameters.as_str() } else { "" });
    }

    // e2adc leaves the images of its exposure behind
    let images = layout::chip_outputs(chip.visit(), chip.chip().unwrap())
        .into_iter()
        .map(|output| format!("echo image > {}/{}\n", layout::OUTPUT_DIR, output.exec_name))
        .collect::<String>();
    for (name, exec, _) in CHIP_BINARIES {
        stub(&bin.join(exec), if name == "e2adc" { images.as_str() } else { "" });
    }

    let stage1 = root.join("stage1/9999999-fr");
    fs::create_dir_all(&stage1).unwrap();
    fs::write(
        stage1.join(layout::catalog_name(&obs)),
        "Opsim_obshistid 9999999\nOpsim_filter 2\n",
    )
    .unwrap();

    run_script(&write_unit(&config, &visit));

    let gate = VerificationGate::new(&AcceptAll, config.general.exposures);
    assert_eq!(gate.inspect(&visit, &root.join("stage2/9999999-fr")), None);
    assert!(!root.join("scratch/9999999-fr").exists());

    run_script(&write_unit(&config, &chip));

    assert_eq!(gate.inspect(&chip, &root.join("save")), None);
    assert!(!root.join("scratch/9999999-fr-R01_S12_E000").exists());
}
