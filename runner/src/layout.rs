//! File names shared between the generated scripts and the verification gate.

use crate::identity::{ChipExposure, ObservationId, VisitId};
use once_cell::sync::Lazy;
use std::path::PathBuf;

/// Per-visit parameter files written by the stage 1 binaries
pub const VISIT_PARAMETER_KINDS: [&str; 10] = [
    "objectcatalog",
    "obs",
    "atmosphere",
    "atmosphereraytrace",
    "cloudraytrace",
    "control",
    "optics",
    "catlist",
    "tracking",
    "track",
];

/// Per sensor exposure parameter files written by stage 1, read by the stage 2 binaries
pub const CHIP_PARAMETER_KINDS: [&str; 4] = ["raytracecommands", "background", "cosmic", "e2adc"];

/// Amplifier columns and rows per sensor
pub const AMPLIFIER_COLUMNS: u8 = 2;
pub const AMPLIFIER_ROWS: u8 = 8;

/// `C00` .. `C17`
pub static AMPLIFIERS: Lazy<Vec<String>> = Lazy::new(|| {
    (0..AMPLIFIER_COLUMNS)
        .flat_map(|x| (0..AMPLIFIER_ROWS).map(move |y| format!("C{x}{y}")))
        .collect()
});

/// Directory inside of the scratch area the stage 2 binaries write images to
pub const OUTPUT_DIR: &str = "output";
/// Directory inside of the scratch area datasets are linked into
pub const DATA_DIR: &str = "data";
/// Sub directory of the save path holding logs and sentinels
pub const LOG_DIR: &str = "logs";

pub fn catalog_name(observation: &ObservationId) -> String {
    format!("trimfile_{observation}")
}

pub fn extra_commands_name(observation: &ObservationId) -> String {
    format!("extracommands_{observation}")
}

pub fn visit_parameter_file(kind: &str, observation: &ObservationId) -> String {
    format!("{kind}_{observation}.pars")
}

pub fn visit_parameter_files(observation: &ObservationId) -> Vec<String> {
    VISIT_PARAMETER_KINDS
        .iter()
        .map(|kind| visit_parameter_file(kind, observation))
        .collect()
}

/// Archive with the full stage 1 working directory
pub fn node_tarball(observation: &ObservationId) -> String {
    format!("nodeFiles{observation}.tar.gz")
}

/// Directory in SharedStage2 holding the parameter files and stage 2 scripts
pub fn parameter_dir_name(observation: &ObservationId) -> String {
    format!("run{observation}")
}

/// `<kind>_<obs>_<R>_<S>_<E>.pars`
pub fn chip_parameter_file(kind: &str, observation: &ObservationId, chip: &ChipExposure) -> String {
    format!("{kind}_{observation}_{chip}.pars")
}

pub fn chip_parameter_files(observation: &ObservationId, chip: &ChipExposure) -> Vec<String> {
    CHIP_PARAMETER_KINDS
        .iter()
        .map(|kind| chip_parameter_file(kind, observation, chip))
        .collect()
}

pub fn visit_script_name(visit: &VisitId, extension: &str) -> String {
    format!("{visit}.{extension}")
}

/// Common prefix of every stage 2 script name of an observation
pub fn chip_script_prefix(observation: &ObservationId) -> String {
    format!("exec_{observation}_")
}

pub fn chip_script_name(observation: &ObservationId, chip: &ChipExposure, extension: &str) -> String {
    format!("{}{chip}.{extension}", chip_script_prefix(observation))
}

/// Stage 2 manifest of a visit, placed in its save path
pub fn chip_manifest_name(visit: &VisitId) -> String {
    format!("{visit}-Jobs.lis")
}

fn archive_visit_dir(visit: &VisitId) -> String {
    format!("v{}-f{}", visit.observation.padded(), visit.filter)
}

/// A single image as it is named by the binaries and in the archive tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutput {
    /// name inside of the scratch output directory
    pub exec_name: String,
    /// path relative to the image output root
    pub archive_path: PathBuf,
}

pub fn eimage_output(visit: &VisitId, chip: &ChipExposure) -> ImageOutput {
    let sensor = &chip.sensor;
    let obs = &visit.observation;

    ImageOutput {
        exec_name: format!(
            "eimage_{obs}_f{}_{}_{}_{}.fits.gz",
            visit.filter.number(),
            sensor.raft_name(),
            sensor.sensor_name(),
            chip.exposure
        ),
        archive_path: PathBuf::from("eimage")
            .join(archive_visit_dir(visit))
            .join(chip.exposure.to_string())
            .join(sensor.raft_name())
            .join(format!("eimage_{obs}_{chip}.fits.gz")),
    }
}

pub fn raw_outputs(visit: &VisitId, chip: &ChipExposure) -> Vec<ImageOutput> {
    let sensor = &chip.sensor;
    let obs = &visit.observation;
    let dir = PathBuf::from("raw")
        .join(archive_visit_dir(visit))
        .join(chip.exposure.to_string())
        .join(sensor.raft_name())
        .join(sensor.sensor_name());

    AMPLIFIERS
        .iter()
        .map(|amp| ImageOutput {
            exec_name: format!(
                "imsim_{obs}_f{}_{sensor}_{amp}_{}.fits.gz",
                visit.filter.number(),
                chip.exposure
            ),
            archive_path: dir.join(format!("imsim_{obs}_{sensor}_{amp}_{}.fits.gz", chip.exposure)),
        })
        .collect()
}

/// Electron image followed by all amplifier images
pub fn chip_outputs(visit: &VisitId, chip: &ChipExposure) -> Vec<ImageOutput> {
    let mut outputs = vec![eimage_output(visit, chip)];
    outputs.extend(raw_outputs(visit, chip));

    outputs
}
