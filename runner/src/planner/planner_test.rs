use super::{plan_datasets, PathSet, StagingStrategy, StorageTier};
use crate::{
    config::{config_test::fixture, ConfigErrors},
    identity::{Stage, WorkUnit},
};
use std::{collections::BTreeSet, path::PathBuf};

fn chip_unit() -> WorkUnit {
    "9999999-fr-R01_S12_E001".parse().unwrap()
}

#[test]
pub fn stage1_layout() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let paths = PathSet::plan(&fixture(root), &"9999999-fr".parse().unwrap()).unwrap();

    assert_eq!(paths.get(StorageTier::Submission), root.join("submit"));
    assert_eq!(paths.get(StorageTier::SharedStage1), root.join("stage1/9999999-fr"));
    assert_eq!(paths.get(StorageTier::SharedStage2), root.join("stage2/9999999-fr"));
    assert_eq!(paths.get(StorageTier::SavePath), root.join("save/9999999-fr"));
    assert_eq!(paths.get(StorageTier::ExecutionScratch), root.join("scratch/9999999-fr"));
    assert_eq!(paths.log_dir(), root.join("save/9999999-fr/logs"));
    assert_eq!(paths.parameter_dir(), root.join("stage2/9999999-fr/run9999999"));
    assert_eq!(paths.verify_location(), root.join("stage2/9999999-fr"));
}

#[test]
pub fn stage2_layout() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let paths = PathSet::plan(&fixture(root), &chip_unit()).unwrap();

    assert_eq!(
        paths.get(StorageTier::ExecutionScratch),
        root.join("scratch/9999999-fr-R01_S12_E001")
    );
    assert_eq!(paths.log_dir(), root.join("save/9999999-fr/logs"));
    assert_eq!(paths.output_root(), root.join("save"));
    assert_eq!(paths.verify_location(), root.join("save"));
}

#[test]
pub fn planning_is_pure() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());

    assert_eq!(
        PathSet::plan(&config, &chip_unit()).unwrap(),
        PathSet::plan(&config, &chip_unit()).unwrap()
    );
}

#[test]
pub fn tiers_never_alias() {
    let dir = tempfile::tempdir().unwrap();
    let paths = PathSet::plan(&fixture(dir.path()), &chip_unit()).unwrap();
    let distinct = paths.iter().map(|(_, path)| path).collect::<BTreeSet<_>>();

    assert_eq!(distinct.len(), StorageTier::ALL.len());
}

#[test]
pub fn scratch_over_shared_stage_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture(dir.path());
    // stage 1 scratch of the visit would be the SharedStage2 directory itself
    config.paths.scratch = config.paths.stage2.clone();

    assert!(matches!(
        PathSet::plan(&config, &"9999999-fr".parse().unwrap()),
        Err(ConfigErrors::AliasedScratch { .. })
    ));
}

#[test]
pub fn unset_root_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fixture(dir.path());
    config.paths.save = None;

    assert!(matches!(
        PathSet::plan(&config, &chip_unit()),
        Err(ConfigErrors::MissingKey(key)) if key == "paths.save"
    ));

    config.paths.save = Some(PathBuf::from("relative"));
    assert!(matches!(
        PathSet::plan(&config, &chip_unit()),
        Err(ConfigErrors::RelativePath(_))
    ));
}

#[test]
pub fn dataset_strategies() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let mut config = fixture(root);

    let linked = plan_datasets(&config, Stage::Chip).unwrap();
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].strategy, StagingStrategy::LinkShared);
    assert_eq!(linked[0].source, root.join("shared/data"));

    let dataset = config.data.get_mut("focal_plane").unwrap();
    dataset.use_shared_in_place = false;
    dataset.tarball = Some("focal_plane.tar".to_owned());
    dataset.check_dir = Some(PathBuf::from("focal_plane/sta_misalignments"));
    dataset.stages = vec![Stage::Chip];
    config.general.scratch_data = Some(PathBuf::from("/local/phosim"));

    assert!(plan_datasets(&config, Stage::Visit).unwrap().is_empty());

    let copied = plan_datasets(&config, Stage::Chip).unwrap();
    assert_eq!(copied[0].source, PathBuf::from("/local/phosim"));
    assert_eq!(
        copied[0].strategy,
        StagingStrategy::CopyExtract {
            tarball: root.join("shared/data/focal_plane.tar"),
            check_dir: PathBuf::from("/local/phosim/focal_plane/sta_misalignments"),
        }
    );
}
