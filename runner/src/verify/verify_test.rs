use super::{
    checker::{ExecChecker, FormatChecker, FormatReport},
    expected_outputs,
    sentinel::read_sentinel,
    verify_focal_plane, FailureDetail, VerificationGate, VerificationStatus,
};
use crate::{
    config::config_test::fixture,
    identity::WorkUnit,
    planner::PathSet,
};
use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

/// accepts every file unless its name contains `reject`
struct NameChecker {
    reject: Option<&'static str>,
}

impl FormatChecker for NameChecker {
    fn check(&self, path: &Path) -> FormatReport {
        match self.reject {
            Some(pattern) if path.to_string_lossy().contains(pattern) => FormatReport {
                clean: false,
                output: "*** Error: bad header".to_owned(),
            },
            _ => FormatReport {
                clean: true,
                output: "verification OK".to_owned(),
            },
        }
    }
}

const ACCEPT: NameChecker = NameChecker { reject: None };

fn populate(files: &[PathBuf]) {
    for file in files {
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, b"SIMPLE  =                    T").unwrap();
    }
}

fn chip_unit() -> WorkUnit {
    "9999999-fr-R01_S12_E001".parse().unwrap()
}

#[test]
pub fn expected_files() {
    let root = Path::new("/save");
    let visit = "9999999-fr".parse::<WorkUnit>().unwrap();
    let stage1 = expected_outputs(&visit, Path::new("/stage2/9999999-fr"), 2);
    let stage2 = expected_outputs(&chip_unit(), root, 2);

    // tarball, per visit files and four files per sensor exposure
    assert_eq!(stage1.len(), 1 + 10 + 4 * 189 * 2);
    assert_eq!(expected_outputs(&visit, Path::new("/s"), 1).len(), 1 + 10 + 4 * 189);
    assert_eq!(stage1[0], Path::new("/stage2/9999999-fr/nodeFiles9999999.tar.gz"));
    assert!(stage1.contains(&PathBuf::from("/stage2/9999999-fr/run9999999/track_9999999.pars")));
    for kind in ["raytracecommands", "background", "cosmic", "e2adc"] {
        assert!(stage1.contains(&PathBuf::from(format!(
            "/stage2/9999999-fr/run9999999/{kind}_9999999_R43_S22_E001.pars"
        ))));
    }
    assert_eq!(stage2.len(), 17);
    assert_eq!(
        stage2[0],
        Path::new("/save/eimage/v09999999-fr/E001/R01/eimage_9999999_R01_S12_E001.fits.gz")
    );
    assert_eq!(
        stage2[1],
        Path::new("/save/raw/v09999999-fr/E001/R01/S12/imsim_9999999_R01_S12_C00_E001.fits.gz")
    );
}

#[test]
pub fn missing_raw_file_fails_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());
    let unit = chip_unit();
    let paths = PathSet::plan(&config, &unit).unwrap();
    let mut files = expected_outputs(&unit, paths.verify_location(), 2);
    let absent = files.remove(5);
    populate(&files);

    let result = VerificationGate::new(&ACCEPT, 2)
        .verify(&unit, paths.verify_location(), &paths.log_dir())
        .unwrap();

    assert_eq!(result.status, VerificationStatus::Failed);
    assert_eq!(
        result.detail,
        Some(FailureDetail::MissingOutputFile(vec![absent
            .to_string_lossy()
            .into_owned()]))
    );
    assert_eq!(
        result.sentinel,
        dir.path().join("save/9999999-fr/logs/R01_S12_E001.verify_error")
    );
    assert!(fs::read_to_string(&result.sentinel)
        .unwrap()
        .contains(&*absent.to_string_lossy()));
}

#[test]
pub fn missing_chip_parameters_fail_the_visit() {
    let dir = tempfile::tempdir().unwrap();
    let config = fixture(dir.path());
    let unit = "9999999-fr".parse::<WorkUnit>().unwrap();
    let paths = PathSet::plan(&config, &unit).unwrap();
    let location = paths.verify_location();
    let files = expected_outputs(&unit, location, config.general.exposures);
    let absent = location.join("run9999999/e2adc_9999999_R22_S11_E001.pars");
    populate(&files.into_iter().filter(|file| *file != absent).collect::<Vec<_>>());

    let result = VerificationGate::new(&ACCEPT, config.general.exposures)
        .verify(&unit, location, &paths.log_dir())
        .unwrap();

    assert_eq!(result.status, VerificationStatus::Failed);
    assert_eq!(
        result.detail,
        Some(FailureDetail::MissingOutputFile(vec![absent
            .to_string_lossy()
            .into_owned()]))
    );
    assert_eq!(
        result.sentinel,
        dir.path().join("save/9999999-fr/logs/9999999-fr.verify_error")
    );
}

#[test]
pub fn empty_file_counts_as_missing() {
    let dir = tempfile::tempdir().unwrap();
    let unit = chip_unit();
    let files = expected_outputs(&unit, dir.path(), 2);
    populate(&files);
    fs::write(&files[0], b"").unwrap();

    let detail = VerificationGate::new(&ACCEPT, 2).inspect(&unit, dir.path());

    assert!(matches!(detail, Some(FailureDetail::MissingOutputFile(missing)) if missing.len() == 1));
}

#[test]
pub fn verification_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let unit = chip_unit();
    let log_dir = dir.path().join("logs");
    populate(&expected_outputs(&unit, dir.path(), 2));

    let gate = VerificationGate::new(&ACCEPT, 2);
    let first = gate.verify(&unit, dir.path(), &log_dir).unwrap();
    let content = fs::read_to_string(&first.sentinel).unwrap();
    let second = gate.verify(&unit, dir.path(), &log_dir).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.status, VerificationStatus::Verified);
    assert_eq!(content, fs::read_to_string(&second.sentinel).unwrap());
    assert_eq!(fs::read_dir(&log_dir).unwrap().count(), 1);
}

#[test]
pub fn sentinels_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let unit = chip_unit();
    let log_dir = dir.path().join("logs");
    let files = expected_outputs(&unit, dir.path(), 2);
    let gate = VerificationGate::new(&ACCEPT, 2);

    let failed = gate.verify(&unit, dir.path(), &log_dir).unwrap();
    assert_eq!(failed.status, VerificationStatus::Failed);

    populate(&files);
    let verified = gate.verify(&unit, dir.path(), &log_dir).unwrap();

    assert_eq!(verified.status, VerificationStatus::Verified);
    assert!(!failed.sentinel.exists());
    assert_eq!(
        read_sentinel(&log_dir, &unit).unwrap().map(|s| s.status),
        Some(VerificationStatus::Verified)
    );
}

#[test]
pub fn corrupt_image() {
    let dir = tempfile::tempdir().unwrap();
    let unit = chip_unit();
    populate(&expected_outputs(&unit, dir.path(), 2));

    let checker = NameChecker {
        reject: Some("C07"),
    };
    let detail = VerificationGate::new(&checker, 2).inspect(&unit, dir.path());

    match detail {
        Some(FailureDetail::CorruptFormat(files)) => {
            assert_eq!(files.len(), 1);
            assert!(files[0].0.ends_with("imsim_9999999_R01_S12_C07_E001.fits.gz"));
            assert_eq!(files[0].1, "*** Error: bad header");
        }
        other => panic!("unexpected detail {other:?}"),
    }
}

#[test]
pub fn stage1_skips_format_checks() {
    let dir = tempfile::tempdir().unwrap();
    let unit = "9999999-fr".parse::<WorkUnit>().unwrap();
    populate(&expected_outputs(&unit, dir.path(), 2));

    let checker = NameChecker { reject: Some("") };

    assert_eq!(VerificationGate::new(&checker, 2).inspect(&unit, dir.path()), None);
}

#[test]
pub fn missing_sentinel_is_pending() {
    let dir = tempfile::tempdir().unwrap();

    assert_eq!(read_sentinel(dir.path(), &chip_unit()).unwrap(), None);
}

#[test]
pub fn focal_plane_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let visit = "9999999-fr".parse().unwrap();

    let empty = verify_focal_plane(&visit, dir.path(), 1, None);
    assert_eq!(empty.checked, 189 * 17);
    assert_eq!(empty.missing.len(), 189 * 17);
    assert_eq!(empty.exit_code(), 2);

    let unit = WorkUnit::Chip(visit.clone(), "R22_S11_E000".parse().unwrap());
    populate(&expected_outputs(&unit, dir.path(), 2));
    let checker = NameChecker {
        reject: Some("R22_S11_C00"),
    };

    let both = verify_focal_plane(&visit, dir.path(), 1, Some(&checker));
    assert_eq!(both.missing.len(), 188 * 17);
    assert_eq!(both.corrupt.len(), 1);
    assert_eq!(both.exit_code(), 6);
}

#[test]
pub fn exec_checker_reports() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("image.fits.gz");
    fs::write(&file, b"data").unwrap();

    let mut checker = ExecChecker::new(PathBuf::from("echo"));
    checker.params = vec![OsString::from("verification"), OsString::from("OK")];
    assert!(checker.check(&file).clean);

    checker.params = vec![OsString::from("*** Error:")];
    assert!(!checker.check(&file).clean);

    let missing = ExecChecker::new(dir.path().join("no-such-checker"));
    let report = missing.check(&file);
    assert!(!report.clean);
    assert!(report.output.starts_with("failed to run"));
}
