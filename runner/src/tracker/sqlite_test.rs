use super::{sqlite::SharedConnection, Trackers};
use crate::{config::PipelineConfig, identity::WorkUnit, verify::VerificationStatus};
use std::path::Path;

#[test]
pub fn records_submissions_and_results() {
    let dir = tempfile::tempdir().unwrap();
    let connection = SharedConnection::open(&dir.path().join("jobs.db")).unwrap();
    let unit = "9999999-fr-R01_S12_E001".parse::<WorkUnit>().unwrap();

    connection
        .submitted(&unit, Path::new("/stage2/exec.sh"))
        .unwrap();
    connection
        .finished(&unit, VerificationStatus::Failed)
        .unwrap();
    assert_eq!(connection.last_status(&unit), Some(-1));
    connection
        .finished(&unit, VerificationStatus::Verified)
        .unwrap();

    assert_eq!(connection.count("submissions", &unit), 1);
    assert_eq!(connection.count("results", &unit), 2);
    assert_eq!(connection.last_status(&unit), Some(1));

    connection.close().unwrap();
}

#[test]
pub fn schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.db");
    let unit = "9999999-fr".parse::<WorkUnit>().unwrap();

    let first = SharedConnection::open(&path).unwrap();
    first.submitted(&unit, Path::new("/submit/9999999-fr.sh")).unwrap();
    first.close().unwrap();

    let second = SharedConnection::open(&path).unwrap();
    assert_eq!(second.count("submissions", &unit), 1);
    assert_eq!(second.last_status(&unit), None);
}

#[test]
pub fn tracker_selection() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();

    assert!(matches!(Trackers::load(&config).unwrap(), Trackers::Null));

    config.database = Some(
        serde_yaml::from_str(&format!("path: {}/jobs.db", dir.path().display())).unwrap(),
    );
    let tracker = Trackers::load(&config).unwrap();

    assert!(matches!(tracker, Trackers::SQLite(_)));
    tracker.close().unwrap();
}
