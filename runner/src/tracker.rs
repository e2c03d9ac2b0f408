//! Optional recording of submitted and finished work units.

#[cfg(feature = "database")]
pub mod sqlite;

#[cfg(all(test, feature = "database"))]
mod sqlite_test;

use crate::{config::PipelineConfig, identity::WorkUnit, verify::VerificationStatus};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[cfg(feature = "database")]
    #[error("Job tracker query failed")]
    SQLite(#[from] rusqlite::Error),
    #[error("A database is configured but support was not compiled in, enable the `database` feature")]
    Unavailable,
}

/// All job tracker backends, `Null` when no database is configured
#[derive(Debug)]
pub enum Trackers {
    Null,
    #[cfg(feature = "database")]
    SQLite(sqlite::SharedConnection),
}

impl Trackers {
    pub fn load(config: &PipelineConfig) -> Result<Self, TrackerError> {
        match config.database {
            None => Ok(Self::Null),
            #[cfg(feature = "database")]
            Some(ref database) => Ok(Self::SQLite(sqlite::SharedConnection::open(&database.path)?)),
            #[cfg(not(feature = "database"))]
            Some(_) => Err(TrackerError::Unavailable),
        }
    }

    /// a script for `unit` was written and added to a manifest
    pub fn submitted(&self, unit: &WorkUnit, script: &Path) -> Result<(), TrackerError> {
        match self {
            Self::Null => {
                debug!(unit = %unit, "Not tracking submission");
                Ok(())
            }
            #[cfg(feature = "database")]
            Self::SQLite(connection) => connection.submitted(unit, script),
        }
    }

    /// `unit` ran to completion with the given verification outcome
    pub fn finished(&self, unit: &WorkUnit, status: VerificationStatus) -> Result<(), TrackerError> {
        match self {
            Self::Null => {
                debug!(unit = %unit, status = ?status, "Not tracking result");
                Ok(())
            }
            #[cfg(feature = "database")]
            Self::SQLite(connection) => connection.finished(unit, status),
        }
    }

    pub fn close(self) -> Result<(), TrackerError> {
        match self {
            Self::Null => Ok(()),
            #[cfg(feature = "database")]
            Self::SQLite(connection) => connection.close(),
        }
    }
}
