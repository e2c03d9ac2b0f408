use super::TrackerError;
use crate::{identity::WorkUnit, verify::VerificationStatus};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    /// open the database and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        let mut inner = InnerConnection::open(path)?;
        inner.init()?;

        Ok(Self::new(inner))
    }

    pub fn submitted(&self, unit: &WorkUnit, script: &Path) -> Result<(), TrackerError> {
        self.lock().submitted(unit, script)
    }

    pub fn finished(&self, unit: &WorkUnit, status: VerificationStatus) -> Result<(), TrackerError> {
        self.lock().finished(unit, status)
    }

    pub fn close(self) -> Result<(), TrackerError> {
        match Arc::try_unwrap(self.0) {
            Ok(inner) => inner.into_inner().close(),
            Err(_) => {
                warn!("SQLite connection is still shared, leaving it to be dropped");
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn count(&self, table: &str, unit: &WorkUnit) -> i64 {
        self.lock()
            .connection
            .query_row(
                &format!("select count(*) from {table} where unit = ?"),
                params![unit.to_string()],
                |row| row.get(0),
            )
            .unwrap()
    }

    #[cfg(test)]
    pub(crate) fn last_status(&self, unit: &WorkUnit) -> Option<i8> {
        self.lock()
            .connection
            .query_row(
                "select status from results where unit = ? order by id desc limit 1",
                params![unit.to_string()],
                |row| row.get(0),
            )
            .ok()
    }
}

impl InnerConnection {
    pub fn open(path: &Path) -> Result<Self, TrackerError> {
        let connection = Connection::open(path)?;
        debug!(path = ?path, "Opened SQLite connection");

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), TrackerError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => debug!("Applied SQL schema ({counter}/{})", SQL_SCHEMA.len()),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{}): {error}", SQL_SCHEMA.len());

                    return Err(TrackerError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn submitted(&self, unit: &WorkUnit, script: &Path) -> Result<(), TrackerError> {
        let id: i64 = self
            .connection
            .prepare_cached(
                "insert into submissions
                 (unit, visit, stage, script) values (?, ?, ?, ?)
                 returning id",
            )?
            .query_row(
                params![
                    unit.to_string(),
                    unit.visit().to_string(),
                    unit.stage() as u8,
                    script.to_string_lossy().as_ref()
                ],
                |row| row.get(0),
            )?;

        debug!(unit = %unit, id = id, "Recorded submission");

        Ok(())
    }

    pub fn finished(&self, unit: &WorkUnit, status: VerificationStatus) -> Result<(), TrackerError> {
        let id: i64 = self
            .connection
            .prepare_cached(
                "insert into results
                 (unit, visit, stage, status) values (?, ?, ?, ?)
                 returning id",
            )?
            .query_row(
                params![
                    unit.to_string(),
                    unit.visit().to_string(),
                    unit.stage() as u8,
                    status as i8
                ],
                |row| row.get(0),
            )?;

        info!(unit = %unit, id = id, status = ?status, "Recorded result");

        Ok(())
    }

    pub fn close(mut self) -> Result<(), TrackerError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(TrackerError::SQLite(error));
            }
        }

        debug!("Closed SQLite connection");

        Ok(())
    }
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists submissions (
    id integer primary key,
    unit text not null,
    visit text not null,
    stage tinyint not null,
    script text not null
);",
    "create table if not exists results (
    id integer primary key,
    unit text not null,
    visit text not null,
    stage tinyint not null,
    status tinyint not null
);",
];
