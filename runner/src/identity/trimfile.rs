use super::{Filter, IdentityError, ObservationId, VisitId};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Key of the observation id inside of an instance catalog
pub const OBSHISTID_KEY: &str = "Opsim_obshistid";
/// Key of the numeric filter code inside of an instance catalog
pub const FILTER_KEY: &str = "Opsim_filter";
/// Key of the suffix appended to the observation id in extra command files
pub const EXTRAID_KEY: &str = "extraid";

#[derive(Error, Debug)]
pub enum TrimfileError {
    #[error("Failed to read {path}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Instance catalog does not define {0}")]
    MissingKey(&'static str),
    #[error("Instance catalog describes an invalid visit")]
    Identity(#[from] IdentityError),
}

/// Raw header values of an instance catalog
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrimfileHeader {
    pub obshistid: Option<String>,
    pub filter: Option<String>,
}

fn key_value(line: &str) -> Option<(&str, &str)> {
    let mut tokens = line.split_whitespace();

    Some((tokens.next()?, tokens.next()?))
}

/// Scan a catalog for its header keys, later occurrences win
pub fn read_header<R: BufRead>(reader: R) -> io::Result<TrimfileHeader> {
    let mut header = TrimfileHeader::default();

    for line in reader.lines() {
        let line = line?;

        match key_value(&line) {
            Some((OBSHISTID_KEY, value)) => header.obshistid = Some(value.to_owned()),
            Some((FILTER_KEY, value)) => header.filter = Some(value.to_owned()),
            _ => {}
        }
    }

    Ok(header)
}

/// Concatenate all `extraid` values of an extra command file
pub fn read_extra_id<R: BufRead>(reader: R) -> io::Result<String> {
    let mut extra = String::new();

    for line in reader.lines() {
        let line = line?;

        if let Some((EXTRAID_KEY, value)) = key_value(&line) {
            extra.push_str(value);
        }
    }

    Ok(extra)
}

impl TrimfileHeader {
    /// Build the visit id, appending `extra` to the observation id
    pub fn visit(&self, extra: &str) -> Result<VisitId, TrimfileError> {
        let obshistid = self
            .obshistid
            .as_deref()
            .ok_or(TrimfileError::MissingKey(OBSHISTID_KEY))?;
        let filter = self
            .filter
            .as_deref()
            .ok_or(TrimfileError::MissingKey(FILTER_KEY))?;

        Ok(VisitId::new(
            ObservationId::with_extra_id(obshistid, extra)?,
            filter.parse::<Filter>()?,
        ))
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TrimfileError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TrimfileError::Read {
            path: path.to_string_lossy().into_owned(),
            source,
        })
}

/// Resolve the visit id of an instance catalog and an optional extra command file
pub fn resolve_visit(catalog: &Path, extra: Option<&Path>) -> Result<VisitId, TrimfileError> {
    let header = read_header(open(catalog)?).map_err(|source| TrimfileError::Read {
        path: catalog.to_string_lossy().into_owned(),
        source,
    })?;

    let extra_id = match extra {
        Some(path) => read_extra_id(open(path)?).map_err(|source| TrimfileError::Read {
            path: path.to_string_lossy().into_owned(),
            source,
        })?,
        None => String::new(),
    };

    if extra.is_some() && extra_id.is_empty() {
        warn!(path = ?extra, "Extra command file contains no {EXTRAID_KEY} line");
    }

    let visit = header.visit(&extra_id)?;
    debug!(catalog = ?catalog, visit = %visit, "Resolved visit");

    Ok(visit)
}
