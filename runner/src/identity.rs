//! Canonical identities for units of work.
//!
//! Every directory and file name the pipeline produces is keyed off the
//! types in this module, so they are the only place where the packed
//! string encodings are built or parsed:
//!
//! * visit:          `<obshistid>-f<filter>`, e.g. `9999999-fr`
//! * chip exposure:  `R<rr>_S<ss>_E<eee>`, e.g. `R01_S12_E001`
//! * work unit:      `<visit>` (stage 1) or `<visit>-<chip exposure>` (stage 2)

pub mod trimfile;


use once_cell::sync::Lazy;
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Rafts per focal plane side, the four corners carry no science sensors
pub const RAFT_GRID: u8 = 5;
/// Sensors per raft side
pub const SENSOR_GRID: u8 = 3;
/// Highest exposure index that still fits the `E<nnn>` encoding
pub const MAX_EXPOSURE: u16 = 999;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Observation id '{0}' must be a non-empty string of digits")]
    ObservationId(String),
    #[error("Unknown filter '{0}', expected one of u, g, r, i, z, y or 0-5")]
    Filter(String),
    #[error("Raft R{0}{1} is not part of the science focal plane")]
    Raft(u8, u8),
    #[error("Sensor S{0}{1} is outside of the raft grid")]
    Sensor(u8, u8),
    #[error("Exposure index {0} is out of range (0-999)")]
    Exposure(u32),
    #[error("Stage '{0}' is unknown, expected 1 or 2")]
    Stage(String),
    #[error("Malformed identity '{0}'")]
    Malformed(String),
}

/// Pipeline stage a unit of work belongs to
#[derive(
    Serialize_repr, Deserialize_repr, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[repr(u8)]
pub enum Stage {
    /// per-visit preprocessing
    Visit = 1,
    /// per-chip raytracing and readout
    Chip = 2,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Visit, Stage::Chip];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

impl FromStr for Stage {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1" | "visit" => Ok(Self::Visit),
            "2" | "chip" => Ok(Self::Chip),
            other => Err(IdentityError::Stage(other.to_owned())),
        }
    }
}

/// Observation id including any appended extra id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationId(String);

impl ObservationId {
    pub fn new(id: &str) -> Result<Self, IdentityError> {
        let id = id.trim();

        if id.is_empty() || !id.bytes().all(|byte| byte.is_ascii_digit()) {
            Err(IdentityError::ObservationId(id.to_owned()))
        } else {
            Ok(Self(id.to_owned()))
        }
    }

    /// Append an extra id suffix, e.g. `9999999` + `1` -> `99999991`
    pub fn with_extra_id(base: &str, extra: &str) -> Result<Self, IdentityError> {
        Self::new(&format!("{}{}", base.trim(), extra.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value zero padded to eight digits, as used in the archive tree
    pub fn padded(&self) -> String {
        let digits = self.0.trim_start_matches('0');
        let digits = if digits.is_empty() { "0" } else { digits };

        format!("{digits:0>8}")
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ObservationId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Filter {
    U,
    G,
    R,
    I,
    Z,
    Y,
}

impl Filter {
    pub const ALL: [Filter; 6] = [
        Filter::U,
        Filter::G,
        Filter::R,
        Filter::I,
        Filter::Z,
        Filter::Y,
    ];

    pub fn letter(&self) -> char {
        match self {
            Self::U => 'u',
            Self::G => 'g',
            Self::R => 'r',
            Self::I => 'i',
            Self::Z => 'z',
            Self::Y => 'y',
        }
    }

    /// Numeric code used by the simulator (`Opsim_filter`)
    pub fn number(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Filter {
    type Err = IdentityError;

    /// accepts both the letter and the numeric code
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();

        Self::ALL
            .into_iter()
            .find(|filter| {
                value.len() == 1
                    && (value.starts_with(filter.letter())
                        || value == filter.number().to_string())
            })
            .ok_or_else(|| IdentityError::Filter(value.to_owned()))
    }
}

/// Raft and sensor position of a single detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SensorId {
    raft: (u8, u8),
    sensor: (u8, u8),
}

impl SensorId {
    pub fn new(
        raft_row: u8,
        raft_col: u8,
        sensor_row: u8,
        sensor_col: u8,
    ) -> Result<Self, IdentityError> {
        let corner = |value: u8| value == 0 || value == RAFT_GRID - 1;

        if raft_row >= RAFT_GRID
            || raft_col >= RAFT_GRID
            || (corner(raft_row) && corner(raft_col))
        {
            return Err(IdentityError::Raft(raft_row, raft_col));
        }

        if sensor_row >= SENSOR_GRID || sensor_col >= SENSOR_GRID {
            return Err(IdentityError::Sensor(sensor_row, sensor_col));
        }

        Ok(Self {
            raft: (raft_row, raft_col),
            sensor: (sensor_row, sensor_col),
        })
    }

    /// `R<row><col>`
    pub fn raft_name(&self) -> String {
        format!("R{}{}", self.raft.0, self.raft.1)
    }

    /// `S<row><col>`
    pub fn sensor_name(&self) -> String {
        format!("S{}{}", self.sensor.0, self.sensor.1)
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.raft_name(), self.sensor_name())
    }
}

/// parse the two digits following a single letter prefix, e.g. `R01`
fn parse_grid(token: &str, prefix: char, original: &str) -> Result<(u8, u8), IdentityError> {
    let malformed = || IdentityError::Malformed(original.to_owned());
    let mut chars = token.chars();

    if chars.next() != Some(prefix) || token.len() != 3 {
        return Err(malformed());
    }

    let mut digit = || {
        chars
            .next()
            .and_then(|c| c.to_digit(10))
            .map(|d| d as u8)
            .ok_or_else(malformed)
    };

    Ok((digit()?, digit()?))
}

impl FromStr for SensorId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (raft, sensor) = s
            .split_once('_')
            .ok_or_else(|| IdentityError::Malformed(s.to_owned()))?;
        let raft = parse_grid(raft, 'R', s)?;
        let sensor = parse_grid(sensor, 'S', s)?;

        Self::new(raft.0, raft.1, sensor.0, sensor.1)
    }
}

/// Index of one snap of a sensor, rendered as `E<nnn>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Exposure(u16);

impl Exposure {
    pub fn new(index: u32) -> Result<Self, IdentityError> {
        if index > MAX_EXPOSURE as u32 {
            Err(IdentityError::Exposure(index))
        } else {
            Ok(Self(index as u16))
        }
    }

    pub fn index(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for Exposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:03}", self.0)
    }
}

impl FromStr for Exposure {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix('E') {
            Some(digits) if digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()) => {
                digits
                    .parse::<u32>()
                    .map_err(|_| IdentityError::Malformed(s.to_owned()))
                    .and_then(Self::new)
            }
            _ => Err(IdentityError::Malformed(s.to_owned())),
        }
    }
}

/// One exposure of one detector, `R<rr>_S<ss>_E<eee>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChipExposure {
    pub sensor: SensorId,
    pub exposure: Exposure,
}

impl ChipExposure {
    pub fn new(sensor: SensorId, exposure: Exposure) -> Self {
        Self { sensor, exposure }
    }
}

impl fmt::Display for ChipExposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.sensor, self.exposure)
    }
}

impl FromStr for ChipExposure {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sensor, exposure) = s
            .rsplit_once('_')
            .ok_or_else(|| IdentityError::Malformed(s.to_owned()))?;

        Ok(Self::new(sensor.parse()?, exposure.parse()?))
    }
}

/// Observation and filter, the unit of stage 1 work
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VisitId {
    pub observation: ObservationId,
    pub filter: Filter,
}

impl VisitId {
    pub fn new(observation: ObservationId, filter: Filter) -> Self {
        Self {
            observation,
            filter,
        }
    }
}

impl fmt::Display for VisitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-f{}", self.observation, self.filter)
    }
}

impl FromStr for VisitId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (observation, filter) = s
            .split_once("-f")
            .ok_or_else(|| IdentityError::Malformed(s.to_owned()))?;

        // only the letter form is valid inside of a visit id
        if filter.len() != 1 || !filter.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(IdentityError::Malformed(s.to_owned()));
        }

        Ok(Self::new(observation.parse()?, filter.parse()?))
    }
}

/// A single unit of work at a given pipeline stage
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkUnit {
    Visit(VisitId),
    Chip(VisitId, ChipExposure),
}

impl WorkUnit {
    pub fn visit(&self) -> &VisitId {
        match self {
            Self::Visit(visit) | Self::Chip(visit, _) => visit,
        }
    }

    pub fn observation(&self) -> &ObservationId {
        &self.visit().observation
    }

    pub fn filter(&self) -> Filter {
        self.visit().filter
    }

    pub fn chip(&self) -> Option<&ChipExposure> {
        match self {
            Self::Visit(_) => None,
            Self::Chip(_, chip) => Some(chip),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Visit(_) => Stage::Visit,
            Self::Chip(..) => Stage::Chip,
        }
    }

    /// Name that is unique within the visit, used for sentinels in the visit log directory
    pub fn local_name(&self) -> String {
        match self {
            Self::Visit(visit) => visit.to_string(),
            Self::Chip(_, chip) => chip.to_string(),
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visit(visit) => write!(f, "{visit}"),
            Self::Chip(visit, chip) => write!(f, "{visit}-{chip}"),
        }
    }
}

impl FromStr for WorkUnit {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.trim().split('-').collect::<Vec<_>>();

        match parts.as_slice() {
            [observation, filter] => Ok(Self::Visit(format!("{observation}-{filter}").parse()?)),
            [observation, filter, chip] => Ok(Self::Chip(
                format!("{observation}-{filter}").parse()?,
                chip.parse()?,
            )),
            _ => Err(IdentityError::Malformed(s.to_owned())),
        }
    }
}

/// All science sensors of the focal plane in canonical order
pub static FOCAL_PLANE: Lazy<Vec<SensorId>> = Lazy::new(|| {
    let mut sensors = Vec::new();

    for raft_row in 0..RAFT_GRID {
        for raft_col in 0..RAFT_GRID {
            for sensor_row in 0..SENSOR_GRID {
                for sensor_col in 0..SENSOR_GRID {
                    // corner rafts are rejected by the constructor
                    if let Ok(sensor) = SensorId::new(raft_row, raft_col, sensor_row, sensor_col) {
                        sensors.push(sensor);
                    }
                }
            }
        }
    }

    sensors
});

/// Every exposure of every focal plane sensor, sensor-major as in the job manifests
pub fn focal_plane_exposures(exposures: u16) -> impl Iterator<Item = ChipExposure> {
    let exposures = exposures.min(MAX_EXPOSURE + 1);

    FOCAL_PLANE.iter().flat_map(move |sensor| {
        (0..exposures).map(move |index| ChipExposure::new(*sensor, Exposure(index)))
    })
}
