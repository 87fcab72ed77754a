//! Cube definitions: names, tiles, periods and the resolved definition a job builds.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::Fingerprint;

const PERIOD_DATE_FORMAT: &str = "%Y-%m-%d";

/// Identifier of a spatial tile in the cube's grid (e.g. `089098`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId(String);

impl TileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TileId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("tile id cannot be empty"));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::validation(format!(
                "tile id '{trimmed}' may only contain ASCII letters, digits, '-' and '_'"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl FromStr for TileId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl From<TileId> for String {
    fn from(value: TileId) -> Self {
        value.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A closed date interval `[start, end]`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    start: NaiveDate,
    end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> DomainResult<Self> {
        if start > end {
            return Err(DomainError::validation(format!(
                "period start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn id(&self) -> PeriodId {
        PeriodId {
            raw: format!(
                "{}_{}",
                self.start.format(PERIOD_DATE_FORMAT),
                self.end.format(PERIOD_DATE_FORMAT)
            ),
            period: *self,
        }
    }
}

impl FromStr for Period {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('_')
            .ok_or_else(|| DomainError::validation(format!("period '{s}' must be START_END")))?;
        let parse = |v: &str| {
            NaiveDate::parse_from_str(v, PERIOD_DATE_FORMAT)
                .map_err(|e| DomainError::validation(format!("period '{s}': {e}")))
        };
        Period::new(parse(start)?, parse(end)?)
    }
}

/// Identifier of a time period, `YYYY-MM-DD_YYYY-MM-DD`.
///
/// Lexical order equals chronological order of the start date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodId {
    raw: String,
    period: Period,
}

impl PeriodId {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn period(&self) -> Period {
        self.period
    }
}

impl TryFrom<String> for PeriodId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(value.parse::<Period>()?.id())
    }
}

impl FromStr for PeriodId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse::<Period>()?.id())
    }
}

impl From<PeriodId> for String {
    fn from(value: PeriodId) -> Self {
        value.raw
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// How the observations of one period are composed into a slice.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositeFunction {
    /// No temporal composition; one slice per observation window.
    Identity,
    /// Per-pixel median.
    #[serde(rename = "MED")]
    Median,
    /// Best-pixel stack.
    #[serde(rename = "STK")]
    Stack,
}

impl CompositeFunction {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Identity => "IDENTITY",
            Self::Median => "MED",
            Self::Stack => "STK",
        }
    }
}

impl FromStr for CompositeFunction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IDENTITY" => Ok(Self::Identity),
            "MED" => Ok(Self::Median),
            "STK" => Ok(Self::Stack),
            other => Err(DomainError::cube_name(format!(
                "unknown composite function '{other}' (expected IDENTITY, MED or STK)"
            ))),
        }
    }
}

/// Parsed data cube name: `<COLLECTION>_<RESOLUTION>[_<STEP>[_<FUNCTION>]]`.
///
/// ```text
/// S2_10            -> identity cube, 10m
/// S2_10_1M_MED     -> monthly median composite, 10m
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CubeName {
    raw: String,
    prefix: String,
    resolution: u32,
    temporal_step: Option<String>,
    function: CompositeFunction,
}

impl CubeName {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Collection prefix (e.g. `S2`).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Spatial resolution in metres.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Temporal step token (e.g. `1M`, `16D`), absent for identity cubes.
    pub fn temporal_step(&self) -> Option<&str> {
        self.temporal_step.as_deref()
    }

    pub fn composite_function(&self) -> CompositeFunction {
        self.function
    }
}

impl FromStr for CubeName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let parts: Vec<&str> = raw.split('_').collect();
        if !(2..=4).contains(&parts.len()) || parts.iter().any(|p| p.is_empty()) {
            return Err(DomainError::cube_name(format!("'{raw}' must have 2 to 4 non-empty parts")));
        }

        let resolution = parts[1].parse::<u32>().map_err(|_| {
            DomainError::cube_name(format!(
                "'{raw}': resolution '{}' is not a number",
                parts[1]
            ))
        })?;
        if resolution == 0 {
            return Err(DomainError::cube_name(format!(
                "'{raw}': resolution must be positive"
            )));
        }

        let function = match parts.get(3) {
            Some(code) => code.parse()?,
            None => CompositeFunction::Identity,
        };

        Ok(Self {
            raw: raw.to_string(),
            prefix: parts[0].to_string(),
            resolution,
            temporal_step: parts.get(2).map(|s| s.to_string()),
            function,
        })
    }
}

impl TryFrom<String> for CubeName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CubeName> for String {
    fn from(value: CubeName) -> Self {
        value.raw
    }
}

impl fmt::Display for CubeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A cube definition resolved against the catalog: the exact tiles and periods
/// a job covers.
///
/// Sets are ordered so the serialized form is canonical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeDefinition {
    pub name: CubeName,
    pub collections: BTreeSet<String>,
    pub tiles: BTreeSet<TileId>,
    pub periods: BTreeSet<PeriodId>,
}

impl CubeDefinition {
    pub fn new(
        name: CubeName,
        collections: impl IntoIterator<Item = String>,
        tiles: impl IntoIterator<Item = TileId>,
        periods: impl IntoIterator<Item = PeriodId>,
    ) -> DomainResult<Self> {
        let def = Self {
            name,
            collections: collections
                .into_iter()
                .map(|c| c.trim().to_string())
                .collect(),
            tiles: tiles.into_iter().collect(),
            periods: periods.into_iter().collect(),
        };
        def.validate()?;
        Ok(def)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.tiles.is_empty() {
            return Err(DomainError::validation("cube definition has no tiles"));
        }
        if self.periods.is_empty() {
            return Err(DomainError::validation("cube definition has no periods"));
        }
        if self.collections.is_empty() || self.collections.iter().any(|c| c.is_empty()) {
            return Err(DomainError::validation(
                "cube definition needs at least one non-empty collection",
            ));
        }
        Ok(())
    }

    pub fn unit_count(&self) -> usize {
        self.tiles.len() * self.periods.len()
    }

    /// Cross product of tiles × periods.
    pub fn cells(&self) -> impl Iterator<Item = (&TileId, &PeriodId)> {
        self.tiles
            .iter()
            .flat_map(|t| self.periods.iter().map(move |p| (t, p)))
    }

    /// Deterministic hash of the canonical definition.
    pub fn fingerprint(&self) -> Fingerprint {
        // Ordered sets serialize identically regardless of input order.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        Fingerprint::of_bytes(&canonical)
    }
}
