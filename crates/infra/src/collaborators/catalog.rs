//! Catalog boundary: turns a submitted [`JobSpec`] into a resolved
//! [`CubeDefinition`].

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cubeflow_core::{CubeDefinition, CubeName, DomainError, PeriodId, TileId, Timeline};

/// A cube-build request as submitted by a client.
///
/// `periods` and `timeline` are additive; at least one of them must yield a
/// period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub cube: String,
    pub tiles: Vec<String>,
    #[serde(default)]
    pub periods: Vec<String>,
    #[serde(default)]
    pub timeline: Option<Timeline>,
    pub collections: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
    #[error("tile {0} is not part of the grid")]
    UnknownTile(String),
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl From<DomainError> for CatalogError {
    fn from(err: DomainError) -> Self {
        CatalogError::InvalidSpec(err.to_string())
    }
}

pub trait CatalogStore: Send + Sync {
    fn resolve(&self, spec: &JobSpec) -> Result<CubeDefinition, CatalogError>;
}

impl<C> CatalogStore for Arc<C>
where
    C: CatalogStore + ?Sized,
{
    fn resolve(&self, spec: &JobSpec) -> Result<CubeDefinition, CatalogError> {
        (**self).resolve(spec)
    }
}

/// Catalog backed by a fixed set of collections and, optionally, a tile grid.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    collections: BTreeSet<String>,
    grid: Option<BTreeSet<TileId>>,
}

impl InMemoryCatalog {
    pub fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collections: collections.into_iter().map(Into::into).collect(),
            grid: None,
        }
    }

    /// Restrict accepted tiles to `tiles`.
    pub fn with_grid(mut self, tiles: impl IntoIterator<Item = TileId>) -> Self {
        self.grid = Some(tiles.into_iter().collect());
        self
    }
}

impl CatalogStore for InMemoryCatalog {
    fn resolve(&self, spec: &JobSpec) -> Result<CubeDefinition, CatalogError> {
        let name: CubeName = spec.cube.trim().parse()?;

        for collection in &spec.collections {
            let collection = collection.trim();
            if !self.collections.contains(collection) {
                return Err(CatalogError::UnknownCollection(collection.to_string()));
            }
        }

        let tiles = spec
            .tiles
            .iter()
            .map(|raw| raw.trim().parse::<TileId>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        if let Some(grid) = &self.grid {
            if let Some(missing) = tiles.iter().find(|t| !grid.contains(*t)) {
                return Err(CatalogError::UnknownTile(missing.to_string()));
            }
        }

        let mut periods = spec
            .periods
            .iter()
            .map(|raw| raw.trim().parse::<PeriodId>())
            .collect::<Result<BTreeSet<_>, _>>()?;
        if let Some(timeline) = &spec.timeline {
            periods.extend(timeline.periods()?.into_iter().map(|p| p.id()));
        }

        CubeDefinition::new(name, spec.collections.iter().cloned(), tiles, periods)
            .map_err(CatalogError::from)
    }
}
