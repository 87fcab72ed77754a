//! Raster compute boundary.
//!
//! The engine never touches pixels. It hands a tile/period slice plus its
//! current [`ControlEntry`] to a [`RasterCompute`] and stores whatever merged
//! state comes back.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use cubeflow_core::{ControlEntry, PeriodId, TileId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComputeError {
    #[error("no scenes found for {tile}/{period}")]
    NoScenes { tile: TileId, period: PeriodId },
    #[error("composition failed: {0}")]
    Failed(String),
    #[error("compute backend unavailable: {0}")]
    Unavailable(String),
}

/// Builds one cube slice.
///
/// `compose` must be safe to call again with the same arguments: inputs
/// already folded into `current` are not applied a second time, and the
/// returned entry contains at least everything `current` did.
pub trait RasterCompute: Send + Sync {
    fn compose(
        &self,
        tile: &TileId,
        period: &PeriodId,
        current: &ControlEntry,
    ) -> Result<ControlEntry, ComputeError>;
}

impl<R> RasterCompute for Arc<R>
where
    R: RasterCompute + ?Sized,
{
    fn compose(
        &self,
        tile: &TileId,
        period: &PeriodId,
        current: &ControlEntry,
    ) -> Result<ControlEntry, ComputeError> {
        (**self).compose(tile, period, current)
    }
}

type Slice = (TileId, PeriodId);

/// Deterministic compute backend for tests and dev deployments.
///
/// Each slice has a fixed list of scene ids. By default every slice gets
/// `default_inputs` generated ids; specific slices or whole tiles can be made
/// to fail.
#[derive(Debug)]
pub struct StaticRasterCompute {
    default_inputs: usize,
    inputs: RwLock<HashMap<Slice, Vec<String>>>,
    failing_slices: RwLock<HashMap<Slice, String>>,
    failing_tiles: RwLock<HashSet<TileId>>,
    calls: AtomicUsize,
    merges: AtomicUsize,
}

impl Default for StaticRasterCompute {
    fn default() -> Self {
        Self::new(2)
    }
}

impl StaticRasterCompute {
    pub fn new(default_inputs: usize) -> Self {
        Self {
            default_inputs,
            inputs: RwLock::new(HashMap::new()),
            failing_slices: RwLock::new(HashMap::new()),
            failing_tiles: RwLock::new(HashSet::new()),
            calls: AtomicUsize::new(0),
            merges: AtomicUsize::new(0),
        }
    }

    pub fn with_inputs(self, tile: TileId, period: PeriodId, inputs: Vec<String>) -> Self {
        if let Ok(mut map) = self.inputs.write() {
            map.insert((tile, period), inputs);
        }
        self
    }

    /// Make one slice fail on every call.
    pub fn fail_on(&self, tile: TileId, period: PeriodId, reason: impl Into<String>) {
        if let Ok(mut map) = self.failing_slices.write() {
            map.insert((tile, period), reason.into());
        }
    }

    /// Make every slice of a tile fail.
    pub fn fail_tile(&self, tile: TileId) {
        if let Ok(mut set) = self.failing_tiles.write() {
            set.insert(tile);
        }
    }

    /// Drop every configured failure.
    pub fn clear_failures(&self) {
        if let Ok(mut map) = self.failing_slices.write() {
            map.clear();
        }
        if let Ok(mut set) = self.failing_tiles.write() {
            set.clear();
        }
    }

    /// Number of `compose` invocations.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of inputs actually folded in across all calls.
    pub fn merges_applied(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }

    fn scenes(&self, tile: &TileId, period: &PeriodId) -> Result<Vec<String>, ComputeError> {
        let map = self
            .inputs
            .read()
            .map_err(|_| ComputeError::Unavailable("input table poisoned".to_string()))?;
        if let Some(list) = map.get(&(tile.clone(), period.clone())) {
            return Ok(list.clone());
        }
        Ok((0..self.default_inputs)
            .map(|i| format!("{tile}:{period}:{i}"))
            .collect())
    }

    fn failure(&self, tile: &TileId, period: &PeriodId) -> Result<Option<String>, ComputeError> {
        let slices = self
            .failing_slices
            .read()
            .map_err(|_| ComputeError::Unavailable("failure table poisoned".to_string()))?;
        if let Some(reason) = slices.get(&(tile.clone(), period.clone())) {
            return Ok(Some(reason.clone()));
        }
        let tiles = self
            .failing_tiles
            .read()
            .map_err(|_| ComputeError::Unavailable("failure table poisoned".to_string()))?;
        Ok(tiles
            .contains(tile)
            .then(|| format!("tile {tile} is not processable")))
    }
}

impl RasterCompute for StaticRasterCompute {
    fn compose(
        &self,
        tile: &TileId,
        period: &PeriodId,
        current: &ControlEntry,
    ) -> Result<ControlEntry, ComputeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.failure(tile, period)? {
            return Err(ComputeError::Failed(reason));
        }

        let scenes: BTreeSet<String> = self.scenes(tile, period)?.into_iter().collect();
        if scenes.is_empty() {
            return Err(ComputeError::NoScenes {
                tile: tile.clone(),
                period: period.clone(),
            });
        }

        let mut next = current.clone();
        let folded = scenes.into_iter().filter(|s| next.fold(s.clone())).count();
        self.merges.fetch_add(folded, Ordering::SeqCst);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cubeflow_core::ControlKey;

    fn slice() -> (TileId, PeriodId) {
        ("001".parse().unwrap(), "2020-01-01_2020-01-31".parse().unwrap())
    }

    #[test]
    fn recompose_does_not_refold_inputs() {
        let compute = StaticRasterCompute::new(3);
        let (tile, period) = slice();
        let empty = ControlEntry::empty(ControlKey::new("S2_10", tile.clone(), period.clone()));

        let first = compute.compose(&tile, &period, &empty).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.covers(&empty));

        let second = compute.compose(&tile, &period, &first).unwrap();
        assert_eq!(second, first);
        assert_eq!(compute.merges_applied(), 3);
        assert_eq!(compute.calls(), 2);
    }

    #[test]
    fn empty_scene_list_is_an_error() {
        let (tile, period) = slice();
        let compute = StaticRasterCompute::new(1).with_inputs(tile.clone(), period.clone(), vec![]);
        let entry = ControlEntry::empty(ControlKey::new("S2_10", tile.clone(), period.clone()));

        assert!(matches!(
            compute.compose(&tile, &period, &entry),
            Err(ComputeError::NoScenes { .. })
        ));
    }

    #[test]
    fn configured_failures_apply_per_slice_and_per_tile() {
        let compute = StaticRasterCompute::default();
        let (tile, period) = slice();
        let entry = ControlEntry::empty(ControlKey::new("S2_10", tile.clone(), period.clone()));
        compute.fail_on(tile.clone(), period.clone(), "cloud mask missing");

        assert_eq!(
            compute.compose(&tile, &period, &entry),
            Err(ComputeError::Failed("cloud mask missing".to_string()))
        );

        let other: TileId = "002".parse().unwrap();
        compute.fail_tile(other.clone());
        let entry = ControlEntry::empty(ControlKey::new("S2_10", other.clone(), period.clone()));
        assert!(compute.compose(&other, &period, &entry).is_err());
    }
}
