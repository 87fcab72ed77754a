//! Partial-merge bookkeeping for cube slices.
//!
//! A [`ControlEntry`] records which raw inputs have already been folded into
//! one `(cube, tile, period)` slice. The set only ever grows; a compose call
//! that is re-issued with the current entry skips inputs it already merged.

use core::fmt;
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cube::{PeriodId, TileId};

/// Key of a control entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControlKey {
    pub cube: String,
    pub tile_id: TileId,
    pub period_id: PeriodId,
}

impl ControlKey {
    pub fn new(cube: impl Into<String>, tile_id: TileId, period_id: PeriodId) -> Self {
        Self {
            cube: cube.into(),
            tile_id,
            period_id,
        }
    }
}

impl fmt::Display for ControlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cube, self.tile_id, self.period_id)
    }
}

/// Merged-input set of one slice.
///
/// `version` is the compare-and-swap token. `0` means the entry has never been
/// stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEntry {
    pub key: ControlKey,
    pub merged: BTreeSet<String>,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ControlEntry {
    pub fn empty(key: ControlKey) -> Self {
        Self {
            key,
            merged: BTreeSet::new(),
            version: 0,
            updated_at: None,
        }
    }

    pub fn contains(&self, input: &str) -> bool {
        self.merged.contains(input)
    }

    /// Fold `input` in. Returns `false` if it was already merged.
    pub fn fold(&mut self, input: impl Into<String>) -> bool {
        self.merged.insert(input.into())
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    /// `true` if every input merged in `other` is also merged here.
    pub fn covers(&self, other: &ControlEntry) -> bool {
        self.key == other.key && self.merged.is_superset(&other.merged)
    }

    /// Union of both merged sets, keeping `self`'s key and version.
    pub fn union(&self, other: &ControlEntry) -> ControlEntry {
        let mut merged = self.merged.clone();
        merged.extend(other.merged.iter().cloned());
        ControlEntry {
            key: self.key.clone(),
            merged,
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}
