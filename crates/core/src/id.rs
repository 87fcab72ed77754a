//! Strongly-typed identifiers used across the engine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cube::{PeriodId, TileId};
use crate::error::DomainError;

/// Identifier of a cube-build job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

/// Identifier of a work unit (one tile at one period of a job).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(Uuid);

/// Identifier of a dead-letter record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeadLetterId(Uuid);

/// Deterministic hash of a cube definition, used for idempotent submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

macro_rules! impl_time_ordered {
    ($t:ty) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

impl_uuid_newtype!(JobId, "JobId");
impl_uuid_newtype!(UnitId, "UnitId");
impl_uuid_newtype!(DeadLetterId, "DeadLetterId");
impl_uuid_newtype!(Fingerprint, "Fingerprint");

impl_time_ordered!(JobId);
impl_time_ordered!(DeadLetterId);

/// Namespace for definition fingerprints (UUIDv5).
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6c0b_5e9a_2f4d_4a31_9c1e_8d7f_3b2a_1e05);

impl UnitId {
    /// Derive the unit id of `(job, tile, period)`.
    ///
    /// Deterministic, so a redelivered message and the seeded record always
    /// agree on the key.
    pub fn derive(job_id: JobId, tile: &TileId, period: &PeriodId) -> Self {
        let name = format!("{}|{}", tile.as_str(), period.as_str());
        Self(Uuid::new_v5(job_id.as_uuid(), name.as_bytes()))
    }
}

impl Fingerprint {
    /// Hash canonical definition bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(Uuid::new_v5(&FINGERPRINT_NAMESPACE, bytes))
    }
}

impl DeadLetterId {
    /// Id of the dead-letter record for one delivery attempt of a unit.
    ///
    /// Every path that dead-letters the same attempt produces the same id, so
    /// the ledger keeps one entry per failed attempt.
    pub fn for_attempt(unit_id: UnitId, attempt: u32) -> Self {
        let name = format!("dead-letter|{attempt}");
        Self(Uuid::new_v5(unit_id.as_uuid(), name.as_bytes()))
    }
}
