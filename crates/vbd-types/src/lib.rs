#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const SECTOR_SHIFT: u32 = 9;
pub const SECTOR_SIZE: usize = 1 << SECTOR_SHIFT;
/// Sectors per MiB.
pub const MIB_SECTORS: u64 = 1 << (20 - SECTOR_SHIFT);

/// Upper bound on configured mirror legs.
pub const MAX_MIRRORS: usize = 16;
pub const DEFAULT_CAPACITY_MIB: u64 = 100;

/// Sector index on the logical device (512-byte units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Sector(pub u64);

impl Sector {
    pub const ZERO: Self = Self(0);

    /// Byte offset of this sector, `None` on overflow.
    #[must_use]
    pub fn byte_offset(self) -> Option<u64> {
        self.0.checked_mul(SECTOR_SIZE as u64)
    }

    /// Advance by `count` sectors, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A number of sectors; used for device and backing store capacity.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SectorCount(pub u64);

impl SectorCount {
    pub const ZERO: Self = Self(0);

    /// Capacity of `mib` MiB, `None` on overflow.
    #[must_use]
    pub fn from_mib(mib: u64) -> Option<Self> {
        mib.checked_mul(MIB_SECTORS).map(Self)
    }

    /// Whole sectors contained in `bytes` (truncating).
    #[must_use]
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes >> SECTOR_SHIFT)
    }

    /// Size in bytes, `None` on overflow.
    #[must_use]
    pub fn bytes(self) -> Option<u64> {
        self.0.checked_mul(SECTOR_SIZE as u64)
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SectorCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sectors", self.0)
    }
}

/// Transfer direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

/// Which backend services the device.
///
/// The legacy numeric selectors (`0`, `1`, `2`) are still accepted by
/// [`FromStr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// All data lives in a zeroed in-process buffer.
    Memory,
    /// Every request is forwarded to one backing store.
    Proxy,
    /// RAID1: writes go to every backing store, reads to the first.
    Mirror,
}

impl BackendMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Proxy => "proxy",
            Self::Mirror => "mirror",
        }
    }
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "vm" | "0" => Ok(Self::Memory),
            "proxy" | "1" => Ok(Self::Proxy),
            "mirror" | "raid1" | "2" => Ok(Self::Mirror),
            other => Err(ParseError::UnknownMode(other.to_owned())),
        }
    }
}

/// Lifecycle state of the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Never started, or shut down.
    Uninitialized,
    /// A backend is installed and requests are admitted.
    Created,
    /// Torn down (or a create failed); requests are rejected.
    Deleted,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Created => "created",
            Self::Deleted => "deleted",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown backend mode: {0:?} (expected memory, proxy or mirror)")]
    UnknownMode(String),
}
