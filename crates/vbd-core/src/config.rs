//! Device configuration.

use serde::{Deserialize, Deserializer, Serialize};
use vbd_error::{Result, VbdError};
use vbd_types::{BackendMode, DEFAULT_CAPACITY_MIB, MAX_MIRRORS, SectorCount};

/// Settings consumed by `Create`.
///
/// Changes made to a live device only take effect on the next create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    /// Device size in MiB.
    pub capacity_mib: u64,
    /// Backend selected at startup; `None` leaves the device unconfigured.
    pub mode: Option<BackendMode>,
    /// Backing store for [`BackendMode::Proxy`].
    pub proxy_path: Option<String>,
    /// Ordered backing stores for [`BackendMode::Mirror`]. Index 0 serves reads.
    ///
    /// Entries loaded from a file are normalized like [`parse_mirror_list`].
    #[serde(deserialize_with = "deserialize_mirror_paths")]
    pub mirror_paths: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            capacity_mib: DEFAULT_CAPACITY_MIB,
            mode: None,
            proxy_path: None,
            mirror_paths: Vec::new(),
        }
    }
}

impl DeviceConfig {
    /// Configured capacity in sectors.
    pub fn capacity_sectors(&self) -> Result<SectorCount> {
        if self.capacity_mib == 0 {
            return Err(VbdError::InvalidConfiguration(
                "capacity must be at least 1 MiB".to_owned(),
            ));
        }
        SectorCount::from_mib(self.capacity_mib).ok_or_else(|| {
            VbdError::InvalidConfiguration(format!(
                "capacity of {} MiB overflows the sector count",
                self.capacity_mib
            ))
        })
    }

    /// Replace the mirror set from a comma-delimited list.
    pub fn set_mirror_list(&mut self, list: &str) -> Result<()> {
        self.mirror_paths = parse_mirror_list(list)?;
        Ok(())
    }

    /// Check everything that can be checked without touching a store.
    pub fn validate(&self) -> Result<()> {
        self.capacity_sectors()?;
        if self.mirror_paths.len() > MAX_MIRRORS {
            return Err(too_many_mirrors(self.mirror_paths.len()));
        }
        Ok(())
    }
}

/// Split a comma-delimited list of backing-store paths.
///
/// Tokens are trimmed and empty tokens are skipped, so `"a, ,b,"` names two
/// stores. More than [`MAX_MIRRORS`] entries is an error.
pub fn parse_mirror_list(list: &str) -> Result<Vec<String>> {
    normalize_mirror_paths(list.split(','))
}

fn normalize_mirror_paths<'a>(tokens: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
    let paths: Vec<String> = tokens
        .into_iter()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_owned)
        .collect();
    if paths.len() > MAX_MIRRORS {
        return Err(too_many_mirrors(paths.len()));
    }
    Ok(paths)
}

fn deserialize_mirror_paths<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    normalize_mirror_paths(raw.iter().map(String::as_str)).map_err(serde::de::Error::custom)
}

fn too_many_mirrors(count: usize) -> VbdError {
    VbdError::InvalidConfiguration(format!(
        "{count} mirror paths configured, at most {MAX_MIRRORS} are supported"
    ))
}
