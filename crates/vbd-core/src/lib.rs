#![forbid(unsafe_code)]
//! Virtual block device engine.
//!
//! A [`Device`] exposes one logical block device whose requests are served
//! by exactly one [`Backend`] at a time:
//!
//! - [`MemoryBackend`]: a zeroed in-process buffer.
//! - [`ProxyBackend`]: passthrough to one backing store.
//! - [`MirrorBackend`]: RAID1 across up to 16 backing stores.
//!
//! Requests enter through [`Device::dispatch`], pass the [`AdmissionGate`],
//! and are handed to the backend. Lifecycle changes go through
//! [`Device::start`], [`Device::reconfigure`] and [`Device::shutdown`], which
//! close the gate and drain in-flight requests before a backend is shut
//! down.
//!
//! ```text
//! dispatch ──▶ AdmissionGate ──▶ Backend::handle_request ──▶ store(s)
//!                   ▲                                           │
//!                   └──────────── token released ◀── completion ┘
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod gate;
pub mod memory;
pub mod metrics;
pub mod mirror;
pub mod proxy;

#[cfg(test)]
mod testing;

pub use backend::{Backend, backend_for};
pub use config::{DeviceConfig, parse_mirror_list};
pub use device::{Device, DeviceStatus};
pub use gate::{AdmissionGate, InflightToken};
pub use memory::MemoryBackend;
pub use metrics::{DeviceMetrics, MetricsSnapshot};
pub use mirror::MirrorBackend;
pub use proxy::ProxyBackend;

pub use vbd_block::{
    Access, BackingStore, BlockRequest, Completion, FileBackingStore, FileStoreResolver,
    MemBackingStore, MemStoreResolver, StoreHandle, StoreResolver, StoreStats,
};
pub use vbd_error::{IoStatus, Result, VbdError};
pub use vbd_types::{
    BackendMode, DEFAULT_CAPACITY_MIB, DeviceState, Direction, MAX_MIRRORS, MIB_SECTORS,
    SECTOR_SIZE, Sector, SectorCount,
};
