//! Backend capability interface.

use crate::config::DeviceConfig;
use crate::memory::MemoryBackend;
use crate::mirror::MirrorBackend;
use crate::proxy::ProxyBackend;
use std::sync::Arc;
use vbd_block::{BlockRequest, StoreResolver};
use vbd_error::Result;
use vbd_types::{BackendMode, SectorCount};

/// The strategy servicing I/O for the device.
///
/// The device only talks to backends through this trait. It calls
/// `initialize` once before admitting any request, `handle_request` for
/// every admitted request, and `shutdown` after the last request has
/// completed.
pub trait Backend: Send + Sync {
    fn mode(&self) -> BackendMode;

    /// Acquire everything needed to serve `capacity` sectors.
    ///
    /// On error nothing acquired by this call is retained. Calling it on an
    /// initialized backend is `InvalidConfiguration`; call [`Self::shutdown`]
    /// first.
    fn initialize(&mut self, capacity: SectorCount) -> Result<()>;

    /// Service `request`, completing it exactly once.
    ///
    /// Completion may happen before this returns (synchronous backends) or
    /// later on another thread.
    fn handle_request(&self, request: BlockRequest);

    /// Release everything acquired by `initialize`.
    ///
    /// Safe to call on a backend that never initialized or failed to. Does
    /// not wait for in-flight requests.
    fn shutdown(&mut self);
}

/// Build an uninitialized backend for `mode` from the current settings.
#[must_use]
pub fn backend_for(
    mode: BackendMode,
    config: &DeviceConfig,
    resolver: &Arc<dyn StoreResolver>,
) -> Box<dyn Backend> {
    match mode {
        BackendMode::Memory => Box::new(MemoryBackend::new()),
        BackendMode::Proxy => Box::new(ProxyBackend::new(
            config.proxy_path.clone(),
            Arc::clone(resolver),
        )),
        BackendMode::Mirror => Box::new(MirrorBackend::new(
            config.mirror_paths.clone(),
            Arc::clone(resolver),
        )),
    }
}
