//! Proxy backend: every request is forwarded to one backing store.

use crate::backend::Backend;
use std::sync::Arc;
use tracing::{info, warn};
use vbd_block::{Access, BlockRequest, StoreHandle, StoreResolver};
use vbd_error::{Result, VbdError};
use vbd_types::{BackendMode, SectorCount};

pub struct ProxyBackend {
    path: Option<String>,
    resolver: Arc<dyn StoreResolver>,
    capacity: SectorCount,
    store: Option<StoreHandle>,
}

impl ProxyBackend {
    #[must_use]
    pub fn new(path: Option<String>, resolver: Arc<dyn StoreResolver>) -> Self {
        Self {
            path,
            resolver,
            capacity: SectorCount::ZERO,
            store: None,
        }
    }

    /// The resolved store, if initialized.
    #[must_use]
    pub fn store(&self) -> Option<&StoreHandle> {
        self.store.as_ref()
    }
}

impl Backend for ProxyBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Proxy
    }

    fn initialize(&mut self, capacity: SectorCount) -> Result<()> {
        if self.store.is_some() {
            return Err(VbdError::InvalidConfiguration(
                "proxy backend is already initialized".to_owned(),
            ));
        }
        let path = self
            .path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                VbdError::InvalidConfiguration("no proxy backing store configured".to_owned())
            })?;

        let handle = self.resolver.resolve(path, Access::ReadWrite)?;
        if let Err(err) = handle.ensure_capacity(capacity) {
            warn!(path, error = %err, "proxy backing store rejected");
            return Err(err);
        }
        info!(
            path,
            store_sectors = handle.capacity().0,
            capacity_sectors = capacity.0,
            "proxy backend attached"
        );
        self.capacity = capacity;
        self.store = Some(handle);
        Ok(())
    }

    fn handle_request(&self, request: BlockRequest) {
        let Some(store) = &self.store else {
            request.fail(VbdError::IoFailure(
                "proxy backend is not initialized".to_owned(),
            ));
            return;
        };
        if !request.fits_within(self.capacity) {
            let detail = format!(
                "request at sector {} for {} sectors exceeds capacity {}",
                request.start(),
                request.len_sectors(),
                self.capacity
            );
            request.fail(VbdError::IoFailure(detail));
            return;
        }
        let start = request.start().0;
        store.submit(request.chain(move |status| {
            if let Err(err) = status {
                warn!(start, error = %err, "proxied request failed");
            }
        }));
    }

    fn shutdown(&mut self) {
        if let Some(store) = self.store.take() {
            store.release();
        }
        self.capacity = SectorCount::ZERO;
    }
}

impl std::fmt::Debug for ProxyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyBackend")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
