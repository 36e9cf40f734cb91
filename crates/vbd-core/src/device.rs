//! The logical block device: request dispatch and lifecycle control.
//!
//! ```text
//!               start / reconfigure
//! Uninitialized ───────────────────▶ Created ◀──┐
//!       ▲                              │        │ reconfigure
//!       │ shutdown                     ▼        │ (delete + create)
//!       └─────────────────────────── Deleted ───┘
//! ```
//!
//! A failed create always lands in `Deleted`. While the device is not
//! `Created`, and from the moment a delete starts, every dispatched request
//! fails immediately with [`VbdError::DeviceDeleting`].

use crate::backend::{Backend, backend_for};
use crate::config::DeviceConfig;
use crate::gate::AdmissionGate;
use crate::metrics::{DeviceMetrics, MetricsSnapshot};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use vbd_block::{BlockRequest, StoreResolver};
use vbd_error::{Result, VbdError};
use vbd_types::{BackendMode, DeviceState, SectorCount};

/// How long a delete waits on a slow drain before logging again.
const DRAIN_WARN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Lifecycle {
    state: DeviceState,
    mode: Option<BackendMode>,
}

/// Serialisable point-in-time view of a [`Device`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceStatus {
    pub state: DeviceState,
    /// Mode of the installed backend, `None` unless `Created`.
    pub mode: Option<BackendMode>,
    pub capacity_sectors: u64,
    pub in_flight: u64,
    pub metrics: MetricsSnapshot,
}

/// One virtual block device.
///
/// Dispatch may be called from any number of threads. Lifecycle calls
/// (`start`, `reconfigure`, `shutdown`) serialize on one lock held for the
/// whole delete and create sequence. They block while in-flight requests
/// drain, so they must not be called from a completion callback.
pub struct Device {
    resolver: Arc<dyn StoreResolver>,
    settings: Mutex<DeviceConfig>,
    reconfigure_lock: Mutex<()>,
    current: Mutex<Lifecycle>,
    gate: Arc<AdmissionGate>,
    backend: RwLock<Option<Box<dyn Backend>>>,
    capacity: AtomicU64,
    metrics: Arc<DeviceMetrics>,
}

impl Device {
    /// A device in `Uninitialized` state. Nothing is allocated or resolved
    /// until [`Self::start`].
    #[must_use]
    pub fn new(config: DeviceConfig, resolver: Arc<dyn StoreResolver>) -> Self {
        Self {
            resolver,
            settings: Mutex::new(config),
            reconfigure_lock: Mutex::new(()),
            current: Mutex::new(Lifecycle {
                state: DeviceState::Uninitialized,
                mode: None,
            }),
            gate: Arc::new(AdmissionGate::new()),
            backend: RwLock::new(None),
            capacity: AtomicU64::new(0),
            metrics: Arc::new(DeviceMetrics::new()),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create the device with the configured mode.
    ///
    /// Fails if the device was already started. A failed create leaves the
    /// device `Deleted`; [`Self::reconfigure`] can then retry.
    pub fn start(&self) -> Result<DeviceState> {
        let _serial = self.reconfigure_lock.lock();
        let state = self.current.lock().state;
        if state != DeviceState::Uninitialized {
            return Err(VbdError::InvalidConfiguration(format!(
                "device already started (state {state})"
            )));
        }
        let mode = self.settings.lock().mode;
        self.create(mode)?;
        Ok(DeviceState::Created)
    }

    /// Switch to `mode`, tearing the current backend down first.
    ///
    /// Before [`Self::start`] this only records the mode. Otherwise any
    /// installed backend is drained and shut down, then a new one is
    /// created with the current settings. Returns the resulting state.
    pub fn reconfigure(&self, mode: Option<BackendMode>) -> Result<DeviceState> {
        let _serial = self.reconfigure_lock.lock();
        self.settings.lock().mode = mode;
        let state = self.current.lock().state;
        info!(from = %state, to = ?mode, "reconfiguring device");
        match state {
            DeviceState::Uninitialized => Ok(DeviceState::Uninitialized),
            DeviceState::Created | DeviceState::Deleted => {
                if state == DeviceState::Created {
                    self.delete();
                }
                self.create(mode)?;
                Ok(DeviceState::Created)
            }
        }
    }

    /// Delete the device if created and return it to `Uninitialized`.
    pub fn shutdown(&self) {
        let _serial = self.reconfigure_lock.lock();
        if self.current.lock().state == DeviceState::Created {
            self.delete();
        }
        self.current.lock().state = DeviceState::Uninitialized;
        info!("device shut down");
    }

    fn create(&self, mode: Option<BackendMode>) -> Result<()> {
        let result = self.try_create(mode);
        if let Err(err) = &result {
            warn!(mode = ?mode, error = %err, "device create failed");
            self.delete();
        }
        result
    }

    fn try_create(&self, mode: Option<BackendMode>) -> Result<()> {
        let mode = mode.ok_or_else(|| {
            VbdError::InvalidConfiguration("no backend mode selected".to_owned())
        })?;
        let config = self.settings.lock().clone();
        config.validate()?;
        let capacity = config.capacity_sectors()?;

        let mut backend = backend_for(mode, &config, &self.resolver);
        if let Err(err) = backend.initialize(capacity) {
            backend.shutdown();
            return Err(err);
        }

        *self.backend.write() = Some(backend);
        self.capacity.store(capacity.0, Ordering::Release);
        *self.current.lock() = Lifecycle {
            state: DeviceState::Created,
            mode: Some(mode),
        };
        self.gate.open();
        info!(%mode, capacity_sectors = capacity.0, "device created");
        Ok(())
    }

    /// Stop admissions, wait for in-flight requests, then shut the backend
    /// down.
    fn delete(&self) {
        self.gate.close();
        let in_flight = self.gate.in_flight();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight requests");
        }
        while !self.gate.wait_drained_for(DRAIN_WARN_INTERVAL) {
            warn!(
                in_flight = self.gate.in_flight(),
                "still waiting for in-flight requests to drain"
            );
        }

        if let Some(mut backend) = self.backend.write().take() {
            backend.shutdown();
            debug!(mode = %backend.mode(), "backend shut down");
        }
        self.capacity.store(0, Ordering::Release);
        *self.current.lock() = Lifecycle {
            state: DeviceState::Deleted,
            mode: None,
        };
        info!("device deleted");
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    /// Submit one request.
    ///
    /// Never blocks on I/O. The request's callback runs exactly once, on
    /// this thread or on a backing store's completion thread.
    pub fn dispatch(&self, request: BlockRequest) {
        let Some(token) = self.gate.try_admit() else {
            self.metrics.record_rejected();
            debug!(start = request.start().0, "request rejected: device not accepting");
            request.fail(VbdError::DeviceDeleting);
            return;
        };
        self.metrics.record_admitted();

        let metrics = Arc::clone(&self.metrics);
        let direction = request.direction();
        let bytes = request.len_bytes() as u64;
        let request = request.then(move |ok| {
            metrics.record_completion(ok, direction, bytes);
            drop(token);
        });

        match self.backend.read().as_deref() {
            Some(backend) => backend.handle_request(request),
            None => request.fail(VbdError::DeviceDeleting),
        }
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Takes effect at the next create.
    pub fn set_capacity_mib(&self, capacity_mib: u64) -> Result<()> {
        let mut settings = self.settings.lock();
        let candidate = DeviceConfig {
            capacity_mib,
            ..settings.clone()
        };
        candidate.capacity_sectors()?;
        settings.capacity_mib = capacity_mib;
        Ok(())
    }

    /// Takes effect at the next create.
    pub fn set_proxy_path(&self, path: impl Into<String>) {
        self.settings.lock().proxy_path = Some(path.into());
    }

    /// Takes effect at the next create. The previous list is kept on error.
    pub fn set_mirror_list(&self, list: &str) -> Result<()> {
        self.settings.lock().set_mirror_list(list)
    }

    #[must_use]
    pub fn config(&self) -> DeviceConfig {
        self.settings.lock().clone()
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.current.lock().state
    }

    /// Mode of the installed backend.
    #[must_use]
    pub fn mode(&self) -> Option<BackendMode> {
        self.current.lock().mode
    }

    /// Capacity of the installed backend, zero unless `Created`.
    #[must_use]
    pub fn capacity(&self) -> SectorCount {
        SectorCount(self.capacity.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.gate.in_flight()
    }

    /// Whether new requests are currently admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.gate.is_closed()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        let current = *self.current.lock();
        DeviceStatus {
            state: current.state,
            mode: current.mode,
            capacity_sectors: self.capacity().0,
            in_flight: self.in_flight(),
            metrics: self.metrics(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let current = *self.current.lock();
        f.debug_struct("Device")
            .field("state", &current.state)
            .field("mode", &current.mode)
            .field("capacity", &self.capacity())
            .field("gate", &*self.gate)
            .finish_non_exhaustive()
    }
}
