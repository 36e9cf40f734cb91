//! In-memory backing stores (for testing and benchmarking).
//!
//! [`MemBackingStore`] completes every request synchronously on the
//! submitting thread and supports fault injection. [`MemStoreResolver`]
//! maps names to registered stores and counts open handles so callers can
//! assert that nothing leaks.

use crate::{Access, BackingStore, BlockRequest, StoreHandle, StoreResolver};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use vbd_error::{Result, VbdError};
use vbd_types::{Direction, SectorCount};

/// RAM-backed store.
pub struct MemBackingStore {
    capacity: SectorCount,
    data: Mutex<Vec<u8>>,
    failing: AtomicBool,
    submitted: AtomicU64,
}

impl MemBackingStore {
    pub fn new(capacity: SectorCount) -> Result<Self> {
        let len = capacity
            .bytes()
            .and_then(|b| usize::try_from(b).ok())
            .ok_or_else(|| VbdError::OutOfMemory(format!("store of {capacity} overflows")))?;
        Ok(Self {
            capacity,
            data: Mutex::new(vec![0_u8; len]),
            failing: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
        })
    }

    /// While set, every request completes with `IoFailure`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Requests submitted so far (including failed ones).
    #[must_use]
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Copy `len` bytes at byte `offset` out of the store.
    #[must_use]
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        let data = self.data.lock();
        let end = offset.saturating_add(len).min(data.len());
        let start = offset.min(end);
        data[start..end].to_vec()
    }
}

impl BackingStore for MemBackingStore {
    fn capacity(&self) -> SectorCount {
        self.capacity
    }

    fn submit(&self, mut request: BlockRequest) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            request.fail(VbdError::IoFailure("injected store failure".to_owned()));
            return;
        }
        if !request.fits_within(self.capacity) {
            let detail = format!(
                "request start={} len={} beyond store capacity {}",
                request.start(),
                request.len_sectors(),
                self.capacity
            );
            request.fail(VbdError::IoFailure(detail));
            return;
        }
        let Some(start) = request
            .start()
            .byte_offset()
            .and_then(|b| usize::try_from(b).ok())
        else {
            request.fail(VbdError::IoFailure("request offset overflows usize".to_owned()));
            return;
        };
        let end = start + request.len_bytes();

        let mut data = self.data.lock();
        match request.direction() {
            Direction::Read => request.buf_mut().copy_from_slice(&data[start..end]),
            Direction::Write => data[start..end].copy_from_slice(request.buf()),
        }
        drop(data);
        request.complete(Ok(()));
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBackingStore")
            .field("capacity", &self.capacity)
            .field("failing", &self.failing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Resolves names registered with [`MemStoreResolver::insert`] or
/// [`MemStoreResolver::register`].
#[derive(Default)]
pub struct MemStoreResolver {
    stores: Mutex<HashMap<String, Arc<dyn BackingStore>>>,
    open: Arc<AtomicUsize>,
}

impl std::fmt::Debug for MemStoreResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStoreResolver")
            .field("stores", &self.stores.lock().len())
            .field("open", &self.open_handles())
            .finish()
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemStoreResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh zeroed store of `capacity` under `name`.
    pub fn insert(&self, name: &str, capacity: SectorCount) -> Result<Arc<MemBackingStore>> {
        let store = Arc::new(MemBackingStore::new(capacity)?);
        self.register(name, Arc::clone(&store) as Arc<dyn BackingStore>);
        Ok(store)
    }

    /// Register an arbitrary store under `name`, replacing any previous one.
    pub fn register(&self, name: &str, store: Arc<dyn BackingStore>) {
        self.stores.lock().insert(name.to_owned(), store);
    }

    /// Forget `name`; handles already resolved keep working.
    pub fn remove(&self, name: &str) -> bool {
        self.stores.lock().remove(name).is_some()
    }

    /// Handles resolved and not yet released.
    #[must_use]
    pub fn open_handles(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

impl StoreResolver for MemStoreResolver {
    fn resolve(&self, path: &str, _access: Access) -> Result<StoreHandle> {
        let name = path.trim();
        let store = self.stores.lock().get(name).cloned().ok_or_else(|| {
            VbdError::BackingStoreUnavailable {
                path: name.to_owned(),
                detail: "no such memory store".to_owned(),
            }
        })?;
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(StoreHandle::new(name, store).with_claim(OpenGuard(Arc::clone(&self.open))))
    }
}
