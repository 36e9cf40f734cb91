#![forbid(unsafe_code)]
//! Block request plumbing and backing store access.
//!
//! Provides [`BlockRequest`], the unit of I/O flowing through the engine,
//! together with the downstream [`BackingStore`] capability and the
//! [`StoreResolver`] contract used to open path-identified stores.
//!
//! # Completion protocol
//!
//! A request owns its completion callback. [`BlockRequest::complete`]
//! consumes the request, so the callback runs at most once by construction.
//! A request that is dropped without being completed reports
//! [`VbdError::IoFailure`] from its `Drop` impl, so it runs at least once as
//! well: no backend can silently lose a request, including on early-return
//! error paths.

pub mod file_store;
pub mod mem_store;

pub use file_store::{FileBackingStore, FileStoreResolver, StoreStats};
pub use mem_store::{MemBackingStore, MemStoreResolver};

use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use vbd_error::{IoStatus, Result, VbdError};
use vbd_types::{Direction, SECTOR_SIZE, Sector, SectorCount};

/// Completion callback: receives the final status and gives the data buffer
/// back to the submitter (filled, for reads).
pub type Completion = Box<dyn FnOnce(IoStatus, Vec<u8>) + Send + 'static>;

/// One read or write against a sector range.
///
/// Invariant: `buf.len()` is a whole number of sectors and the sector count
/// fits in `u32`.
pub struct BlockRequest {
    start: Sector,
    direction: Direction,
    buf: Vec<u8>,
    on_complete: Option<Completion>,
}

fn check_request_len(len_bytes: usize) -> Result<()> {
    if len_bytes % SECTOR_SIZE != 0 {
        return Err(VbdError::InvalidRequest(format!(
            "buffer length {len_bytes} is not a multiple of the {SECTOR_SIZE}-byte sector"
        )));
    }
    u32::try_from(len_bytes / SECTOR_SIZE).map_err(|_| {
        VbdError::InvalidRequest(format!("buffer length {len_bytes} overflows u32 sectors"))
    })?;
    Ok(())
}

impl BlockRequest {
    pub fn new<F>(start: Sector, direction: Direction, buf: Vec<u8>, on_complete: F) -> Result<Self>
    where
        F: FnOnce(IoStatus, Vec<u8>) + Send + 'static,
    {
        check_request_len(buf.len())?;
        Ok(Self {
            start,
            direction,
            buf,
            on_complete: Some(Box::new(on_complete)),
        })
    }

    /// Read `len_sectors` sectors starting at `start` into a fresh zeroed
    /// buffer.
    pub fn read<F>(start: Sector, len_sectors: u32, on_complete: F) -> Result<Self>
    where
        F: FnOnce(IoStatus, Vec<u8>) + Send + 'static,
    {
        let len = usize::try_from(len_sectors)
            .ok()
            .and_then(|n| n.checked_mul(SECTOR_SIZE))
            .ok_or_else(|| {
                VbdError::InvalidRequest(format!("read of {len_sectors} sectors overflows usize"))
            })?;
        Self::new(start, Direction::Read, vec![0_u8; len], on_complete)
    }

    /// Write `data` starting at `start`.
    pub fn write<F>(start: Sector, data: Vec<u8>, on_complete: F) -> Result<Self>
    where
        F: FnOnce(IoStatus, Vec<u8>) + Send + 'static,
    {
        Self::new(start, Direction::Write, data, on_complete)
    }

    #[must_use]
    pub fn start(&self) -> Sector {
        self.start
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)] // checked at construction
    pub fn len_sectors(&self) -> u32 {
        (self.buf.len() / SECTOR_SIZE) as u32
    }

    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.buf.len()
    }

    /// First sector past the request, `None` on overflow.
    #[must_use]
    pub fn end(&self) -> Option<Sector> {
        self.start.checked_add(u64::from(self.len_sectors()))
    }

    /// Whether the whole request lies within `capacity`.
    #[must_use]
    pub fn fits_within(&self, capacity: SectorCount) -> bool {
        self.end().is_some_and(|end| end.0 <= capacity.0)
    }

    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Signal completion. Consumes the request.
    pub fn complete(mut self, status: IoStatus) {
        if let Some(on_complete) = self.on_complete.take() {
            let buf = std::mem::take(&mut self.buf);
            on_complete(status, buf);
        }
    }

    /// Complete with `error`.
    pub fn fail(self, error: VbdError) {
        self.complete(Err(error));
    }

    /// Build a child request that carries this request's buffer.
    ///
    /// When the child completes, `observe` sees its status, the buffer is
    /// handed back, and this request completes with the same status.
    #[must_use]
    pub fn chain<F>(mut self, observe: F) -> Self
    where
        F: FnOnce(&IoStatus) + Send + 'static,
    {
        let buf = std::mem::take(&mut self.buf);
        let start = self.start;
        let direction = self.direction;
        let mut parent = self;
        Self {
            start,
            direction,
            buf,
            on_complete: Some(Box::new(move |status, buf| {
                observe(&status);
                parent.buf = buf;
                parent.complete(status);
            })),
        }
    }

    /// Run `after` once the existing completion callback has returned.
    /// `after` receives whether the request succeeded.
    #[must_use]
    pub fn then<F>(mut self, after: F) -> Self
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let inner = self.on_complete.take();
        self.on_complete = Some(Box::new(move |status: IoStatus, buf| {
            let ok = status.is_ok();
            if let Some(inner) = inner {
                inner(status, buf);
            }
            after(ok);
        }));
        self
    }

    /// Copy this request's range and data into an independent request with
    /// its own completion. Allocation failure is reported as `OutOfMemory`
    /// instead of aborting.
    pub fn try_clone_with<F>(&self, on_complete: F) -> Result<Self>
    where
        F: FnOnce(IoStatus, Vec<u8>) + Send + 'static,
    {
        let mut buf = Vec::new();
        buf.try_reserve_exact(self.buf.len()).map_err(|err| {
            VbdError::OutOfMemory(format!(
                "cloning {} byte request buffer: {err}",
                self.buf.len()
            ))
        })?;
        buf.extend_from_slice(&self.buf);
        Ok(Self {
            start: self.start,
            direction: self.direction,
            buf,
            on_complete: Some(Box::new(on_complete)),
        })
    }
}

impl Drop for BlockRequest {
    fn drop(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            warn!(
                start = self.start.0,
                direction = ?self.direction,
                "request dropped without completion"
            );
            let buf = std::mem::take(&mut self.buf);
            on_complete(
                Err(VbdError::IoFailure(
                    "request dropped without completion".to_owned(),
                )),
                buf,
            );
        }
    }
}

impl fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockRequest")
            .field("start", &self.start)
            .field("direction", &self.direction)
            .field("len_sectors", &self.len_sectors())
            .field("pending", &self.on_complete.is_some())
            .finish()
    }
}

/// Downstream store that services forwarded requests.
pub trait BackingStore: Send + Sync {
    /// Reported capacity.
    fn capacity(&self) -> SectorCount;

    /// Submit a request. The store completes it exactly once, possibly from
    /// a different thread and possibly before `submit` returns.
    fn submit(&self, request: BlockRequest);

    /// Store kind for diagnostics.
    fn name(&self) -> &'static str;
}

/// How a backing store is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared read-write access.
    ReadWrite,
    /// Read-write access that no other exclusive holder may share.
    ReadWriteExclusive,
}

impl Access {
    #[must_use]
    pub fn is_exclusive(self) -> bool {
        matches!(self, Self::ReadWriteExclusive)
    }
}

/// Opens path-identified backing stores.
pub trait StoreResolver: Send + Sync {
    /// Open `path` (surrounding whitespace is ignored) with `access`.
    fn resolve(&self, path: &str, access: Access) -> Result<StoreHandle>;
}

/// A resolved backing store.
///
/// The store is released when the handle is dropped; anything registered
/// with [`StoreHandle::with_claim`] is dropped at the same time.
pub struct StoreHandle {
    path: String,
    capacity: SectorCount,
    store: Arc<dyn BackingStore>,
    claim: Mutex<Option<Box<dyn Any + Send>>>,
}

impl StoreHandle {
    #[must_use]
    pub fn new(path: impl Into<String>, store: Arc<dyn BackingStore>) -> Self {
        Self {
            path: path.into(),
            capacity: store.capacity(),
            store,
            claim: Mutex::new(None),
        }
    }

    /// Attach a guard whose `Drop` undoes the resolver's claim on the store.
    #[must_use]
    pub fn with_claim<C: Any + Send>(self, claim: C) -> Self {
        *self.claim.lock() = Some(Box::new(claim));
        self
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn capacity(&self) -> SectorCount {
        self.capacity
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Forward `request` to the underlying store.
    pub fn submit(&self, request: BlockRequest) {
        self.store.submit(request);
    }

    /// Verify the store can hold `required` sectors.
    pub fn ensure_capacity(&self, required: SectorCount) -> Result<()> {
        if self.capacity < required {
            return Err(VbdError::BackingStoreTooSmall {
                path: self.path.clone(),
                capacity: self.capacity.0,
                required: required.0,
            });
        }
        Ok(())
    }

    /// Release the store explicitly.
    pub fn release(self) {
        debug!(path = %self.path, "releasing backing store");
        drop(self);
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}
