//! Shared unit-test fixtures.

use parking_lot::Mutex;
use std::sync::Arc;
use vbd_block::{BackingStore, BlockRequest};
use vbd_error::{IoStatus, VbdError};
use vbd_types::{Sector, SectorCount};

/// Records every completion delivered to callbacks built from it.
#[derive(Clone, Default)]
pub(crate) struct Outcome {
    inner: Arc<Mutex<Vec<(IoStatus, Vec<u8>)>>>,
}

impl Outcome {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn callback(&self) -> impl FnOnce(IoStatus, Vec<u8>) + Send + 'static {
        let inner = Arc::clone(&self.inner);
        move |status, buf| inner.lock().push((status, buf))
    }

    pub(crate) fn count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Success flag of every completion so far, in arrival order.
    pub(crate) fn successes(&self) -> Vec<bool> {
        self.inner.lock().iter().map(|(status, _)| status.is_ok()).collect()
    }

    fn take_one(&self) -> (IoStatus, Vec<u8>) {
        let mut done = self.inner.lock();
        assert_eq!(done.len(), 1, "expected exactly one completion");
        done.remove(0)
    }

    pub(crate) fn assert_ok(&self) {
        let (status, _) = self.take_one();
        status.expect("request should succeed");
    }

    pub(crate) fn take_ok(&self) -> Vec<u8> {
        let (status, buf) = self.take_one();
        status.expect("request should succeed");
        buf
    }

    pub(crate) fn take_err(&self) -> VbdError {
        let (status, _) = self.take_one();
        status.expect_err("request should fail")
    }
}

pub(crate) fn read(start: Sector, sectors: u32, outcome: &Outcome) -> BlockRequest {
    BlockRequest::read(start, sectors, outcome.callback()).expect("read request")
}

pub(crate) fn write(start: Sector, data: Vec<u8>, outcome: &Outcome) -> BlockRequest {
    BlockRequest::write(start, data, outcome.callback()).expect("write request")
}

/// Store that parks every submitted request until the test completes it.
pub(crate) struct DeferredStore {
    capacity: SectorCount,
    queue: Mutex<Vec<BlockRequest>>,
}

impl DeferredStore {
    pub(crate) fn new(capacity: SectorCount) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            queue: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn take_all(&self) -> Vec<BlockRequest> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Complete every parked request with `status_for(index)`.
    pub(crate) fn complete_all(&self, status_for: impl Fn(usize) -> IoStatus) {
        for (index, request) in self.take_all().into_iter().enumerate() {
            request.complete(status_for(index));
        }
    }
}

impl BackingStore for DeferredStore {
    fn capacity(&self) -> SectorCount {
        self.capacity
    }

    fn submit(&self, request: BlockRequest) {
        self.queue.lock().push(request);
    }

    fn name(&self) -> &'static str {
        "deferred"
    }
}
