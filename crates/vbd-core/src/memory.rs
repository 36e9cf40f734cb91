//! Memory backend: the whole device lives in one zeroed buffer.

use crate::backend::Backend;
use parking_lot::Mutex;
use tracing::{debug, trace};
use vbd_block::BlockRequest;
use vbd_error::{Result, VbdError};
use vbd_types::{BackendMode, Direction, SECTOR_SIZE, SectorCount};

/// RAM-backed device. Every request takes one lock over the whole buffer and
/// completes before `handle_request` returns.
pub struct MemoryBackend {
    capacity: SectorCount,
    data: Option<Mutex<Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            capacity: SectorCount::ZERO,
            data: None,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> SectorCount {
        self.capacity
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_zeroed(capacity: SectorCount) -> Result<Vec<u8>> {
    let len = capacity
        .bytes()
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(|| {
            VbdError::OutOfMemory(format!("{capacity} does not fit in the address space"))
        })?;
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|err| {
        VbdError::OutOfMemory(format!("allocating {len} byte memory backend: {err}"))
    })?;
    data.resize(len, 0);
    Ok(data)
}

impl Backend for MemoryBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Memory
    }

    fn initialize(&mut self, capacity: SectorCount) -> Result<()> {
        if self.data.is_some() {
            return Err(VbdError::InvalidConfiguration(
                "memory backend is already initialized".to_owned(),
            ));
        }
        let data = allocate_zeroed(capacity)?;
        debug!(capacity_sectors = capacity.0, bytes = data.len(), "memory backend allocated");
        self.capacity = capacity;
        self.data = Some(Mutex::new(data));
        Ok(())
    }

    fn handle_request(&self, mut request: BlockRequest) {
        let Some(data) = &self.data else {
            request.fail(VbdError::IoFailure(
                "memory backend is not initialized".to_owned(),
            ));
            return;
        };
        let start = request.start();
        if start.0 >= self.capacity.0 {
            request.fail(VbdError::IoFailure(format!(
                "sector {start} is beyond capacity {}",
                self.capacity
            )));
            return;
        }

        // Partially out-of-range transfers are clipped to the device end.
        let available = self.capacity.0 - start.0;
        let sectors = u64::from(request.len_sectors()).min(available);
        #[expect(clippy::cast_possible_truncation)] // start < capacity, which was allocated
        let offset = (start.0 as usize) * SECTOR_SIZE;
        #[expect(clippy::cast_possible_truncation)] // at most len_sectors, a u32
        let len = (sectors as usize) * SECTOR_SIZE;
        let direction = request.direction();

        let mut data = data.lock();
        match direction {
            Direction::Read => {
                request.buf_mut()[..len].copy_from_slice(&data[offset..offset + len]);
            }
            Direction::Write => {
                data[offset..offset + len].copy_from_slice(&request.buf()[..len]);
            }
        }
        drop(data);

        trace!(start = start.0, sectors, ?direction, "memory transfer");
        request.complete(Ok(()));
    }

    fn shutdown(&mut self) {
        if self.data.take().is_some() {
            debug!(capacity_sectors = self.capacity.0, "memory backend released");
        }
        self.capacity = SectorCount::ZERO;
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("capacity", &self.capacity)
            .field("initialized", &self.data.is_some())
            .finish_non_exhaustive()
    }
}
