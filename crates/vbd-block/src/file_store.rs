//! File-backed backing stores.
//!
//! [`FileBackingStore`] services requests with positional I/O
//! (`pread`/`pwrite` via `std::os::unix::fs::FileExt`) on a dedicated
//! completion worker, so completions arrive on a thread other than the
//! submitter's, the way a real block device completes from its own
//! interrupt context. Works for regular image files and block device nodes.
//!
//! [`FileStoreResolver`] opens paths for the Proxy and Mirror backends and
//! tracks exclusive claims.

use crate::{Access, BackingStore, BlockRequest, StoreHandle, StoreResolver};
use crossbeam_channel::{Sender, unbounded};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, trace, warn};
use vbd_error::{Result, VbdError};
use vbd_types::{Direction, SectorCount};

/// Per-store I/O statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Reads completed successfully.
    pub reads: u64,
    /// Writes completed successfully.
    pub writes: u64,
    /// Total bytes read.
    pub bytes_read: u64,
    /// Total bytes written.
    pub bytes_written: u64,
    /// Requests completed with an error.
    pub errors: u64,
}

/// Positional-I/O store with its own completion worker.
pub struct FileBackingStore {
    path: PathBuf,
    capacity: SectorCount,
    tx: Option<Sender<BlockRequest>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<Mutex<StoreStats>>,
}

impl FileBackingStore {
    /// Open `path` read-write and start its completion worker.
    ///
    /// Capacity is the file (or device) length in whole sectors; a trailing
    /// partial sector is not addressable.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        // Block device nodes report a zero metadata length; seeking to the
        // end works for both devices and regular files.
        let len = file.seek(SeekFrom::End(0))?;
        let capacity = SectorCount::from_bytes(len);
        let file = Arc::new(file);
        let stats = Arc::new(Mutex::new(StoreStats::default()));

        let (tx, rx) = unbounded::<BlockRequest>();
        let worker_file = Arc::clone(&file);
        let worker_stats = Arc::clone(&stats);
        let worker = std::thread::Builder::new()
            .name(format!("vbd-store:{}", path.display()))
            .spawn(move || {
                for request in rx {
                    execute(&worker_file, capacity, &worker_stats, request);
                }
            })?;

        Ok(Self {
            path: path.to_owned(),
            capacity,
            tx: Some(tx),
            worker: Some(worker),
            stats,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }
}

fn execute(
    file: &File,
    capacity: SectorCount,
    stats: &Mutex<StoreStats>,
    mut request: BlockRequest,
) {
    if !request.fits_within(capacity) {
        stats.lock().errors += 1;
        let detail = format!(
            "request start={} len={} beyond store capacity {}",
            request.start(),
            request.len_sectors(),
            capacity
        );
        request.fail(VbdError::IoFailure(detail));
        return;
    }
    let Some(offset) = request.start().byte_offset() else {
        stats.lock().errors += 1;
        request.fail(VbdError::IoFailure("request offset overflows u64".to_owned()));
        return;
    };

    let direction = request.direction();
    let result = match direction {
        Direction::Read => file.read_exact_at(request.buf_mut(), offset),
        Direction::Write => file.write_all_at(request.buf(), offset),
    };
    let bytes = request.len_bytes() as u64;

    match result {
        Ok(()) => {
            let mut s = stats.lock();
            match direction {
                Direction::Read => {
                    s.reads += 1;
                    s.bytes_read += bytes;
                }
                Direction::Write => {
                    s.writes += 1;
                    s.bytes_written += bytes;
                }
            }
            drop(s);
            trace!(start = request.start().0, bytes, ?direction, "store I/O complete");
            request.complete(Ok(()));
        }
        Err(err) => {
            stats.lock().errors += 1;
            request.fail(VbdError::Io(err));
        }
    }
}

impl BackingStore for FileBackingStore {
    fn capacity(&self) -> SectorCount {
        self.capacity
    }

    fn submit(&self, request: BlockRequest) {
        match &self.tx {
            Some(tx) => {
                if let Err(err) = tx.send(request) {
                    err.into_inner()
                        .fail(VbdError::IoFailure("store worker has exited".to_owned()));
                }
            }
            None => request.fail(VbdError::IoFailure("store is closed".to_owned())),
        }
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

impl Drop for FileBackingStore {
    fn drop(&mut self) {
        // Closing the channel lets the worker finish queued requests and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!(path = %self.path.display(), "store worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for FileBackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackingStore")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .field("stats", &*self.stats.lock())
            .finish_non_exhaustive()
    }
}

/// Resolves filesystem paths into [`FileBackingStore`]s.
///
/// Exclusive claims are tracked per canonical path; a second exclusive
/// resolve of the same path fails until the first handle is released.
#[derive(Debug, Clone, Default)]
pub struct FileStoreResolver {
    claims: Arc<Mutex<HashSet<PathBuf>>>,
}

impl FileStoreResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of paths currently claimed exclusively.
    #[must_use]
    pub fn exclusive_claims(&self) -> usize {
        self.claims.lock().len()
    }

    fn claim(&self, path: &str, key: PathBuf) -> Result<ExclusiveClaim> {
        let mut claims = self.claims.lock();
        if !claims.insert(key.clone()) {
            return Err(VbdError::BackingStoreUnavailable {
                path: path.to_owned(),
                detail: "already claimed exclusively".to_owned(),
            });
        }
        drop(claims);
        Ok(ExclusiveClaim {
            claims: Arc::clone(&self.claims),
            key,
        })
    }
}

struct ExclusiveClaim {
    claims: Arc<Mutex<HashSet<PathBuf>>>,
    key: PathBuf,
}

impl Drop for ExclusiveClaim {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.key);
    }
}

impl StoreResolver for FileStoreResolver {
    fn resolve(&self, path: &str, access: Access) -> Result<StoreHandle> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(VbdError::InvalidConfiguration(
                "backing store path is empty".to_owned(),
            ));
        }

        let store = FileBackingStore::open(Path::new(trimmed)).map_err(|err| {
            warn!(path = trimmed, error = %err, "failed to acquire backing store");
            VbdError::BackingStoreUnavailable {
                path: trimmed.to_owned(),
                detail: err.to_string(),
            }
        })?;

        let claim = if access.is_exclusive() {
            let key = std::fs::canonicalize(trimmed).unwrap_or_else(|_| PathBuf::from(trimmed));
            Some(self.claim(trimmed, key)?)
        } else {
            None
        };

        info!(
            path = trimmed,
            capacity_sectors = store.capacity().0,
            ?access,
            "backing store resolved"
        );
        let handle = StoreHandle::new(trimmed, Arc::new(store));
        Ok(match claim {
            Some(claim) => handle.with_claim(claim),
            None => handle,
        })
    }
}
