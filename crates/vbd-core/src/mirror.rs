//! Mirror backend (RAID1).
//!
//! Writes fan out to every leg and the original request completes only after
//! all legs have reported, failing if any leg failed. Reads are served by
//! leg 0. There is no read balancing and no resynchronization after a leg
//! fails.
//!
//! ```text
//!                 ┌── clone ──▶ leg 0 ──┐
//!  write ──▶ Join ├── clone ──▶ leg 1 ──┤──▶ last completer finishes original
//!                 └── clone ──▶ leg N ──┘
//! ```

use crate::backend::Backend;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, trace, warn};
use vbd_block::{Access, BlockRequest, StoreHandle, StoreResolver};
use vbd_error::{IoStatus, Result, VbdError};
use vbd_types::{BackendMode, Direction, MAX_MIRRORS, SectorCount};

pub struct MirrorBackend {
    paths: Vec<String>,
    resolver: Arc<dyn StoreResolver>,
    capacity: SectorCount,
    legs: Vec<StoreHandle>,
    /// Leg whose write clone is made to fail.
    #[cfg(test)]
    fail_clone_for: Option<usize>,
}

impl MirrorBackend {
    #[must_use]
    pub fn new(paths: Vec<String>, resolver: Arc<dyn StoreResolver>) -> Self {
        Self {
            paths,
            resolver,
            capacity: SectorCount::ZERO,
            legs: Vec::new(),
            #[cfg(test)]
            fail_clone_for: None,
        }
    }

    /// Number of resolved legs (zero until initialized).
    #[must_use]
    pub fn leg_count(&self) -> usize {
        self.legs.len()
    }

    fn open_leg(&self, path: &str, capacity: SectorCount) -> Result<StoreHandle> {
        let handle = self.resolver.resolve(path, Access::ReadWriteExclusive)?;
        handle.ensure_capacity(capacity)?;
        Ok(handle)
    }

    fn fan_out(&self, request: BlockRequest) {
        let join = Arc::new(JoinContext::new(request, self.legs.len()));
        for (index, leg) in self.legs.iter().enumerate() {
            match self.leg_request(&join, index) {
                Ok(clone) => leg.submit(clone),
                // Accounted exactly like a leg that completed with an error.
                Err(err) => join.leg_done(index, Err(err)),
            }
        }
    }

    #[cfg_attr(not(test), allow(clippy::unused_self))]
    fn leg_request(&self, join: &Arc<JoinContext>, index: usize) -> Result<BlockRequest> {
        #[cfg(test)]
        if self.fail_clone_for == Some(index) {
            return Err(VbdError::OutOfMemory(format!("clone for leg {index}")));
        }
        join.clone_leg(index)
    }
}

impl Backend for MirrorBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Mirror
    }

    fn initialize(&mut self, capacity: SectorCount) -> Result<()> {
        if !self.legs.is_empty() {
            return Err(VbdError::InvalidConfiguration(
                "mirror backend is already initialized".to_owned(),
            ));
        }
        if self.paths.is_empty() {
            return Err(VbdError::InvalidConfiguration(
                "no mirror backing stores configured".to_owned(),
            ));
        }
        if self.paths.len() > MAX_MIRRORS {
            return Err(VbdError::InvalidConfiguration(format!(
                "{} mirror paths configured, at most {MAX_MIRRORS} are supported",
                self.paths.len()
            )));
        }

        // Handles live here until every leg resolved; an early return drops
        // (and so releases) the ones already opened.
        let mut legs = Vec::with_capacity(self.paths.len());
        for (index, path) in self.paths.iter().enumerate() {
            match self.open_leg(path, capacity) {
                Ok(handle) => {
                    debug!(index, path = %handle.path(), "mirror leg resolved");
                    legs.push(handle);
                }
                Err(err) => {
                    warn!(
                        index,
                        path = %path,
                        releasing = legs.len(),
                        error = %err,
                        "mirror initialization failed"
                    );
                    return Err(err);
                }
            }
        }

        info!(
            legs = legs.len(),
            capacity_sectors = capacity.0,
            "mirror backend attached"
        );
        self.capacity = capacity;
        self.legs = legs;
        Ok(())
    }

    fn handle_request(&self, request: BlockRequest) {
        let Some(primary) = self.legs.first() else {
            request.fail(VbdError::IoFailure(
                "mirror backend is not initialized".to_owned(),
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
        match request.direction() {
            Direction::Read => {
                let start = request.start().0;
                primary.submit(request.chain(move |status| {
                    if let Err(err) = status {
                        warn!(start, error = %err, "mirror read failed on primary");
                    }
                }));
            }
            Direction::Write => self.fan_out(request),
        }
    }

    fn shutdown(&mut self) {
        let legs = std::mem::take(&mut self.legs);
        if !legs.is_empty() {
            debug!(legs = legs.len(), "releasing mirror legs");
        }
        for leg in legs {
            leg.release();
        }
        self.capacity = SectorCount::ZERO;
    }
}

impl std::fmt::Debug for MirrorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorBackend")
            .field("paths", &self.paths)
            .field("capacity", &self.capacity)
            .field("legs", &self.legs.len())
            .finish_non_exhaustive()
    }
}

// ── Write join ──────────────────────────────────────────────────────────────

/// Per-write state shared by the leg completions.
///
/// The original request stays parked here until `remaining` reaches zero;
/// whichever leg performs that final decrement takes it out and completes
/// it. Each leg holds one `Arc`, so the context goes away with the last leg.
struct JoinContext {
    original: Mutex<Option<BlockRequest>>,
    legs: usize,
    remaining: AtomicUsize,
    failed: AtomicUsize,
    first_error: Mutex<Option<VbdError>>,
}

impl JoinContext {
    fn new(original: BlockRequest, legs: usize) -> Self {
        Self {
            original: Mutex::new(Some(original)),
            legs,
            remaining: AtomicUsize::new(legs),
            failed: AtomicUsize::new(0),
            first_error: Mutex::new(None),
        }
    }

    /// Copy the parked original into a request for leg `index`.
    fn clone_leg(self: &Arc<Self>, index: usize) -> Result<BlockRequest> {
        let original = self.original.lock();
        let Some(original) = original.as_ref() else {
            return Err(VbdError::IoFailure(
                "mirror write finished before all legs were submitted".to_owned(),
            ));
        };
        let join = Arc::clone(self);
        original.try_clone_with(move |status, _buf| join.leg_done(index, status))
    }

    fn leg_done(&self, index: usize, status: IoStatus) {
        if let Err(err) = status {
            warn!(leg = index, error = %err, "mirror leg failed");
            self.failed.fetch_add(1, Ordering::AcqRel);
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let Some(original) = self.original.lock().take() else {
            return;
        };
        let failed = self.failed.load(Ordering::Acquire);
        if failed == 0 {
            trace!(start = original.start().0, legs = self.legs, "mirror write joined");
            original.complete(Ok(()));
            return;
        }
        let cause = self
            .first_error
            .lock()
            .take()
            .map_or_else(String::new, |err| format!(": {err}"));
        original.fail(VbdError::IoFailure(format!(
            "{failed} of {} mirror legs failed{cause}",
            self.legs
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{DeferredStore, Outcome, read, write};
    use proptest::prelude::*;
    use vbd_block::{BackingStore, MemBackingStore, MemStoreResolver};
    use vbd_types::{MIB_SECTORS, SECTOR_SIZE, Sector};

    fn mirror(resolver: &Arc<MemStoreResolver>, paths: &[&str]) -> MirrorBackend {
        MirrorBackend::new(
            paths.iter().map(|p| (*p).to_owned()).collect(),
            Arc::clone(resolver) as Arc<dyn StoreResolver>,
        )
    }

    fn mem_legs(resolver: &MemStoreResolver, names: &[&str], sectors: u64) -> Vec<Arc<MemBackingStore>> {
        names
            .iter()
            .map(|name| resolver.insert(name, SectorCount(sectors)).expect("insert"))
            .collect()
    }

    fn deferred_legs(resolver: &MemStoreResolver, count: usize) -> (Vec<String>, Vec<Arc<DeferredStore>>) {
        (0..count)
            .map(|i| {
                let name = format!("leg{i}");
                let store = DeferredStore::new(SectorCount(64));
                resolver.register(&name, Arc::clone(&store) as Arc<dyn BackingStore>);
                (name, store)
            })
            .unzip()
    }

    #[test]
    fn write_reaches_every_leg_and_read_uses_primary() {
        let resolver = Arc::new(MemStoreResolver::new());
        let legs = mem_legs(&resolver, &["a", "b", "c"], 16);
        let mut backend = mirror(&resolver, &["a", "b", "c"]);
        backend.initialize(SectorCount(16)).expect("initialize");
        assert_eq!(backend.leg_count(), 3);

        let done = Outcome::new();
        backend.handle_request(write(Sector(5), vec![0x77; SECTOR_SIZE], &done));
        done.assert_ok();
        for leg in &legs {
            assert_eq!(leg.snapshot(5 * SECTOR_SIZE, SECTOR_SIZE), vec![0x77; SECTOR_SIZE]);
        }

        let got = Outcome::new();
        backend.handle_request(read(Sector(5), 1, &got));
        assert_eq!(got.take_ok(), vec![0x77; SECTOR_SIZE]);
        let submitted: Vec<u64> = legs.iter().map(|leg| leg.submitted()).collect();
        assert_eq!(submitted, vec![2, 1, 1]);
    }

    #[test]
    fn write_completes_only_after_both_legs() {
        let resolver = Arc::new(MemStoreResolver::new());
        let (names, stores) = deferred_legs(&resolver, 2);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut backend = mirror(&resolver, &names);
        backend.initialize(SectorCount(64)).expect("initialize");

        let done = Outcome::new();
        backend.handle_request(write(Sector(0), vec![1; SECTOR_SIZE], &done));
        assert_eq!(stores[0].pending(), 1);
        assert_eq!(stores[1].pending(), 1);

        stores[1].complete_all(|_| Ok(()));
        assert_eq!(done.count(), 0);
        stores[0].complete_all(|_| Ok(()));
        done.assert_ok();
    }

    #[test]
    fn one_failed_leg_fails_the_write() {
        let resolver = Arc::new(MemStoreResolver::new());
        let legs = mem_legs(&resolver, &["a", "b", "c"], 8);
        legs[1].set_failing(true);
        let mut backend = mirror(&resolver, &["a", "b", "c"]);
        backend.initialize(SectorCount(8)).expect("initialize");

        let done = Outcome::new();
        backend.handle_request(write(Sector(0), vec![2; SECTOR_SIZE], &done));
        let err = done.take_err();
        assert!(matches!(err, VbdError::IoFailure(_)));
        assert!(err.to_string().contains("1 of 3"), "{err}");
        // Healthy legs still received the data.
        assert_eq!(legs[0].snapshot(0, 1), vec![2]);
        assert_eq!(legs[2].snapshot(0, 1), vec![2]);
        assert!(legs.iter().all(|leg| leg.submitted() == 1));
    }

    #[test]
    fn read_failure_on_primary_propagates() {
        let resolver = Arc::new(MemStoreResolver::new());
        let legs = mem_legs(&resolver, &["a", "b"], 8);
        legs[0].set_failing(true);
        let mut backend = mirror(&resolver, &["a", "b"]);
        backend.initialize(SectorCount(8)).expect("initialize");

        let got = Outcome::new();
        backend.handle_request(read(Sector(0), 1, &got));
        assert!(got.take_err().to_string().contains("injected"));
        assert_eq!(legs[1].submitted(), 0);
    }

    #[test]
    fn write_past_device_end_reaches_no_leg() {
        let resolver = Arc::new(MemStoreResolver::new());
        let legs = mem_legs(&resolver, &["a", "b"], 64);
        let mut backend = mirror(&resolver, &["a", "b"]);
        backend.initialize(SectorCount(8)).expect("initialize");

        let done = Outcome::new();
        backend.handle_request(write(Sector(7), vec![5; 2 * SECTOR_SIZE], &done));
        let err = done.take_err();
        assert!(err.to_string().contains("sector 7 for 2 sectors"), "{err}");
        assert!(legs.iter().all(|leg| leg.submitted() == 0));
    }

    #[test]
    fn unreachable_second_store_releases_first() {
        let resolver = Arc::new(MemStoreResolver::new());
        mem_legs(&resolver, &["one"], 100 * MIB_SECTORS);
        let mut backend = mirror(&resolver, &["one", "two"]);
        let err = backend
            .initialize(SectorCount(100 * MIB_SECTORS))
            .expect_err("second store missing");
        assert!(matches!(err, VbdError::BackingStoreUnavailable { .. }));
        assert_eq!(resolver.open_handles(), 0);
        assert_eq!(backend.leg_count(), 0);

        let got = Outcome::new();
        backend.handle_request(read(Sector(0), 1, &got));
        assert!(matches!(got.take_err(), VbdError::IoFailure(_)));
    }

    #[test]
    fn small_leg_rejects_whole_set() {
        let resolver = Arc::new(MemStoreResolver::new());
        resolver.insert("big", SectorCount(64)).expect("insert");
        resolver.insert("small", SectorCount(32)).expect("insert");
        resolver.insert("big2", SectorCount(64)).expect("insert");
        let mut backend = mirror(&resolver, &["big", "small", "big2"]);
        let err = backend
            .initialize(SectorCount(64))
            .expect_err("small leg");
        assert!(matches!(
            err,
            VbdError::BackingStoreTooSmall {
                capacity: 32,
                required: 64,
                ..
            }
        ));
        assert_eq!(resolver.open_handles(), 0);
    }

    #[test]
    fn configuration_limits() {
        let resolver = Arc::new(MemStoreResolver::new());
        let mut empty = mirror(&resolver, &[]);
        assert!(matches!(
            empty.initialize(SectorCount(1)),
            Err(VbdError::InvalidConfiguration(_))
        ));

        let names: Vec<String> = (0..=MAX_MIRRORS).map(|i| format!("m{i}")).collect();
        let mut too_many = MirrorBackend::new(names, Arc::clone(&resolver) as Arc<dyn StoreResolver>);
        assert!(matches!(
            too_many.initialize(SectorCount(1)),
            Err(VbdError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn shutdown_releases_all_legs() {
        let resolver = Arc::new(MemStoreResolver::new());
        mem_legs(&resolver, &["a", "b"], 8);
        let mut backend = mirror(&resolver, &["a", "b"]);
        backend.initialize(SectorCount(8)).expect("initialize");
        assert_eq!(resolver.open_handles(), 2);
        assert!(backend.initialize(SectorCount(8)).is_err());
        assert_eq!(resolver.open_handles(), 2);
        backend.shutdown();
        assert_eq!(resolver.open_handles(), 0);
        backend.initialize(SectorCount(8)).expect("reinitialize");
        assert_eq!(backend.leg_count(), 2);
    }

    #[test]
    fn dropped_leg_request_still_joins() {
        let resolver = Arc::new(MemStoreResolver::new());
        let (names, stores) = deferred_legs(&resolver, 2);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut backend = mirror(&resolver, &names);
        backend.initialize(SectorCount(64)).expect("initialize");

        let done = Outcome::new();
        backend.handle_request(write(Sector(0), vec![3; SECTOR_SIZE], &done));
        stores[0].complete_all(|_| Ok(()));
        drop(stores[1].take_all());
        assert!(matches!(done.take_err(), VbdError::IoFailure(_)));
    }

    #[test]
    fn failed_write_clone_completes_after_remaining_legs() {
        let resolver = Arc::new(MemStoreResolver::new());
        let (names, stores) = deferred_legs(&resolver, 3);
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut backend = mirror(&resolver, &names);
        backend.initialize(SectorCount(64)).expect("initialize");
        backend.fail_clone_for = Some(1);

        let done = Outcome::new();
        backend.handle_request(write(Sector(2), vec![4; SECTOR_SIZE], &done));
        let pending: Vec<usize> = stores.iter().map(|store| store.pending()).collect();
        assert_eq!(pending, vec![1, 0, 1]);

        stores[0].complete_all(|_| Ok(()));
        assert_eq!(done.count(), 0);
        stores[2].complete_all(|_| Ok(()));
        let err = done.take_err();
        assert!(matches!(err, VbdError::IoFailure(_)));
        assert!(err.to_string().contains("1 of 3"), "{err}");
        assert!(err.to_string().contains("out of memory"), "{err}");
        assert_eq!(done.count(), 0);
    }

    #[test]
    fn join_context_counts_failed_clone_as_error_leg() {
        let done = Outcome::new();
        let join = Arc::new(JoinContext::new(write(Sector(0), vec![0; SECTOR_SIZE], &done), 3));
        let first = join.clone_leg(0).expect("clone");
        join.leg_done(1, Err(VbdError::OutOfMemory("clone".to_owned())));
        let third = join.clone_leg(2).expect("clone");
        assert_eq!(done.count(), 0);
        first.complete(Ok(()));
        third.complete(Ok(()));
        let err = done.take_err();
        assert!(err.to_string().contains("1 of 3"), "{err}");
        assert!(err.to_string().contains("out of memory"), "{err}");
    }

    proptest! {
        #[test]
        fn join_completes_once_after_every_leg(
            legs in 1_usize..=MAX_MIRRORS,
            order_seed in proptest::collection::vec(any::<u32>(), MAX_MIRRORS),
            fail_mask in any::<u16>(),
        ) {
            let resolver = Arc::new(MemStoreResolver::new());
            let (names, stores) = deferred_legs(&resolver, legs);
            let names: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut backend = mirror(&resolver, &names);
            backend.initialize(SectorCount(64)).expect("initialize");

            let done = Outcome::new();
            backend.handle_request(write(Sector(1), vec![9; SECTOR_SIZE], &done));

            let mut parked: Vec<(usize, BlockRequest)> = stores
                .iter()
                .enumerate()
                .flat_map(|(i, store)| store.take_all().into_iter().map(move |r| (i, r)))
                .collect();
            prop_assert_eq!(parked.len(), legs);
            parked.sort_by_key(|(i, _)| order_seed[*i]);

            let mut any_failed = false;
            for (completed, (leg, request)) in parked.into_iter().enumerate() {
                prop_assert_eq!(done.count(), 0, "finished after {} of {} legs", completed, legs);
                let fail = fail_mask & (1 << leg) != 0;
                any_failed |= fail;
                request.complete(if fail {
                    Err(VbdError::IoFailure("leg".to_owned()))
                } else {
                    Ok(())
                });
            }
            prop_assert_eq!(done.successes(), vec![!any_failed]);
        }
    }
}
