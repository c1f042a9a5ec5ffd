//! Header state shared between the store and its worker

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::region::RegionHandle;
use crate::store::format::{self, CachePaths};
use crate::store::header::{self, HeaderIndex, RegionCacheRecord};

/// Mutable header bookkeeping guarded by [`StoreState::lock`]
#[derive(Debug)]
pub(crate) struct HeaderState {
    pub index: HeaderIndex,
    pub read_only: bool,
}

/// Everything a job needs to touch the cache directory
#[derive(Debug)]
pub(crate) struct StoreState {
    pub paths: CachePaths,
    header: Mutex<HeaderState>,
}

impl StoreState {
    pub fn new(paths: CachePaths, capacity: u32) -> Self {
        Self {
            paths,
            header: Mutex::new(HeaderState {
                index: HeaderIndex::new(capacity),
                read_only: false,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, HeaderState> {
        // A panicking holder leaves plain data behind
        self.header.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget a region: drop its record, delete its files and blank its slot.
    pub fn remove_entry(&self, handle: RegionHandle) -> bool {
        let mut state = self.lock();
        if state.read_only {
            log::info!("Not removing cache for region {}: cache is read-only", handle);
            return false;
        }
        let Some(record) = state.index.remove(handle) else {
            return false;
        };
        self.discard_files(record.handle);
        self.persist_slot(&mut state, &RegionCacheRecord::empty(record.slot_index));
        true
    }

    /// Delete the files of evicted records and blank their slots
    pub fn discard_evicted(&self, state: &mut HeaderState, evicted: &[RegionCacheRecord]) {
        for record in evicted {
            log::info!("Evicting region {} from the object cache", record.handle);
            self.discard_files(record.handle);
            self.persist_slot(state, &RegionCacheRecord::empty(record.slot_index));
        }
    }

    /// Write one slot; on failure the store goes read-only.
    pub fn persist_slot(&self, state: &mut HeaderState, record: &RegionCacheRecord) -> bool {
        if state.read_only {
            return false;
        }
        match header::write_slot(&self.paths.header(), record) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to update object cache header slot {}: {}", record.slot_index, e);
                self.fail_read_only(state);
                false
            }
        }
    }

    /// Rewrite the whole header; on failure the store goes read-only.
    pub fn persist_header(&self, state: &mut HeaderState) -> bool {
        match header::write_header(&self.paths.header(), &state.index) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to write object cache header {}: {}", self.paths.header().display(), e);
                self.fail_read_only(state);
                false
            }
        }
    }

    fn fail_read_only(&self, state: &mut HeaderState) {
        log::warn!("Object cache switched to read-only mode");
        state.index.clear();
        state.read_only = true;
    }

    fn discard_files(&self, handle: RegionHandle) {
        for path in [self.paths.entries(handle), self.paths.extras(handle)] {
            if let Err(e) = format::remove_if_exists(&path) {
                log::warn!("Failed to remove cache file {}: {}", path.display(), e);
            }
        }
    }
}
