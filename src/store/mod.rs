//! Disk-persisted per-region object cache.
//!
//! [`ObjectCache`] keeps a header of resident regions in least recently
//! written order and one pair of files per region. Reads and writes of the
//! region files can run on a background worker; read results are handed to
//! the caller's callback on the thread that owns the cache, from
//! [`ObjectCache::pump`], [`ObjectCache::flush`] or [`ObjectCache::shutdown`].
//!
//! Queued jobs run one at a time in submission order, so a queued read sees
//! every write queued before it. When only one of reads or writes is
//! threaded, an inline read can overtake a queued write of the same region;
//! ordering across the two modes is up to the caller.

pub mod format;
pub mod header;
mod state;
mod worker;

pub use format::{CachePaths, LoadedEntries, LoadedExtras};
pub use header::{HeaderIndex, HeaderMeta, RegionCacheRecord};
pub use worker::ShutdownToken;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::error::Error;
use crate::core::settings::CacheSettings;
use crate::core::types::Result;
use crate::entry::{CacheEntry, EntryMap, ExtrasMap};
use crate::region::RegionHandle;
use state::StoreState;
use worker::{Job, JobOutput, ReadJob, WriteJob, Worker};

/// Receives the outcome of one read: `None` maps mean a miss.
pub type ReadCallback = Box<dyn FnOnce(RegionHandle, Option<EntryMap>, Option<ExtrasMap>)>;

/// The persistent store
pub struct ObjectCache {
    settings: CacheSettings,
    state: Arc<StoreState>,
    worker: Option<Worker>,
    /// Read callbacks waiting for their job, by ticket
    callbacks: HashMap<u64, (RegionHandle, ReadCallback)>,
    /// Jobs per region handed to the worker and not yet dispatched
    in_flight: HashMap<RegionHandle, usize>,
    next_ticket: u64,
}

impl ObjectCache {
    /// Open (or create) the cache under `<location>/objectcache`.
    ///
    /// Never fails: an unusable directory leaves the store read-only, an
    /// outdated or unreadable header wipes the cache.
    pub fn new(settings: CacheSettings, location: &Path) -> Self {
        let capacity = settings.effective_capacity();
        let state = Arc::new(StoreState::new(
            CachePaths::new(location, &settings.grid_prefix),
            capacity,
        ));

        let mut cache = Self {
            settings,
            state,
            worker: None,
            callbacks: HashMap::new(),
            in_flight: HashMap::new(),
            next_ticket: 0,
        };
        if !cache.settings.disk_cache_enabled {
            log::info!("Object disk cache disabled");
            return cache;
        }

        if let Err(e) = std::fs::create_dir_all(cache.state.paths.dir()) {
            log::warn!(
                "Cannot create object cache directory {}: {}",
                cache.state.paths.dir().display(),
                e
            );
            cache.state.lock().read_only = true;
            return cache;
        }
        load_header(&cache.state, capacity);

        if cache.settings.threaded_reads || cache.settings.threaded_writes {
            match Worker::spawn(Arc::clone(&cache.state)) {
                Ok(worker) => cache.worker = Some(worker),
                Err(e) => log::warn!("Cannot start object cache worker, using synchronous I/O: {}", e),
            }
        }
        log::info!(
            "Object cache opened at {} with capacity {}",
            cache.state.paths.dir().display(),
            capacity
        );
        cache
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.disk_cache_enabled
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn paths(&self) -> &CachePaths {
        &self.state.paths
    }

    /// Resident regions, least recently written first
    pub fn resident_handles(&self) -> Vec<RegionHandle> {
        self.state.lock().index.iter_lru().map(|r| r.handle).collect()
    }

    /// Header record of a resident region
    pub fn record(&self, handle: RegionHandle) -> Option<RegionCacheRecord> {
        self.state.lock().index.get(handle)
    }

    /// Reads whose callback has not run yet
    pub fn pending_reads(&self) -> usize {
        self.callbacks.len()
    }

    /// Load the cached objects of a region.
    ///
    /// `callback` runs exactly once. Misses, disabled reads and synchronous
    /// reads call it before returning; queued reads call it later from
    /// [`pump`](Self::pump), [`flush`](Self::flush) or
    /// [`shutdown`](Self::shutdown).
    pub fn read_from_cache<F>(&mut self, handle: RegionHandle, region_name: &str, cache_id: Uuid, callback: F)
    where
        F: FnOnce(RegionHandle, Option<EntryMap>, Option<ExtrasMap>) + 'static,
    {
        if !self.settings.disk_cache_enabled || !self.settings.allow_reads {
            callback(handle, None, None);
            return;
        }
        if !self.state.lock().index.contains(handle) {
            log::info!("Cache miss for region: {}", region_name);
            callback(handle, None, None);
            return;
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let job = Job::Read(ReadJob {
            ticket,
            handle,
            region_name: region_name.to_string(),
            cache_id,
        });

        // Inline reads reach the same outcome through the worker's NotFound
        // handling. A queued write may still create the file.
        if self.settings.threaded_reads && self.worker.is_some() && !self.in_flight.contains_key(&handle) {
            let path = self.state.paths.entries(handle);
            if !path.exists() {
                log::warn!(
                    "Could not find: {} - Region: {}. Removing entry.",
                    path.display(),
                    region_name
                );
                self.state.remove_entry(handle);
                callback(handle, None, None);
                return;
            }
        }

        match self.submit(job, self.settings.threaded_reads) {
            Ok(()) => {
                self.callbacks.insert(ticket, (handle, Box::new(callback)));
                log::info!("Queued cache read operation for region '{}'", region_name);
            }
            Err(job) => match job.run(&self.state) {
                JobOutput::Read {
                    handle,
                    entries,
                    extras,
                    ..
                } => callback(handle, entries, extras),
                _ => callback(handle, None, None),
            },
        }
    }

    /// Persist the objects of a region, taking ownership of both maps.
    ///
    /// Nothing happens when writes are off, the store is read-only, the map
    /// is empty or `dirty` is false. With `removal_enabled` invalidated
    /// entries are left out, and a map without any valid entry is not
    /// written at all. Returns true when the write ran or was queued.
    #[allow(clippy::too_many_arguments)]
    pub fn write_to_cache(
        &mut self,
        handle: RegionHandle,
        region_name: &str,
        cache_id: Uuid,
        entries: EntryMap,
        dirty: bool,
        extras: ExtrasMap,
        removal_enabled: bool,
    ) -> bool {
        if !self.settings.disk_cache_enabled || !self.settings.allow_writes {
            log::debug!("Not writing object cache for region {}: writes disabled", region_name);
            return false;
        }
        if entries.is_empty() {
            log::debug!("Not writing empty object cache for region {}", region_name);
            return false;
        }
        if removal_enabled && !entries.values().any(CacheEntry::is_valid) {
            log::debug!("Not writing object cache for region {}: no valid entry", region_name);
            return false;
        }
        if !dirty {
            log::debug!("Object cache for region {} unchanged, not writing", region_name);
            return false;
        }

        {
            let mut guard = self.state.lock();
            if guard.read_only {
                log::debug!("Not writing object cache for region {}: cache is read-only", region_name);
                return false;
            }
            let Some(touch) = guard.index.touch(handle, header::now_secs()) else {
                log::warn!("No free object cache header slot for region {}", region_name);
                return false;
            };
            self.state.discard_evicted(&mut guard, &touch.evicted);
            if !self.state.persist_slot(&mut guard, &touch.record) {
                return false;
            }
        }

        let job = Job::Write(WriteJob {
            handle,
            region_name: region_name.to_string(),
            cache_id,
            entries,
            extras,
            removal_enabled,
        });
        match self.submit(job, self.settings.threaded_writes) {
            Ok(()) => log::info!("Queued cache write operation for region '{}'", region_name),
            Err(job) => {
                let output = job.run(&self.state);
                self.dispatch(output);
            }
        }
        true
    }

    /// Drop a region from the cache along with its files
    pub fn remove_entry(&mut self, handle: RegionHandle) -> bool {
        self.state.remove_entry(handle)
    }

    /// Delete every cache file and start over with an empty header
    pub fn remove_cache(&mut self) -> Result<()> {
        wipe(&self.state)
    }

    /// Deliver the results the worker has finished so far. Returns how many
    /// were dispatched.
    pub fn pump(&mut self) -> usize {
        let mut count = 0;
        while let Some(output) = self.worker.as_mut().and_then(Worker::try_recv) {
            self.dispatch(output);
            count += 1;
        }
        count
    }

    /// Block until every queued job has finished and its result has been
    /// dispatched. Must not be called from async code.
    pub fn flush(&mut self) {
        while !self.in_flight.is_empty() {
            let output = match self.worker.as_mut() {
                Some(worker) => worker.recv_blocking(),
                None => None,
            };
            match output {
                Some(output) => self.dispatch(output),
                None => break,
            }
        }
        self.in_flight.clear();
        self.fail_orphaned_reads();
    }

    /// Cancel queued jobs, wait for the running one, and settle every
    /// outstanding read callback (with `None` for cancelled jobs).
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.as_mut() else {
            self.fail_orphaned_reads();
            return;
        };
        log::info!("Shutting down object cache worker");
        worker.close();
        self.flush();
        self.worker = None;
    }

    /// Hand a job to the worker when `threaded`; otherwise give it back
    fn submit(&mut self, job: Job, threaded: bool) -> std::result::Result<(), Job> {
        if !threaded {
            return Err(job);
        }
        let Some(worker) = self.worker.as_ref() else {
            return Err(job);
        };

        let handle = job.handle();
        if self.in_flight.contains_key(&handle) {
            log::debug!("Region {} already has a cache job in flight; jobs run in submission order", handle);
        }
        worker.submit(job)?;
        *self.in_flight.entry(handle).or_default() += 1;
        Ok(())
    }

    fn dispatch(&mut self, output: JobOutput) {
        match output {
            JobOutput::Read {
                ticket,
                handle,
                entries,
                extras,
            } => {
                self.settle(handle);
                if let Some((_, callback)) = self.callbacks.remove(&ticket) {
                    callback(handle, entries, extras);
                }
            }
            JobOutput::Written { handle, records } => {
                self.settle(handle);
                if records.is_none() {
                    log::debug!("Cache write for region {} failed", handle);
                }
            }
            JobOutput::Aborted { ticket, handle } => {
                self.settle(handle);
                log::debug!("Cache job for region {} skipped at shutdown", handle);
                if let Some((_, callback)) = ticket.and_then(|t| self.callbacks.remove(&t)) {
                    callback(handle, None, None);
                }
            }
        }
    }

    fn settle(&mut self, handle: RegionHandle) {
        if let Some(count) = self.in_flight.get_mut(&handle) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&handle);
            }
        }
    }

    /// Callbacks whose job can no longer report back
    fn fail_orphaned_reads(&mut self) {
        let mut tickets: Vec<u64> = self.callbacks.keys().copied().collect();
        tickets.sort_unstable();
        for ticket in tickets {
            if let Some((handle, callback)) = self.callbacks.remove(&ticket) {
                log::warn!("Object cache read for region {} lost its worker", handle);
                callback(handle, None, None);
            }
        }
    }
}

impl Drop for ObjectCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Load the header into `state`, creating or rebuilding it as needed
fn load_header(state: &StoreState, capacity: u32) {
    let path = state.paths.header();
    let loaded = header::read_header(&path);

    let mut guard = state.lock();
    match loaded {
        Ok(None) => {
            log::info!("No object cache header, creating {}", path.display());
            state.persist_header(&mut guard);
        }
        Ok(Some((meta, slots))) if meta.is_current() => {
            guard.index = HeaderIndex::from_slots(capacity, &slots);
            let evicted = guard.index.purge_to(capacity as usize);
            state.discard_evicted(&mut guard, &evicted);
            log::info!("Object cache header loaded: {} resident regions", guard.index.len());
        }
        Ok(Some((meta, _))) => {
            log::info!(
                "Object cache version {} (address size {}) does not match {}, rebuilding",
                meta.version,
                meta.address_size,
                header::CACHE_VERSION
            );
            drop(guard);
            if let Err(e) = wipe(state) {
                log::warn!("Failed to rebuild object cache: {}", e);
            }
        }
        Err(e) => {
            log::warn!("Unreadable object cache header {}: {}; rebuilding", path.display(), e);
            drop(guard);
            if let Err(e) = wipe(state) {
                log::warn!("Failed to rebuild object cache: {}", e);
            }
        }
    }
}

/// Delete all files of the cache directory and write an empty header
fn wipe(state: &StoreState) -> Result<()> {
    let mut guard = state.lock();
    if guard.read_only {
        log::info!("Not clearing object cache: cache is read-only");
        return Err(Error::ReadOnly);
    }

    log::info!("Removing object cache at {}", state.paths.dir().display());
    for entry in std::fs::read_dir(state.paths.dir())? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Err(e) = std::fs::remove_file(entry.path()) {
            log::warn!("Failed to remove {}: {}", entry.path().display(), e);
        }
    }

    guard.index.clear();
    if state.persist_header(&mut guard) {
        Ok(())
    } else {
        Err(Error::ReadOnly)
    }
}
