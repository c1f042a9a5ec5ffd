//! Background worker for region file jobs.
//!
//! Jobs run one at a time on a dedicated tokio runtime, in submission order.
//! Results travel back over a channel and are consumed on the thread that
//! owns the store. Cancelling the [`ShutdownToken`] turns every job that has
//! not started yet into an [`JobOutput::Aborted`] result.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::error::Error;
use crate::entry::{EntryMap, ExtrasMap};
use crate::region::RegionHandle;
use crate::store::format;
use crate::store::state::StoreState;

/// Shared flag telling queued jobs to do nothing
#[derive(Debug, Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Load both files of a region
#[derive(Debug)]
pub(crate) struct ReadJob {
    pub ticket: u64,
    pub handle: RegionHandle,
    pub region_name: String,
    pub cache_id: Uuid,
}

/// Persist both files of a region
#[derive(Debug)]
pub(crate) struct WriteJob {
    pub handle: RegionHandle,
    pub region_name: String,
    pub cache_id: Uuid,
    pub entries: EntryMap,
    pub extras: ExtrasMap,
    pub removal_enabled: bool,
}

#[derive(Debug)]
pub(crate) enum Job {
    Read(ReadJob),
    Write(WriteJob),
}

/// What a job produced
#[derive(Debug)]
pub(crate) enum JobOutput {
    Read {
        ticket: u64,
        handle: RegionHandle,
        entries: Option<EntryMap>,
        extras: Option<ExtrasMap>,
    },
    /// Number of records written, None when the write failed
    Written {
        handle: RegionHandle,
        records: Option<usize>,
    },
    /// Skipped because the store is shutting down
    Aborted {
        ticket: Option<u64>,
        handle: RegionHandle,
    },
}

impl Job {
    pub fn handle(&self) -> RegionHandle {
        match self {
            Job::Read(job) => job.handle,
            Job::Write(job) => job.handle,
        }
    }

    pub fn ticket(&self) -> Option<u64> {
        match self {
            Job::Read(job) => Some(job.ticket),
            Job::Write(_) => None,
        }
    }

    pub fn run(self, state: &StoreState) -> JobOutput {
        match self {
            Job::Read(job) => read_region(state, job),
            Job::Write(job) => write_region(state, job),
        }
    }

    pub fn abort(self) -> JobOutput {
        JobOutput::Aborted {
            ticket: self.ticket(),
            handle: self.handle(),
        }
    }
}

fn read_region(state: &StoreState, job: ReadJob) -> JobOutput {
    let ReadJob {
        ticket,
        handle,
        region_name,
        cache_id,
    } = job;
    let path = state.paths.entries(handle);

    let (mut entries, discard) = match format::read_entries(&path, cache_id, &region_name) {
        Ok(loaded) => {
            if let Some(e) = &loaded.corruption {
                log::warn!(
                    "Cache file corruption for region {} after {} entries ({}); keeping them and invalidating {}",
                    region_name,
                    loaded.entries.len(),
                    e,
                    path.display()
                );
            } else {
                log::info!("Cache hit for region {} on file: {}", region_name, path.display());
            }
            let discard = loaded.corruption.is_some();
            (Some(loaded.entries), discard)
        }
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            log::warn!("Could not find: {} - Region: {}", path.display(), region_name);
            (None, true)
        }
        Err(e) => {
            log::warn!("Aborting cache file load for {}: {}", path.display(), e);
            (None, true)
        }
    };

    let extras = match entries.as_mut() {
        Some(entries) => read_region_extras(state, handle, cache_id, &region_name, entries),
        None => None,
    };

    if discard {
        log::info!("Removing cache entry for region: {}", region_name);
        state.remove_entry(handle);
        if let Err(e) = format::remove_if_exists(&path) {
            log::warn!("Failed to remove cache file {}: {}", path.display(), e);
        }
    }

    JobOutput::Read {
        ticket,
        handle,
        entries,
        extras,
    }
}

/// Load the extras file; entries whose override failed to decode are
/// dropped from `entries` so their materials get requested again.
fn read_region_extras(
    state: &StoreState,
    handle: RegionHandle,
    cache_id: Uuid,
    region_name: &str,
    entries: &mut EntryMap,
) -> Option<ExtrasMap> {
    let path = state.paths.extras(handle);
    match format::read_extras(&path, cache_id, region_name) {
        Ok(loaded) => {
            for local_id in &loaded.rejected {
                entries.remove(local_id);
            }
            log::info!("Extra data cache hit for region {} on file: {}", region_name, path.display());
            Some(loaded.extras)
        }
        Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("No extras cache file: {} - Region: {}", path.display(), region_name);
            None
        }
        Err(e) => {
            log::warn!(
                "Aborted extra data cache load for region {} ({}); removing {}",
                region_name,
                e,
                path.display()
            );
            if let Err(e) = format::remove_if_exists(&path) {
                log::warn!("Failed to remove cache file {}: {}", path.display(), e);
            }
            None
        }
    }
}

fn write_region(state: &StoreState, job: WriteJob) -> JobOutput {
    let handle = job.handle;
    let path = state.paths.entries(handle);

    let records = match format::write_entries(&path, job.cache_id, &job.entries, job.removal_enabled) {
        Ok(records) => records,
        Err(e) => {
            log::warn!(
                "Aborted cache file write for region {} (failure to write to file {}): {}",
                job.region_name,
                path.display(),
                e
            );
            state.remove_entry(handle);
            if let Err(e) = format::remove_if_exists(&path) {
                log::warn!("Failed to remove cache file {}: {}", path.display(), e);
            }
            return JobOutput::Written { handle, records: None };
        }
    };
    log::info!("Saved {} objects for region {} to file: {}", records, job.region_name, path.display());

    let extras_path = state.paths.extras(handle);
    if let Err(e) = format::write_extras(&extras_path, job.cache_id, &job.extras) {
        log::warn!(
            "Aborted extra cache write for region {} (failure to write to file {}): {}",
            job.region_name,
            extras_path.display(),
            e
        );
    }

    JobOutput::Written {
        handle,
        records: Some(records),
    }
}

/// One-thread job runner with result channel
pub(crate) struct Worker {
    job_tx: Option<mpsc::UnboundedSender<Job>>,
    result_rx: mpsc::UnboundedReceiver<JobOutput>,
    token: ShutdownToken,
    runtime: Option<Runtime>,
}

impl Worker {
    pub fn spawn(state: Arc<StoreState>) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .thread_name("vocache-io")
            .build()?;

        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let (result_tx, result_rx) = mpsc::unbounded_channel::<JobOutput>();
        let token = ShutdownToken::new();

        let worker_token = token.clone();
        runtime.spawn(async move {
            Self::worker_loop(state, worker_token, &mut job_rx, result_tx).await;
        });

        Ok(Self {
            job_tx: Some(job_tx),
            result_rx,
            token,
            runtime: Some(runtime),
        })
    }

    async fn worker_loop(
        state: Arc<StoreState>,
        token: ShutdownToken,
        job_rx: &mut mpsc::UnboundedReceiver<Job>,
        result_tx: mpsc::UnboundedSender<JobOutput>,
    ) {
        while let Some(job) = job_rx.recv().await {
            let output = if token.is_cancelled() {
                job.abort()
            } else {
                let (handle, ticket) = (job.handle(), job.ticket());
                let state = Arc::clone(&state);
                let token = token.clone();
                let task = tokio::task::spawn_blocking(move || {
                    if token.is_cancelled() {
                        job.abort()
                    } else {
                        job.run(&state)
                    }
                });
                match task.await {
                    Ok(output) => output,
                    Err(e) => {
                        log::error!("Object cache job for region {} failed: {}", handle, e);
                        JobOutput::Aborted { ticket, handle }
                    }
                }
            };

            if result_tx.send(output).is_err() {
                break;
            }
        }
    }

    /// Queue a job. The job is handed back when the worker is gone.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.job_tx {
            Some(tx) => tx.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }

    pub fn try_recv(&mut self) -> Option<JobOutput> {
        self.result_rx.try_recv().ok()
    }

    /// Wait for the next result. Must not be called from async code.
    pub fn recv_blocking(&mut self) -> Option<JobOutput> {
        self.result_rx.blocking_recv()
    }

    /// Cancel pending jobs and stop accepting new ones. Results of jobs
    /// already queued (aborted ones included) can still be received.
    pub fn close(&mut self) {
        self.token.cancel();
        self.job_tx = None;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
