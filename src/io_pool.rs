//! Async I/O worker pool: a fixed set of workers flushing staged buffers
//! to disk in per-path version order.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use dashmap::DashMap;

use crate::cache::CacheSlice;
use crate::error::{EngineError, Result};

/// A single unit of work written by the I/O pool: one tensor slice to one
/// file offset.
pub struct FlushJob {
    /// The engine-wide checkpoint version this job belongs to.
    pub version: u64,
    /// Per-path sequence number assigned by the engine, starting at 0 for
    /// each path and incrementing by one per save to that path. This is
    /// what ordering is actually enforced on — `version` is global and
    /// may skip values for any one path, but `seq` never does.
    pub seq: u64,
    pub slice: CacheSlice,
    pub file_offset: u64,
    pub path: PathBuf,
}

struct Pending {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl Pending {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn inc(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn dec(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.condvar.wait(count).unwrap();
        }
    }
}

/// Message sent over the internal work channel. `Shutdown` is a poison
/// pill: exactly one is sent per worker when the pool is dropped, so each
/// worker's receive loop terminates instead of blocking forever on a
/// channel that workers themselves keep open (they each hold a sender
/// clone for the re-enqueue path below).
enum WorkItem {
    Flush(FlushJob),
    Shutdown,
}

/// Fixed-size worker pool. Dequeues [`FlushJob`]s from a bounded MPMC
/// queue, enforcing per-path, per-version ordering: jobs for different
/// paths run in parallel, jobs for the same path are serialized in
/// ascending version order.
pub struct IoWorkerPool {
    sender: crossbeam_channel::Sender<WorkItem>,
    pending: Arc<Pending>,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    touched_paths: Arc<Mutex<HashMap<PathBuf, ()>>>,
}

impl IoWorkerPool {
    pub fn new(workers: usize, error_slot: Arc<Mutex<Option<EngineError>>>) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<WorkItem>();
        let pending = Arc::new(Pending::new());
        let next_version: Arc<DashMap<PathBuf, u64>> = Arc::new(DashMap::new());
        let touched_paths = Arc::new(Mutex::new(HashMap::new()));

        let handles = (0..workers)
            .map(|_| {
                let receiver = receiver.clone();
                let sender = sender.clone();
                let pending = pending.clone();
                let next_version = next_version.clone();
                let error_slot = error_slot.clone();
                let touched_paths = touched_paths.clone();
                std::thread::spawn(move || {
                    worker_loop(
                        receiver,
                        sender,
                        pending,
                        next_version,
                        error_slot,
                        touched_paths,
                    )
                })
            })
            .collect();

        Self {
            sender,
            pending,
            error_slot,
            handles,
            touched_paths,
        }
    }

    /// Enqueues a flush job. Never blocks the caller on I/O.
    pub fn submit(&self, job: FlushJob) {
        self.touched_paths
            .lock()
            .unwrap()
            .entry(job.path.clone())
            .or_insert(());
        self.pending.inc();
        // The channel is unbounded so this never blocks; back-pressure
        // comes from the staging cache, not the I/O queue.
        self.sender
            .send(WorkItem::Flush(job))
            .expect("worker threads outlive the pool");
    }

    /// Blocks until the queue is empty and all in-flight writes have
    /// returned from the OS.
    pub fn wait(&self) -> Result<()> {
        self.pending.wait_drained();
        let mut slot = self.error_slot.lock().unwrap();
        if let Some(err) = slot.take() {
            return Err(err);
        }
        Ok(())
    }

    /// fsyncs every path written since the last call.
    pub fn fsync_touched(&self) -> Result<()> {
        let mut touched = self.touched_paths.lock().unwrap();
        for path in touched.keys() {
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .map_err(|source| EngineError::IoFailed {
                    path: path.clone(),
                    source,
                })?;
            file.sync_all().map_err(|source| EngineError::IoFailed {
                path: path.clone(),
                source,
            })?;
        }
        touched.clear();
        Ok(())
    }
}

impl Drop for IoWorkerPool {
    fn drop(&mut self) {
        // Drain queued jobs before releasing resources: no soft cancel.
        self.pending.wait_drained();
        // Each worker holds its own sender clone (needed for the
        // re-enqueue path in worker_loop), so the channel never
        // disconnects on its own. Send one shutdown sentinel per worker
        // and join every handle so no thread outlives the pool.
        for _ in 0..self.handles.len() {
            let _ = self.sender.send(WorkItem::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    receiver: crossbeam_channel::Receiver<WorkItem>,
    sender: crossbeam_channel::Sender<WorkItem>,
    pending: Arc<Pending>,
    next_version: Arc<DashMap<PathBuf, u64>>,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    touched_paths: Arc<Mutex<HashMap<PathBuf, ()>>>,
) {
    while let Ok(item) = receiver.recv() {
        let job = match item {
            WorkItem::Flush(job) => job,
            WorkItem::Shutdown => break,
        };

        let mut expected = next_version.entry(job.path.clone()).or_insert(0);
        if *expected != job.seq {
            // Another job for this path must land first; give it a
            // chance to be picked up by re-queuing behind it rather than
            // spinning on this one.
            drop(expected);
            if sender.send(WorkItem::Flush(job)).is_err() {
                break;
            }
            std::thread::yield_now();
            continue;
        }

        let result = write_job(&job);
        *expected += 1;
        drop(expected);

        if let Err(err) = result {
            tracing::warn!(path = %job.path.display(), error = %err, "flush job failed");
            let mut slot = error_slot.lock().unwrap();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        let _ = &touched_paths;
        pending.dec();
    }
}

fn write_job(job: &FlushJob) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(&job.path)
        .map_err(|source| EngineError::IoFailed {
            path: job.path.clone(),
            source,
        })?;
    file.seek(SeekFrom::Start(job.file_offset))
        .map_err(|source| EngineError::IoFailed {
            path: job.path.clone(),
            source,
        })?;
    file.write_all(&job.slice.read())
        .map_err(|source| EngineError::IoFailed {
            path: job.path.clone(),
            source,
        })?;
    Ok(())
}

pub fn path_exists(path: &Path) -> bool {
    path.exists()
}
