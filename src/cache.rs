//! Host staging cache: a bounded pinned-host arena.
//!
//! Guards a fixed-size byte buffer behind a `Mutex`. Unlike an LRU block
//! cache this one cannot evict — outstanding slices are owned by
//! in-flight copies — so it blocks the acquiring thread on a `Condvar`
//! instead until enough space frees up.

use std::sync::{Condvar, Mutex};

use crate::error::{EngineError, Result};

#[derive(Debug)]
struct FreeList {
    /// Sorted, non-overlapping `(offset, len)` free regions.
    regions: Vec<(usize, usize)>,
}

impl FreeList {
    fn new(capacity: usize) -> Self {
        Self {
            regions: vec![(0, capacity)],
        }
    }

    /// Best-fit: picks the smallest free region that still fits `len`.
    fn acquire(&mut self, len: usize) -> Option<usize> {
        let mut best: Option<(usize, usize, usize)> = None; // (index, offset, region_len)
        for (idx, &(offset, region_len)) in self.regions.iter().enumerate() {
            if region_len >= len {
                match best {
                    Some((_, _, best_len)) if best_len <= region_len => {}
                    _ => best = Some((idx, offset, region_len)),
                }
            }
        }
        let (idx, offset, region_len) = best?;
        if region_len == len {
            self.regions.remove(idx);
        } else {
            self.regions[idx] = (offset + len, region_len - len);
        }
        Some(offset)
    }

    fn release(&mut self, offset: usize, len: usize) {
        self.regions.push((offset, len));
        self.regions.sort_unstable_by_key(|&(o, _)| o);
        self.coalesce();
    }

    fn coalesce(&mut self) {
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.regions.len());
        for &(offset, len) in &self.regions {
            if let Some(last) = merged.last_mut() {
                if last.0 + last.1 == offset {
                    last.1 += len;
                    continue;
                }
            }
            merged.push((offset, len));
        }
        self.regions = merged;
    }

    fn outstanding(&self, capacity: usize) -> usize {
        capacity - self.regions.iter().map(|&(_, len)| len).sum::<usize>()
    }
}

/// A bounded pinned-host arena.
///
/// `capacity` bytes are reserved up front; `acquire` hands out
/// non-overlapping byte ranges and blocks the calling thread until
/// enough space frees, unless the single request exceeds total capacity,
/// in which case it fails with [`EngineError::OutOfCapacity`]
/// immediately.
#[derive(Debug)]
pub struct HostStagingCache {
    capacity: usize,
    buffer: Mutex<Vec<u8>>,
    free_list: Mutex<FreeList>,
    condvar: Condvar,
}

impl HostStagingCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buffer: Mutex::new(vec![0u8; capacity]),
            free_list: Mutex::new(FreeList::new(capacity)),
            condvar: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sum of outstanding slice sizes; also used by tests to observe
    /// back-pressure.
    pub fn outstanding_bytes(&self) -> usize {
        self.free_list.lock().unwrap().outstanding(self.capacity)
    }

    /// Acquires `len` bytes, blocking until available. Fails immediately
    /// (never blocks) if `len` exceeds total capacity.
    pub fn acquire(self: &std::sync::Arc<Self>, len: usize) -> Result<CacheSlice> {
        if len > self.capacity {
            return Err(EngineError::OutOfCapacity {
                requested: len,
                capacity: self.capacity,
            });
        }
        let mut free_list = self.free_list.lock().unwrap();
        loop {
            if let Some(offset) = free_list.acquire(len) {
                return Ok(CacheSlice {
                    cache: self.clone(),
                    offset,
                    len,
                });
            }
            free_list = self.condvar.wait(free_list).unwrap();
        }
    }

    fn release(&self, offset: usize, len: usize) {
        let mut free_list = self.free_list.lock().unwrap();
        free_list.release(offset, len);
        drop(free_list);
        self.condvar.notify_all();
    }

    /// Blocks until every outstanding slice has been released.
    pub fn drain(&self) {
        let mut free_list = self.free_list.lock().unwrap();
        while free_list.outstanding(self.capacity) > 0 {
            free_list = self.condvar.wait(free_list).unwrap();
        }
    }

    fn write_at(&self, offset: usize, data: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer[offset..offset + data.len()].copy_from_slice(data);
    }

    fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        let buffer = self.buffer.lock().unwrap();
        buffer[offset..offset + len].to_vec()
    }
}

/// An outstanding, exclusively-owned region of the staging cache. Released
/// back to the free list automatically on drop, whether the owning flush
/// job completed or was abandoned.
#[derive(Debug)]
pub struct CacheSlice {
    cache: std::sync::Arc<HostStagingCache>,
    offset: usize,
    len: usize,
}

impl CacheSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn write(&self, data: &[u8]) {
        debug_assert_eq!(data.len(), self.len);
        self.cache.write_at(self.offset, data);
    }

    pub fn read(&self) -> Vec<u8> {
        self.cache.read_at(self.offset, self.len)
    }
}

impl Drop for CacheSlice {
    fn drop(&mut self) {
        self.cache.release(self.offset, self.len);
    }
}
