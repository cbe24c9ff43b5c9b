//! Checkpoint engine facade: `save`/`load`/`commit`/`wait`.
//!
//! Every path here returns a `Result`; the engine stays usable after a
//! failed `load`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::cache::HostStagingCache;
use crate::config::{EngineConfig, Strategy};
use crate::error::{EngineError, Result};
use crate::header::{Header, MetaHeaderEntry, TensorHeaderEntry, SIZE_PREFIX_BYTES};
use crate::io_pool::{FlushJob, IoWorkerPool};
use crate::parser::{parse_state, scalar_tree_to_restored, splice_tensor};
use crate::scalar_codec;
use crate::tensor::HostTensor;
use crate::value::{RestoredValue, StateValue};

const MAX_HEADER_REBUILD_PASSES: usize = 4;

struct PathBookkeeping {
    next_seq: u64,
}

/// Long-lived owner of the pinned arena, I/O worker pool, and version
/// bookkeeping.
pub struct Engine {
    config: EngineConfig,
    cache: Arc<HostStagingCache>,
    io_pool: IoWorkerPool,
    parse_pool: rayon::ThreadPool,
    error_slot: Arc<Mutex<Option<EngineError>>>,
    next_version: Mutex<u64>,
    last_saved_version: Mutex<Option<u64>>,
    last_committed_version: Mutex<Option<u64>>,
    path_state: DashMap<PathBuf, PathBookkeeping>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let error_slot = Arc::new(Mutex::new(None));
        let parse_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.parser_threads)
            .build()
            .map_err(|e| EngineError::ConfigInvalid(e.to_string()))?;
        let cache = Arc::new(HostStagingCache::new(config.host_cache_bytes));
        let io_pool = IoWorkerPool::new(config.io_workers, error_slot.clone());
        Ok(Self {
            config,
            cache,
            io_pool,
            parse_pool,
            error_slot,
            next_version: Mutex::new(0),
            last_saved_version: Mutex::new(None),
            last_committed_version: Mutex::new(None),
            path_state: DashMap::new(),
        })
    }

    pub fn last_committed_version(&self) -> Option<u64> {
        *self.last_committed_version.lock().unwrap()
    }

    /// Non-blocking: schedules parsing, staging, and flushing. Returns the
    /// checkpoint version assigned to this save. Copies into the staging
    /// arena happen synchronously here (so `save` may block on arena
    /// capacity); the actual disk write is handed to the I/O pool and
    /// completes asynchronously.
    pub fn save(
        &self,
        state: &StateValue,
        path: impl AsRef<Path>,
        strategy: Strategy,
    ) -> Result<u64> {
        let path = path.as_ref().to_path_buf();
        let version = {
            let mut next = self.next_version.lock().unwrap();
            let assigned = *next;
            *next += 1;
            assigned
        };
        *self.last_saved_version.lock().unwrap() = Some(version);
        let parsed = parse_state(state);
        // One flush job per tensor plus one for the scalar tree; reserve a
        // contiguous block of per-path job sequence numbers so the I/O
        // pool's ordering counter (which demands a gapless 0, 1, 2, ...
        // per path) never stalls waiting on a seq nobody will submit.
        let seq_base = self.reserve_path_seq(&path, parsed.tensor_records.len() + 1);
        let header_bytes = build_header_and_stage(
            &parsed.scalar_tree,
            &parsed.tensor_records,
            &self.cache,
            &self.io_pool,
            &self.parse_pool,
            &path,
            version,
            seq_base,
        )?;

        // The header itself is submitted as its own flush job at seq 0 of
        // the header's private ordering slot — but header and payload
        // share one file, so instead we just write it inline here before
        // any tensor bytes land; the I/O pool's per-path ordering ensures
        // tensor writes (seq >= 1 relative to the header write) land after.
        //
        // In practice the header is tiny; writing it synchronously keeps
        // `save` simple without adding a second ordering axis.
        write_header_inline(&path, &header_bytes)?;
        tracing::debug!(
            version,
            seq_base,
            path = %path.display(),
            tensors = parsed.tensor_records.len(),
            ?strategy,
            "checkpoint staged"
        );

        Ok(version)
    }

    /// Reserves `n` consecutive per-path job-sequence numbers, returning
    /// the first one. Jobs for the same path must be numbered without
    /// gaps (see [`crate::io_pool`]'s ordering counter), so one save's
    /// worth of jobs (one scalar-tree flush plus one per tensor) claims a
    /// contiguous block up front.
    fn reserve_path_seq(&self, path: &Path, n: usize) -> u64 {
        let mut entry = self
            .path_state
            .entry(path.to_path_buf())
            .or_insert(PathBookkeeping { next_seq: 0 });
        let base = entry.next_seq;
        entry.next_seq += n as u64;
        base
    }

    /// Drains the parse pool (implicitly, since parsing above is
    /// synchronous), the staging arena, and the I/O pool; propagates the
    /// first recorded error.
    pub fn wait(&self) -> Result<()> {
        if let Err(err) = self.io_pool.wait() {
            tracing::warn!(error = %err, "checkpoint flush failed");
            return Err(err);
        }
        self.cache.drain();
        Ok(())
    }

    /// `wait()`, then fsync each path written since the previous commit,
    /// then advance `last_committed_version` to the specific version the
    /// most recent `save` assigned. The target version is captured before
    /// `wait()` runs, so a concurrent `save` racing with this call can
    /// never be credited as committed before its own I/O has drained.
    pub fn commit(&self) -> Result<u64> {
        let target = self.last_saved_version.lock().unwrap().ok_or_else(|| {
            EngineError::ConfigInvalid("commit called before any save".to_string())
        })?;
        self.wait()?;
        if self.config.persist {
            self.io_pool.fsync_touched()?;
        }
        *self.last_committed_version.lock().unwrap() = Some(target);
        tracing::info!(version = target, "checkpoint committed");
        Ok(target)
    }

    /// Synchronous: reads the header, restores each tensor by its declared
    /// byte range and dtype, and splices the restored tree back together.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<RestoredValue> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|source| EngineError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;

        let mut size_prefix = [0u8; SIZE_PREFIX_BYTES];
        file.read_exact(&mut size_prefix)
            .map_err(|source| EngineError::IoFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let header_len = crate::header::decode_size_prefix(&size_prefix) as usize;

        let mut header_bytes = vec![0u8; header_len];
        file.read_exact(&mut header_bytes)
            .map_err(|source| EngineError::IoFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let header = Header::from_bytes(path, &header_bytes)?;

        let meta_bytes = read_range(&mut file, path, header.meta.data_offsets)?;
        let scalar_tree = scalar_codec::decode(&meta_bytes)?;
        let mut restored = scalar_tree_to_restored(scalar_tree);

        for (dotted_path, entry) in &header.tensors {
            let dtype = crate::header::normalize_dtype(&entry.dtype).ok_or_else(|| {
                EngineError::CorruptHeader {
                    path: path.to_path_buf(),
                    reason: format!("unrecognized dtype `{}` for `{dotted_path}`", entry.dtype),
                }
            })?;
            let bytes = read_range(&mut file, path, entry.data_offsets)?;
            let tensor = HostTensor::new(dtype, entry.shape.clone(), bytes);
            splice_tensor(&mut restored, dotted_path, tensor)?;
        }

        Ok(restored)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // No soft cancel: drain the arena and the I/O pool before
        // releasing them.
        self.cache.drain();
        let _ = self.io_pool.wait();
    }
}

fn read_range(file: &mut File, path: &Path, range: [u64; 2]) -> Result<Vec<u8>> {
    let [start, end] = range;
    let mut buf = vec![0u8; (end - start) as usize];
    file.seek(SeekFrom::Start(start))
        .map_err(|source| EngineError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;
    file.read_exact(&mut buf)
        .map_err(|source| EngineError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(buf)
}

#[allow(clippy::too_many_arguments)]
fn build_header_and_stage(
    scalar_tree: &crate::value::ScalarTree,
    tensor_records: &[crate::parser::TensorRecord<'_>],
    cache: &Arc<HostStagingCache>,
    io_pool: &IoWorkerPool,
    parse_pool: &rayon::ThreadPool,
    path: &Path,
    version: u64,
    seq_base: u64,
) -> Result<Vec<u8>> {
    let meta_bytes = scalar_codec::encode(scalar_tree)?;
    let payload_len = tensor_records.last().map(|r| r.end).unwrap_or(0);
    let meta_start = payload_len;
    let meta_end = meta_start + meta_bytes.len() as u64;

    let mut header_len_guess = 0usize;
    let mut header_bytes = Vec::new();
    for _ in 0..MAX_HEADER_REBUILD_PASSES {
        let shift = (SIZE_PREFIX_BYTES + header_len_guess) as u64;
        let header = build_header(tensor_records, meta_start, meta_end, shift);
        header_bytes = header.to_bytes()?;
        if header_bytes.len() == header_len_guess {
            break;
        }
        header_len_guess = header_bytes.len();
    }
    let shift = (SIZE_PREFIX_BYTES + header_bytes.len()) as u64;

    // Stage the scalar-tree bytes and every tensor's bytes into the
    // pinned arena, then hand each region to the I/O pool as its own
    // flush job at the absolute file offset the header just declared,
    // using the contiguous per-path seq block the caller reserved.
    let mut next_local_seq = seq_base;

    let meta_slice = cache.acquire(meta_bytes.len())?;
    meta_slice.write(&meta_bytes);
    io_pool.submit(FlushJob {
        version,
        seq: next_local_seq,
        slice: meta_slice,
        file_offset: meta_start + shift,
        path: path.to_path_buf(),
    });
    next_local_seq += 1;

    // Copying each tensor into the pinned arena is independent work per
    // tensor; run it across the parse pool so a state dict with many
    // tensors doesn't serialize on a single thread. Each slice is
    // submitted to the I/O pool the instant it's staged rather than
    // collected up front — the arena is bounded, and a save whose
    // tensors collectively exceed its capacity can only make progress if
    // earlier slices are handed off to the I/O pool (and eventually
    // released) while later ones are still being acquired. Submission
    // order to the I/O pool doesn't matter — each job carries its own
    // seq, which the pool uses to restore the correct on-disk order
    // regardless of the order jobs arrive in.
    let first_tensor_seq = next_local_seq;
    parse_pool.install(|| -> Result<()> {
        use rayon::prelude::*;
        tensor_records
            .par_iter()
            .enumerate()
            .try_for_each(|(i, record)| {
                let slice = cache.acquire(record.bytes.len())?;
                slice.write(&record.bytes);
                io_pool.submit(FlushJob {
                    version,
                    seq: first_tensor_seq + i as u64,
                    slice,
                    file_offset: record.start + shift,
                    path: path.to_path_buf(),
                });
                Ok(())
            })
    })?;

    Ok(header_bytes)
}

fn build_header(
    tensor_records: &[crate::parser::TensorRecord<'_>],
    meta_start: u64,
    meta_end: u64,
    shift: u64,
) -> Header {
    let mut tensors = indexmap::IndexMap::new();
    for record in tensor_records {
        tensors.insert(
            record.dotted_path.clone(),
            TensorHeaderEntry {
                dtype: record.dtype.as_str().to_string(),
                shape: record.shape.clone(),
                data_offsets: [record.start + shift, record.end + shift],
            },
        );
    }
    Header {
        tensors,
        meta: MetaHeaderEntry {
            data_offsets: [meta_start + shift, meta_end + shift],
        },
    }
}

fn write_header_inline(path: &Path, header_bytes: &[u8]) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .map_err(|source| EngineError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;
    let prefix = crate::header::encode_size_prefix(header_bytes.len());
    file.write_all(&prefix)
        .and_then(|_| file.write_all(header_bytes))
        .map_err(|source| EngineError::IoFailed {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, TensorLike};
    use crate::value::StateValue;

    fn sample_state() -> StateValue {
        let mut meta = indexmap::IndexMap::new();
        meta.insert("epoch".to_string(), StateValue::scalar(7i64));
        meta.insert(
            "lrs".to_string(),
            StateValue::Seq(vec![StateValue::scalar(0.1f64), StateValue::scalar(0.01f64)]),
        );
        let mut root = indexmap::IndexMap::new();
        root.insert(
            "w".to_string(),
            StateValue::tensor(HostTensor::new(
                DType::Float32,
                vec![2, 3],
                (1..=6u8).flat_map(|b| (b as f32).to_le_bytes()).collect(),
            )),
        );
        root.insert("meta".to_string(), StateValue::Map(meta));
        StateValue::Map(root)
    }

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            host_cache_bytes: 1024 * 1024,
            parser_threads: 1,
            io_workers: 2,
            ..EngineConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn save_commit_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt0");
        let engine = engine();
        let state = sample_state();

        engine.save(&state, &path, Strategy::Host).unwrap();
        engine.commit().unwrap();
        assert_eq!(engine.last_committed_version(), Some(0));

        let restored = engine.load(&path).unwrap();
        match restored {
            RestoredValue::Map(m) => {
                match &m["w"] {
                    RestoredValue::Tensor(t) => {
                        assert_eq!(t.shape(), &[2, 3]);
                        assert_eq!(t.dtype(), DType::Float32);
                    }
                    _ => panic!("expected tensor"),
                }
                match &m["meta"] {
                    RestoredValue::Map(meta) => {
                        assert_eq!(
                            meta["epoch"],
                            RestoredValue::Scalar(crate::value::ScalarValue::Int(7))
                        );
                    }
                    _ => panic!("expected map"),
                }
            }
            _ => panic!("expected map"),
        }
    }

    #[test]
    fn second_save_to_same_path_wins_after_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt0");
        let engine = engine();

        let mut first = indexmap::IndexMap::new();
        first.insert(
            "w".to_string(),
            StateValue::tensor(HostTensor::new(DType::Int32, vec![1], vec![1, 0, 0, 0])),
        );
        engine
            .save(&StateValue::Map(first), &path, Strategy::Host)
            .unwrap();
        engine.commit().unwrap();

        let mut second = indexmap::IndexMap::new();
        second.insert(
            "w".to_string(),
            StateValue::tensor(HostTensor::new(DType::Int32, vec![1], vec![2, 0, 0, 0])),
        );
        engine
            .save(&StateValue::Map(second), &path, Strategy::Host)
            .unwrap();
        engine.commit().unwrap();

        let restored = engine.load(&path).unwrap();
        match restored {
            RestoredValue::Map(m) => match &m["w"] {
                RestoredValue::Tensor(t) => assert_eq!(t.bytes(), &[2, 0, 0, 0]),
                _ => panic!("expected tensor"),
            },
            _ => panic!("expected map"),
        }
    }

    #[test]
    fn corrupted_placeholder_is_fatal_but_engine_stays_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt0");
        let engine = engine();
        engine.save(&sample_state(), &path, Strategy::Host).unwrap();
        engine.commit().unwrap();

        // Flip the last byte of the stored `TENSOR|w` placeholder (inside
        // the msgpack-encoded scalar tree) without changing its length, so
        // the placeholder no longer matches the dotted path the header
        // declares for `w`.
        let mut bytes = std::fs::read(&path).unwrap();
        let needle = b"TENSOR|w";
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        bytes[pos + needle.len() - 1] = b'q';
        std::fs::write(&path, &bytes).unwrap();

        let err = engine.load(&path).unwrap_err();
        assert!(matches!(err, EngineError::KeyMismatch { .. }));

        // The engine itself remains usable for subsequent saves.
        let other_path = dir.path().join("ckpt1");
        engine
            .save(&sample_state(), &other_path, Strategy::Host)
            .unwrap();
        engine.commit().unwrap();
    }
}
