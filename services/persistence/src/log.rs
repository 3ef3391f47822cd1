//! Durable Log — sorted, crash-recoverable key-value log
//!
//! Writes go to the active segment through a buffered writer and return
//! before the data is guaranteed on stable storage (unless `sync_writes`
//! is set). A crash between acceptance and flush loses the buffered tail;
//! that is the latency/durability trade this log makes.
//!
//! On open every segment is read back, torn tails are truncated, and a
//! `BTreeMap<LogKey, Location>` index is rebuilt (last write wins). Values
//! stay on disk and are read back lazily by range scans.

use crate::journal::{
    discover_segments, encode_frame, segment_path, Compression, FlushPolicy, FrameError,
    FramePosition, FsyncPolicy, SegmentWriter, WriterConfig,
};
use crate::reader::{read_frame_at, SegmentReader};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader};
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::key::LogKey;

/// Largest single value accepted by `append`.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// A key and its stored value.
pub type LogRecord = (LogKey, Vec<u8>);

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO failure: {0}")]
    IoFailure(#[from] io::Error),

    #[error("Log is closed")]
    Closed,

    #[error("Corruption in segment {segment} at byte offset {offset}: {detail}")]
    Corruption {
        segment: u64,
        offset: u64,
        detail: String,
    },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Entry too large: {len} bytes, maximum is {max}")]
    EntryTooLarge { len: usize, max: usize },
}

impl LogError {
    fn from_frame(err: FrameError, position: FramePosition) -> Self {
        match err {
            FrameError::Io(e) => LogError::IoFailure(e),
            FrameError::Compression(msg) => LogError::Compression(msg),
            other => LogError::Corruption {
                segment: position.segment,
                offset: position.offset,
                detail: other.to_string(),
            },
        }
    }
}

// ── Store Trait ─────────────────────────────────────────────────────

/// Boxed lazy scan returned through the `LogStore` trait.
pub type BoxedScan<'a> = Box<dyn Iterator<Item = Result<LogRecord, LogError>> + Send + 'a>;

/// Operations the pipeline needs from its write-ahead log.
///
/// `DurableLog` is the production implementation; tests substitute
/// failing or in-memory stores.
pub trait LogStore: Send + Sync {
    /// Append one entry. Durability is asynchronous.
    fn append(&self, key: LogKey, value: &[u8]) -> Result<(), LogError>;

    /// Append a batch as one unit: all entries or none survive a crash.
    fn append_batch(&self, entries: &[LogRecord]) -> Result<(), LogError>;

    /// Ascending scan from `start` (inclusive) until a key's timestamp
    /// exceeds `end.timestamp()`.
    fn scan_range(&self, start: LogKey, end: LogKey) -> BoxedScan<'_>;

    /// Largest key currently stored.
    fn last_key(&self) -> Option<LogKey>;

    /// Flush and release resources. Idempotent.
    fn close(&self) -> Result<(), LogError>;

    /// Storage statistics, when the store keeps any.
    fn log_stats(&self) -> Option<LogStats> {
        None
    }
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for the durable log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Rotate the active segment once it reaches this size.
    pub max_segment_bytes: u64,
    /// Flush buffered frames to the OS every N appends.
    pub flush_every: usize,
    /// Flush and fsync on every append (disables asynchronous durability).
    pub sync_writes: bool,
    pub compression: Compression,
}

impl LogConfig {
    /// Create a config with sensible defaults.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_segment_bytes: 256 * 1024 * 1024, // 256 MiB
            flush_every: 64,
            sync_writes: false,
            compression: Compression::default(),
        }
    }

    fn writer_config(&self) -> WriterConfig {
        let (flush_policy, fsync_policy) = if self.sync_writes {
            (FlushPolicy::EveryWrite, FsyncPolicy::EveryWrite)
        } else {
            (FlushPolicy::EveryN(self.flush_every.max(1)), FsyncPolicy::OnRotation)
        };
        WriterConfig {
            dir: self.dir.clone(),
            max_segment_bytes: self.max_segment_bytes,
            flush_policy,
            fsync_policy,
        }
    }
}

// ── Stats ───────────────────────────────────────────────────────────

/// Point-in-time statistics for health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    /// Distinct keys in the index.
    pub entries: u64,
    pub segments: u64,
    pub active_segment: u64,
    pub bytes_on_disk: u64,
    /// Frames written since open.
    pub frames_written: u64,
    /// Frame bytes written since open (after compression).
    pub bytes_written: u64,
    /// Torn or corrupt segment tails dropped during open.
    pub truncated_tails: u64,
}

// ── Durable Log ─────────────────────────────────────────────────────

/// Where an entry lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    frame: FramePosition,
    /// Index of the entry inside its frame.
    slot: u32,
}

struct LogInner {
    writer: Option<SegmentWriter>,
    index: BTreeMap<LogKey, Location>,
    frames_written: u64,
    bytes_written: u64,
    truncated_tails: u64,
}

/// Embedded ordered append-only log.
pub struct DurableLog {
    config: LogConfig,
    inner: Mutex<LogInner>,
}

impl DurableLog {
    /// Open (or create) the log in `config.dir`, rebuilding the index.
    pub fn open(config: LogConfig) -> Result<Self, LogError> {
        fs::create_dir_all(&config.dir)?;

        let segments = discover_segments(&config.dir)?;
        let mut index = BTreeMap::new();
        let mut truncated_tails = 0u64;

        for (i, &segment) in segments.iter().enumerate() {
            let path = segment_path(&config.dir, segment);
            let mut reader = SegmentReader::open(&path)?;
            while let Some(frame) = reader.next_frame()? {
                let frame_pos = FramePosition {
                    segment,
                    offset: frame.offset,
                };
                for (slot, (key, _)) in frame.entries.iter().enumerate() {
                    index.insert(
                        *key,
                        Location {
                            frame: frame_pos,
                            slot: slot as u32,
                        },
                    );
                }
            }

            if let Some(record) = reader.corruption() {
                truncated_tails += 1;
                let is_active = i + 1 == segments.len();
                if is_active {
                    warn!(
                        segment,
                        offset = record.byte_offset,
                        detail = %record.detail,
                        "Truncating torn tail of active segment"
                    );
                    let file = OpenOptions::new().write(true).open(&path)?;
                    file.set_len(reader.valid_len())?;
                    file.sync_all()?;
                } else {
                    error!(
                        segment,
                        offset = record.byte_offset,
                        detail = %record.detail,
                        "Corruption inside sealed segment; entries after this offset are unreachable"
                    );
                }
            }
        }

        let active = segments.last().copied().unwrap_or(0);
        let writer = SegmentWriter::open(config.writer_config(), active)
            .map_err(|e| LogError::from_frame(e, FramePosition { segment: active, offset: 0 }))?;

        info!(
            dir = %config.dir.display(),
            segments = segments.len(),
            entries = index.len(),
            truncated_tails,
            sync_writes = config.sync_writes,
            "Durable log opened"
        );

        Ok(Self {
            config,
            inner: Mutex::new(LogInner {
                writer: Some(writer),
                index,
                frames_written: 0,
                bytes_written: 0,
                truncated_tails,
            }),
        })
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Number of distinct keys stored.
    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy range scan with a restartable cursor.
    pub fn scan(&self, start: LogKey, end: LogKey) -> LogScan<'_> {
        LogScan {
            log: self,
            next_from: Some(start),
            end_ts: end.timestamp(),
            last_key: None,
            source: None,
            cached: None,
        }
    }

    pub fn stats(&self) -> Result<LogStats, LogError> {
        let (entries, active_segment, frames_written, bytes_written, truncated_tails) = {
            let inner = self.lock();
            (
                inner.index.len() as u64,
                inner.writer.as_ref().map(|w| w.segment()).unwrap_or(0),
                inner.frames_written,
                inner.bytes_written,
                inner.truncated_tails,
            )
        };

        let segments = discover_segments(&self.config.dir)?;
        let mut bytes_on_disk = 0u64;
        for id in &segments {
            bytes_on_disk += fs::metadata(segment_path(&self.config.dir, *id))?.len();
        }

        Ok(LogStats {
            entries,
            segments: segments.len() as u64,
            active_segment,
            bytes_on_disk,
            frames_written,
            bytes_written,
            truncated_tails,
        })
    }

    // ── Internal ────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self, entries: &[LogRecord]) -> Result<(), LogError> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some((_, v)) = entries.iter().find(|(_, v)| v.len() > MAX_VALUE_LEN) {
            return Err(LogError::EntryTooLarge {
                len: v.len(),
                max: MAX_VALUE_LEN,
            });
        }

        let frame = encode_frame(entries, self.config.compression).map_err(|e| match e {
            FrameError::Compression(msg) => LogError::Compression(msg),
            other => LogError::Corruption {
                segment: 0,
                offset: 0,
                detail: other.to_string(),
            },
        })?;

        let mut inner = self.lock();
        let writer = inner.writer.as_mut().ok_or(LogError::Closed)?;
        let segment = writer.segment();
        let position = writer
            .write_frame(&frame)
            .map_err(|e| LogError::from_frame(e, FramePosition { segment, offset: 0 }))?;

        for (slot, (key, _)) in entries.iter().enumerate() {
            inner.index.insert(
                *key,
                Location {
                    frame: position,
                    slot: slot as u32,
                },
            );
        }
        inner.frames_written += 1;
        inner.bytes_written += frame.len() as u64;
        Ok(())
    }

    /// Next index entry at or after `from`, flushing the writer if the
    /// entry is still buffered.
    fn locate_from(&self, from: LogKey) -> Result<Option<(LogKey, Location)>, LogError> {
        let mut inner = self.lock();
        if inner.writer.is_none() {
            return Err(LogError::Closed);
        }
        let found = inner
            .index
            .range((Bound::Included(from), Bound::Unbounded))
            .next()
            .map(|(k, loc)| (*k, *loc));

        if let Some((_, loc)) = found {
            if let Some(writer) = inner.writer.as_mut() {
                writer
                    .ensure_readable(loc.frame)
                    .map_err(|e| LogError::from_frame(e, loc.frame))?;
            }
        }
        Ok(found)
    }
}

impl LogStore for DurableLog {
    fn append(&self, key: LogKey, value: &[u8]) -> Result<(), LogError> {
        self.write_entries(&[(key, value.to_vec())])
    }

    fn append_batch(&self, entries: &[LogRecord]) -> Result<(), LogError> {
        self.write_entries(entries)?;
        debug!(entries = entries.len(), "Appended batch");
        Ok(())
    }

    fn scan_range(&self, start: LogKey, end: LogKey) -> BoxedScan<'_> {
        Box::new(self.scan(start, end))
    }

    fn last_key(&self) -> Option<LogKey> {
        self.lock().index.keys().next_back().copied()
    }

    fn close(&self) -> Result<(), LogError> {
        let mut inner = self.lock();
        if let Some(mut writer) = inner.writer.take() {
            let segment = writer.segment();
            writer
                .sync()
                .map_err(|e| LogError::from_frame(e, FramePosition { segment, offset: 0 }))?;
            info!(
                entries = inner.index.len(),
                frames_written = inner.frames_written,
                "Durable log closed"
            );
        }
        Ok(())
    }

    fn log_stats(&self) -> Option<LogStats> {
        match self.stats() {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Failed to read log stats");
                None
            }
        }
    }
}

impl Drop for DurableLog {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close durable log on drop");
        }
    }
}

// ── Range Scan ──────────────────────────────────────────────────────

/// Lazy ascending scan over a key range.
///
/// Each step re-consults the index, so entries appended behind the cursor
/// are not revisited and entries appended ahead of it are picked up.
/// `last_key()` lets a caller resume with `scan(last.successor(), end)`.
pub struct LogScan<'a> {
    log: &'a DurableLog,
    next_from: Option<LogKey>,
    end_ts: u64,
    last_key: Option<LogKey>,
    source: Option<(u64, BufReader<File>)>,
    cached: Option<(FramePosition, Vec<LogRecord>)>,
}

impl LogScan<'_> {
    /// Last key yielded by this scan.
    pub fn last_key(&self) -> Option<LogKey> {
        self.last_key
    }

    fn fetch(&mut self, key: LogKey, loc: Location) -> Result<Vec<u8>, LogError> {
        let cache_hit = matches!(&self.cached, Some((pos, _)) if *pos == loc.frame);
        if !cache_hit {
            let reopen = !matches!(&self.source, Some((seg, _)) if *seg == loc.frame.segment);
            if reopen {
                let path = segment_path(&self.log.config.dir, loc.frame.segment);
                self.source = Some((loc.frame.segment, BufReader::new(File::open(path)?)));
            }
            let (_, source) = self.source.as_mut().ok_or(LogError::Closed)?;
            let entries = read_frame_at(source, loc.frame.offset)
                .map_err(|e| LogError::from_frame(e, loc.frame))?;
            self.cached = Some((loc.frame, entries));
        }

        let (_, entries) = self.cached.as_ref().ok_or(LogError::Closed)?;
        match entries.get(loc.slot as usize) {
            Some((stored_key, value)) if *stored_key == key => Ok(value.clone()),
            _ => Err(LogError::Corruption {
                segment: loc.frame.segment,
                offset: loc.frame.offset,
                detail: format!("index entry {} does not match frame slot {}", key, loc.slot),
            }),
        }
    }
}

impl Iterator for LogScan<'_> {
    type Item = Result<LogRecord, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next_from?;

        let (key, loc) = match self.log.locate_from(from) {
            Ok(Some(found)) => found,
            Ok(None) => {
                self.next_from = None;
                return None;
            }
            Err(e) => {
                self.next_from = None;
                return Some(Err(e));
            }
        };

        if key.timestamp() > self.end_ts {
            self.next_from = None;
            return None;
        }

        match self.fetch(key, loc) {
            Ok(value) => {
                self.next_from = key.successor();
                self.last_key = Some(key);
                Some(Ok((key, value)))
            }
            Err(e) => {
                self.next_from = None;
                Some(Err(e))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
