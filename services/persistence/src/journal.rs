//! Journal Writer — Append-only segment writer with checksummed frames
//!
//! Every append (single entry or batch) becomes one frame, so a batch is
//! either fully recovered or fully discarded after a crash.
//!
//! # Binary Format (per frame)
//! ```text
//! [body_len: u32]
//! [flags:    u8]    // bit 0: body is zstd-compressed
//! [checksum: u32]   // CRC32C over the stored body bytes
//! [body:     body_len bytes]
//!
//! body (after decompression):
//! [entry_count: u32]
//! { [key: 16 bytes][value_len: u32][value: bytes] } * entry_count
//! ```

use crc32c::crc32c;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::key::{LogKey, LOG_KEY_LEN};

/// Frame header: body_len + flags + checksum.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 4;
/// Frame flag: body is zstd-compressed.
pub const FLAG_ZSTD: u8 = 0x01;
/// Upper bound on a stored frame body; anything larger is treated as corruption.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Incomplete frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Implausible frame body length: {0} (likely corruption)")]
    Implausible(usize),

    #[error("Checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Malformed frame body: {0}")]
    Malformed(String),
}

// ── Frame Encoding ──────────────────────────────────────────────────

/// Compression settings for frame bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compression {
    /// zstd level.
    pub level: i32,
    /// Bodies shorter than this are stored raw.
    pub min_bytes: usize,
}

impl Default for Compression {
    fn default() -> Self {
        Self {
            level: 3,
            min_bytes: 512,
        }
    }
}

/// Serialize a batch of entries into one frame.
///
/// The body is compressed when it is at least `min_bytes` long and zstd
/// actually shrinks it.
pub fn encode_frame(
    entries: &[(LogKey, Vec<u8>)],
    compression: Compression,
) -> Result<Vec<u8>, FrameError> {
    let raw_len: usize = 4 + entries
        .iter()
        .map(|(_, v)| LOG_KEY_LEN + 4 + v.len())
        .sum::<usize>();

    let mut body = Vec::with_capacity(raw_len);
    body.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (key, value) in entries {
        body.extend_from_slice(key.as_bytes());
        body.extend_from_slice(&(value.len() as u32).to_le_bytes());
        body.extend_from_slice(value);
    }

    let mut flags = 0u8;
    if body.len() >= compression.min_bytes {
        let compressed = zstd::encode_all(body.as_slice(), compression.level)
            .map_err(|e| FrameError::Compression(e.to_string()))?;
        if compressed.len() < body.len() {
            body = compressed;
            flags |= FLAG_ZSTD;
        }
    }

    if body.len() > MAX_FRAME_BODY {
        return Err(FrameError::Implausible(body.len()));
    }

    let checksum = crc32c(&body);
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.push(flags);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub body_len: usize,
    pub flags: u8,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(FrameError::Truncated {
                need: FRAME_HEADER_LEN,
                have: data.len(),
            });
        }
        let body_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if body_len > MAX_FRAME_BODY {
            return Err(FrameError::Implausible(body_len));
        }
        let flags = data[4];
        let checksum = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
        Ok(Self {
            body_len,
            flags,
            checksum,
        })
    }
}

/// Verify and unpack a stored frame body.
pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Vec<(LogKey, Vec<u8>)>, FrameError> {
    if body.len() != header.body_len {
        return Err(FrameError::Truncated {
            need: header.body_len,
            have: body.len(),
        });
    }

    let computed = crc32c(body);
    if computed != header.checksum {
        return Err(FrameError::ChecksumMismatch {
            stored: header.checksum,
            computed,
        });
    }

    let raw;
    let body = if header.flags & FLAG_ZSTD != 0 {
        raw = zstd::decode_all(body).map_err(|e| FrameError::Compression(e.to_string()))?;
        raw.as_slice()
    } else {
        body
    };

    if body.len() < 4 {
        return Err(FrameError::Malformed("missing entry count".into()));
    }
    let count = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let mut pos = 4;
    let mut entries = Vec::with_capacity(count.min(4096));

    for i in 0..count {
        if pos + LOG_KEY_LEN + 4 > body.len() {
            return Err(FrameError::Malformed(format!(
                "entry {} header exceeds body ({} bytes)",
                i,
                body.len()
            )));
        }
        let key = LogKey::from_slice(&body[pos..pos + LOG_KEY_LEN])
            .ok_or_else(|| FrameError::Malformed("bad key".into()))?;
        pos += LOG_KEY_LEN;

        let value_len =
            u32::from_le_bytes([body[pos], body[pos + 1], body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;

        if pos + value_len > body.len() {
            return Err(FrameError::Malformed(format!(
                "entry {} value_len {} exceeds remaining body ({} bytes)",
                i,
                value_len,
                body.len() - pos
            )));
        }
        entries.push((key, body[pos..pos + value_len].to_vec()));
        pos += value_len;
    }

    if pos != body.len() {
        return Err(FrameError::Malformed(format!(
            "{} trailing bytes after {} entries",
            body.len() - pos,
            count
        )));
    }

    Ok(entries)
}

/// Decode one complete frame from the start of `data`.
///
/// Returns `(entries, bytes_consumed)`.
pub fn decode_frame(data: &[u8]) -> Result<(Vec<(LogKey, Vec<u8>)>, usize), FrameError> {
    let header = FrameHeader::parse(data)?;
    let total = FRAME_HEADER_LEN + header.body_len;
    if data.len() < total {
        return Err(FrameError::Truncated {
            need: total,
            have: data.len(),
        });
    }
    let entries = decode_body(&header, &data[FRAME_HEADER_LEN..total])?;
    Ok((entries, total))
}

// ── Flush / Fsync Policies ──────────────────────────────────────────

/// Controls when buffered data is flushed to OS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlushPolicy {
    /// Flush after every write.
    EveryWrite,
    /// Flush every N writes.
    EveryN(usize),
}

/// Controls when `fsync` (durable write) is called.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    EveryWrite,
    /// Fsync every N writes.
    EveryN(usize),
    /// Fsync only on segment rotation and close.
    OnRotation,
}

/// Configuration for the segment writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory for segment files.
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation.
    pub max_segment_bytes: u64,
    pub flush_policy: FlushPolicy,
    pub fsync_policy: FsyncPolicy,
}

/// Position of a frame on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePosition {
    pub segment: u64,
    pub offset: u64,
}

// ── Segment Writer ──────────────────────────────────────────────────

/// Append-only segment writer with rotation and flush/fsync control.
pub struct SegmentWriter {
    config: WriterConfig,
    writer: BufWriter<File>,
    segment: u64,
    segment_size: u64,
    /// Bytes of the active segment handed to the OS (readable by other handles).
    flushed_size: u64,
    writes_since_flush: usize,
    writes_since_fsync: usize,
}

impl SegmentWriter {
    /// Open segment `segment` for appending, creating the directory if needed.
    pub fn open(config: WriterConfig, segment: u64) -> Result<Self, FrameError> {
        fs::create_dir_all(&config.dir)?;
        let path = segment_path(&config.dir, segment);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let segment_size = file.metadata()?.len();

        Ok(Self {
            config,
            writer: BufWriter::new(file),
            segment,
            segment_size,
            flushed_size: segment_size,
            writes_since_flush: 0,
            writes_since_fsync: 0,
        })
    }

    /// Active segment id.
    pub fn segment(&self) -> u64 {
        self.segment
    }

    /// Append an encoded frame, rotating first if the segment is full.
    pub fn write_frame(&mut self, frame: &[u8]) -> Result<FramePosition, FrameError> {
        if self.segment_size > 0 && self.segment_size >= self.config.max_segment_bytes {
            self.rotate()?;
        }

        let position = FramePosition {
            segment: self.segment,
            offset: self.segment_size,
        };
        self.writer.write_all(frame)?;
        self.segment_size += frame.len() as u64;
        self.writes_since_flush += 1;
        self.writes_since_fsync += 1;

        self.apply_flush_policy()?;
        self.apply_fsync_policy()?;
        Ok(position)
    }

    /// Make sure the frame at `position` is visible to readers.
    pub fn ensure_readable(&mut self, position: FramePosition) -> Result<(), FrameError> {
        if position.segment == self.segment && position.offset >= self.flushed_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush buffered bytes to the OS.
    pub fn flush(&mut self) -> Result<(), FrameError> {
        self.writer.flush()?;
        self.flushed_size = self.segment_size;
        self.writes_since_flush = 0;
        Ok(())
    }

    /// Force flush + fsync (used before shutdown / rotation).
    pub fn sync(&mut self) -> Result<(), FrameError> {
        self.flush()?;
        self.writer.get_ref().sync_all()?;
        self.writes_since_fsync = 0;
        Ok(())
    }

    // ── Internal Helpers ────────────────────────────────────────────

    fn apply_flush_policy(&mut self) -> Result<(), FrameError> {
        let should_flush = match self.config.flush_policy {
            FlushPolicy::EveryWrite => true,
            FlushPolicy::EveryN(n) => self.writes_since_flush >= n,
        };
        if should_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn apply_fsync_policy(&mut self) -> Result<(), FrameError> {
        let should_fsync = match self.config.fsync_policy {
            FsyncPolicy::EveryWrite => true,
            FsyncPolicy::EveryN(n) => self.writes_since_fsync >= n,
            FsyncPolicy::OnRotation => false,
        };
        if should_fsync {
            self.sync()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), FrameError> {
        self.sync()?;

        self.segment += 1;
        let path = segment_path(&self.config.dir, self.segment);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        self.writer = BufWriter::new(file);
        self.segment_size = 0;
        self.flushed_size = 0;
        tracing::debug!(segment = self.segment, "Rotated log segment");
        Ok(())
    }
}

/// Path of segment `index` inside `dir`.
pub fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal-{:06}.log", index))
}

/// Segment ids present in `dir`, ascending.
pub fn discover_segments(dir: &Path) -> io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if let Some(id) = name
            .strip_prefix("wal-")
            .and_then(|rest| rest.strip_suffix(".log"))
            .and_then(|n| n.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

// ── Tests ───────────────────────────────────────────────────────────
