//! Segment Reader — Sequential frame reader with corruption detection
//!
//! Features:
//! - Sequential frame reading from one segment file
//! - CRC32C checksum validation on every frame
//! - Corruption detection with byte-offset reporting
//! - Partial recovery: stop at a corrupted or torn frame, keep the valid prefix
//! - Random access to a single frame for range scans

use crate::journal::{decode_body, FrameError, FrameHeader, FRAME_HEADER_LEN};
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use types::key::LogKey;

// ── Corruption Log Entry ────────────────────────────────────────────

/// Structured corruption record for diagnostics.
#[derive(Debug, Clone)]
pub struct CorruptionRecord {
    /// Byte offset in the segment where corruption was detected.
    pub byte_offset: u64,
    pub kind: CorruptionKind,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CorruptionKind {
    ChecksumMismatch,
    TruncatedFrame,
    MalformedBody,
}

/// A frame read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadFrame {
    /// Byte offset of the frame header within the segment.
    pub offset: u64,
    pub entries: Vec<(LogKey, Vec<u8>)>,
}

// ── Segment Reader ──────────────────────────────────────────────────

/// Sequential reader over the frames of one segment.
pub struct SegmentReader {
    reader: BufReader<File>,
    file_len: u64,
    /// Offset of the next frame to read.
    offset: u64,
    corruption: Option<CorruptionRecord>,
}

impl SegmentReader {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            file_len,
            offset: 0,
            corruption: None,
        })
    }

    /// Read the next valid frame.
    ///
    /// Returns `None` at the clean end of the segment or at the first
    /// corrupted frame; in the latter case `corruption()` describes it and
    /// `valid_len()` marks the end of the trustworthy prefix.
    pub fn next_frame(&mut self) -> io::Result<Option<ReadFrame>> {
        if self.corruption.is_some() || self.offset >= self.file_len {
            return Ok(None);
        }

        let remaining = self.file_len - self.offset;
        if remaining < FRAME_HEADER_LEN as u64 {
            self.mark(CorruptionKind::TruncatedFrame, format!(
                "Torn frame header: {} bytes remaining",
                remaining
            ));
            return Ok(None);
        }

        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        self.reader.read_exact(&mut header_buf)?;
        let header = match FrameHeader::parse(&header_buf) {
            Ok(h) => h,
            Err(e) => {
                self.mark(CorruptionKind::MalformedBody, e.to_string());
                return Ok(None);
            }
        };

        let frame_len = (FRAME_HEADER_LEN + header.body_len) as u64;
        if remaining < frame_len {
            self.mark(CorruptionKind::TruncatedFrame, format!(
                "Torn frame: need {} bytes, {} remaining",
                frame_len, remaining
            ));
            return Ok(None);
        }

        let mut body = vec![0u8; header.body_len];
        self.reader.read_exact(&mut body)?;

        match decode_body(&header, &body) {
            Ok(entries) => {
                let frame = ReadFrame {
                    offset: self.offset,
                    entries,
                };
                self.offset += frame_len;
                Ok(Some(frame))
            }
            Err(FrameError::ChecksumMismatch { stored, computed }) => {
                self.mark(CorruptionKind::ChecksumMismatch, format!(
                    "CRC32C mismatch: stored={:#010x}, computed={:#010x}",
                    stored, computed
                ));
                Ok(None)
            }
            Err(e) => {
                self.mark(CorruptionKind::MalformedBody, e.to_string());
                Ok(None)
            }
        }
    }

    /// Length of the valid frame prefix read so far.
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    /// Corruption that stopped the reader, if any.
    pub fn corruption(&self) -> Option<&CorruptionRecord> {
        self.corruption.as_ref()
    }

    fn mark(&mut self, kind: CorruptionKind, detail: String) {
        self.corruption = Some(CorruptionRecord {
            byte_offset: self.offset,
            kind,
            detail,
        });
    }
}

/// Read the single frame whose header starts at `offset`.
pub fn read_frame_at<R: Read + Seek>(
    source: &mut R,
    offset: u64,
) -> Result<Vec<(LogKey, Vec<u8>)>, FrameError> {
    source.seek(SeekFrom::Start(offset))?;
    let mut header_buf = [0u8; FRAME_HEADER_LEN];
    source.read_exact(&mut header_buf)?;
    let header = FrameHeader::parse(&header_buf)?;
    let mut body = vec![0u8; header.body_len];
    source.read_exact(&mut body)?;
    decode_body(&header, &body)
}

// ── Tests ───────────────────────────────────────────────────────────
