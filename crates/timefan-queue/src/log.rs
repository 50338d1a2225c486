//! Segmented Append-Only Data Log
//!
//! On-disk layout: one file per segment under the queue directory, named by
//! the base sequence it starts at (`{base_seq:020}.seg`). Each file is a run
//! of checksummed entries:
//!
//! ```text
//! ┌────────────┬──────────┬──────────┐
//! │ Entry Size │ CRC32    │ Payload  │
//! │ (4 bytes)  │ (4 bytes)│ (N bytes)│
//! └────────────┴──────────┴──────────┘
//! ```
//!
//! Recovery re-reads every segment; a torn or checksum-failing tail entry on
//! the newest segment is truncated away (a crash mid-append), anywhere else
//! it is corruption and open fails. Entries stay cached in memory until the
//! segment is reclaimed — blocks only live until every consumer acks them,
//! so the cache is bounded by the un-acked window.

use crate::error::{Error, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const ENTRY_HEADER: usize = 8;
const SEGMENT_SUFFIX: &str = ".seg";

pub(crate) struct Segment {
    base_seq: i64,
    path: PathBuf,
    entries: Vec<Bytes>,
    size_bytes: u64,
}

impl Segment {
    fn last_seq(&self) -> i64 {
        self.base_seq + self.entries.len() as i64 - 1
    }
}

pub(crate) struct AppendLog {
    dir: PathBuf,
    segment_max_size: u64,
    sync_on_append: bool,
    segments: Vec<Segment>,
    /// Next sequence to assign.
    append_seq: i64,
    active_file: Option<File>,
}

impl AppendLog {
    pub(crate) async fn open(
        dir: impl AsRef<Path>,
        segment_max_size: u64,
        sync_on_append: bool,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut bases = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) {
                let base: i64 = stem
                    .parse()
                    .map_err(|_| Error::InvalidSegmentName(name.clone()))?;
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len());
        let count = bases.len();
        for (idx, base) in bases.into_iter().enumerate() {
            let is_last = idx + 1 == count;
            segments.push(Self::recover_segment(&dir, base, is_last).await?);
        }

        let append_seq = segments.last().map(|s| s.last_seq() + 1).unwrap_or(0);
        info!(
            dir = ?dir,
            segments = segments.len(),
            append_seq,
            "append log opened"
        );

        Ok(Self {
            dir,
            segment_max_size,
            sync_on_append,
            segments,
            append_seq,
            active_file: None,
        })
    }

    async fn recover_segment(dir: &Path, base_seq: i64, allow_torn_tail: bool) -> Result<Segment> {
        let path = segment_path(dir, base_seq);
        let raw = tokio::fs::read(&path).await?;
        let mut entries = Vec::new();
        let mut pos = 0usize;

        while pos < raw.len() {
            if pos + ENTRY_HEADER > raw.len() {
                break; // torn header
            }
            let len = u32::from_le_bytes(raw[pos..pos + 4].try_into().unwrap()) as usize;
            let crc = u32::from_le_bytes(raw[pos + 4..pos + 8].try_into().unwrap());
            let start = pos + ENTRY_HEADER;
            if start + len > raw.len() {
                break; // torn payload
            }
            let payload = &raw[start..start + len];
            if crc32fast::hash(payload) != crc {
                break; // checksum failure, treat the rest as garbage
            }
            entries.push(Bytes::copy_from_slice(payload));
            pos = start + len;
        }

        if pos < raw.len() {
            if !allow_torn_tail {
                return Err(Error::Corrupted {
                    path: path.display().to_string(),
                    reason: format!("bad entry at offset {pos} in a sealed segment"),
                });
            }
            warn!(
                path = ?path,
                valid_bytes = pos,
                dropped_bytes = raw.len() - pos,
                "truncating torn tail entry after crash"
            );
            let file = OpenOptions::new().write(true).open(&path).await?;
            file.set_len(pos as u64).await?;
            file.sync_all().await?;
        }

        Ok(Segment {
            base_seq,
            path,
            entries,
            size_bytes: pos as u64,
        })
    }

    /// Appends one block; returns its strictly increasing sequence.
    pub(crate) async fn append(&mut self, payload: Bytes) -> Result<i64> {
        self.ensure_active_segment().await?;

        let mut frame = Vec::with_capacity(ENTRY_HEADER + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        let file = self.active_file.as_mut().expect("active segment file");
        file.write_all(&frame).await?;
        if self.sync_on_append {
            file.sync_data().await?;
        }

        let segment = self.segments.last_mut().expect("active segment");
        segment.entries.push(payload);
        segment.size_bytes += frame.len() as u64;

        let seq = self.append_seq;
        self.append_seq += 1;
        debug!(seq, bytes = frame.len(), "appended block");
        Ok(seq)
    }

    async fn ensure_active_segment(&mut self) -> Result<()> {
        let needs_roll = match self.segments.last() {
            None => true,
            // a gap after set_append_seq also forces a fresh segment
            Some(seg) => {
                seg.size_bytes >= self.segment_max_size
                    || seg.base_seq + seg.entries.len() as i64 != self.append_seq
                    || self.active_file.is_none()
            }
        };
        if !needs_roll {
            return Ok(());
        }

        let roll_new = match self.segments.last() {
            Some(seg) if seg.base_seq + (seg.entries.len() as i64) == self.append_seq => {
                // same segment, just a missing file handle (first append after open)
                seg.size_bytes >= self.segment_max_size
            }
            _ => true,
        };

        if roll_new {
            let base = self.append_seq;
            let path = segment_path(&self.dir, base);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            debug!(base, path = ?path, "rolled new segment");
            self.segments.push(Segment {
                base_seq: base,
                path,
                entries: Vec::new(),
                size_bytes: 0,
            });
            self.active_file = Some(file);
        } else {
            let seg = self.segments.last().expect("segment");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&seg.path)
                .await?;
            self.active_file = Some(file);
        }
        Ok(())
    }

    /// Block at `seq`; blocks inside a gap or already reclaimed are out of
    /// range.
    pub(crate) fn get(&self, seq: i64) -> Result<Bytes> {
        let out_of_range = || Error::SeqOutOfRange {
            seq,
            tail: self.tail_seq(),
            append: self.append_seq,
        };
        let idx = self
            .segments
            .partition_point(|s| s.base_seq <= seq)
            .checked_sub(1)
            .ok_or_else(out_of_range)?;
        let segment = &self.segments[idx];
        let offset = (seq - segment.base_seq) as usize;
        segment.entries.get(offset).cloned().ok_or_else(out_of_range)
    }

    /// Smallest retained sequence (== append_seq when empty).
    pub(crate) fn tail_seq(&self) -> i64 {
        self.segments
            .first()
            .map(|s| s.base_seq)
            .unwrap_or(self.append_seq)
    }

    /// Next sequence to assign.
    pub(crate) fn append_seq(&self) -> i64 {
        self.append_seq
    }

    /// Skips the append position forward (leader lost data and the follower
    /// is ahead). The next append starts a fresh segment at `seq`.
    pub(crate) fn set_append_seq(&mut self, seq: i64) {
        if seq == self.append_seq {
            return;
        }
        info!(from = self.append_seq, to = seq, "append sequence moved");
        self.append_seq = seq;
        self.active_file = None;
    }

    /// Drops whole segments whose every entry is ≤ `min_ack`. The newest
    /// segment is always kept so the append position survives.
    pub(crate) async fn reclaim(&mut self, min_ack: i64) -> Result<usize> {
        let mut removed = 0;
        while self.segments.len() > 1 {
            let first = &self.segments[0];
            if first.last_seq() > min_ack {
                break;
            }
            let seg = self.segments.remove(0);
            tokio::fs::remove_file(&seg.path).await?;
            debug!(base = seg.base_seq, last = seg.last_seq(), "reclaimed segment");
            removed += 1;
        }
        Ok(removed)
    }

    pub(crate) async fn sync(&mut self) -> Result<()> {
        if let Some(file) = self.active_file.as_mut() {
            file.sync_data().await?;
        }
        Ok(())
    }
}

fn segment_path(dir: &Path, base_seq: i64) -> PathBuf {
    dir.join(format!("{base_seq:020}{SEGMENT_SUFFIX}"))
}
