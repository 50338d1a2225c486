//! Chunk: Row Accumulator and Compression
//!
//! A chunk turns a stream of rows into one compressible block. Rows are
//! appended raw (frame included); sealing compresses the accumulated bytes
//! with LZ4 into a block the follower can decompress back into the exact
//! concatenation of appended frames.

use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use timefan_core::row::MetricRow;

/// Pluggable chunk capability; test doubles implement the same set.
pub trait ChunkWriter: Send {
    /// Appends one row. Rows flagged out of range write nothing.
    fn write(&mut self, row: &MetricRow);

    /// True once the accumulated raw bytes reach the configured threshold.
    fn is_full(&self) -> bool;

    /// Accumulated raw bytes.
    fn size(&self) -> usize;

    /// Seals the chunk: compresses everything written so far and resets to
    /// empty. `None` when nothing was written.
    fn compress(&mut self) -> Result<Option<CompressedChunk>>;
}

/// Default chunk implementation backed by one growable buffer.
#[derive(Debug)]
pub struct Chunk {
    buf: BytesMut,
    max_size: usize,
}

impl Chunk {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_size.min(1024 * 1024)),
            max_size,
        }
    }
}

impl ChunkWriter for Chunk {
    fn write(&mut self, row: &MetricRow) {
        row.write_raw_to(&mut self.buf);
    }

    fn is_full(&self) -> bool {
        self.buf.len() >= self.max_size
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn compress(&mut self) -> Result<Option<CompressedChunk>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        let compressed = lz4_flex::compress_prepend_size(&self.buf);
        self.buf.clear();
        Ok(Some(CompressedChunk::new(Bytes::from(compressed))))
    }
}

/// A sealed, compressed block. Owned by exactly one stage at a time: the
/// family channel hands it to the fan-out queue, which assumes ownership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedChunk(Bytes);

impl CompressedChunk {
    pub fn new(data: Bytes) -> Self {
        Self(data)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    /// Recovers the concatenated row frames. Fails on a corrupt block.
    pub fn decompress(&self) -> Result<Bytes> {
        let raw = lz4_flex::decompress_size_prepended(&self.0).map_err(Error::from)?;
        Ok(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timefan_core::row::{RowBuilder, SimpleFieldType};

    fn row(name: &str, ts: i64) -> MetricRow {
        let mut builder = RowBuilder::new();
        builder.metric_name(name.as_bytes()).timestamp(ts);
        builder.simple_field(b"v", SimpleFieldType::Gauge, 1.0).unwrap();
        MetricRow::from_block(builder.build().unwrap()).unwrap()
    }

    #[test]
    fn test_compress_roundtrip_is_lossless() {
        let mut chunk = Chunk::new(1024 * 1024);
        let mut expected = BytesMut::new();
        for i in 0..10 {
            let r = row(&format!("metric-{i}"), i);
            r.write_raw_to(&mut expected);
            chunk.write(&r);
        }
        let sealed = chunk.compress().unwrap().unwrap();
        assert_eq!(sealed.decompress().unwrap(), expected.freeze());
    }

    #[test]
    fn test_compress_resets_chunk() {
        let mut chunk = Chunk::new(1024);
        chunk.write(&row("m", 1));
        assert!(chunk.size() > 0);
        chunk.compress().unwrap().unwrap();
        assert_eq!(chunk.size(), 0);
        assert!(chunk.compress().unwrap().is_none());
    }

    #[test]
    fn test_empty_chunk_compresses_to_none() {
        let mut chunk = Chunk::new(1024);
        assert!(chunk.compress().unwrap().is_none());
    }

    #[test]
    fn test_is_full_tracks_threshold() {
        let r = row("m", 1);
        let mut chunk = Chunk::new(r.size_bytes() * 3);
        chunk.write(&r);
        chunk.write(&r);
        assert!(!chunk.is_full());
        chunk.write(&r);
        assert!(chunk.is_full());
    }

    #[test]
    fn test_evicted_rows_do_not_accumulate() {
        let mut evicted = row("m", 1);
        evicted.out_of_time_range = true;
        let mut chunk = Chunk::new(1024);
        chunk.write(&evicted);
        assert_eq!(chunk.size(), 0);
    }

    #[test]
    fn test_compress_is_pure_function_of_rows() {
        let build = || {
            let mut chunk = Chunk::new(1024 * 1024);
            for i in 0..5 {
                chunk.write(&row("m", i));
            }
            chunk.compress().unwrap().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_corrupt_block_fails_decompression() {
        let mut chunk = Chunk::new(1024);
        chunk.write(&row("m", 1));
        let sealed = chunk.compress().unwrap().unwrap();
        let mut raw = sealed.into_bytes().to_vec();
        raw.truncate(raw.len() / 2);
        let corrupt = CompressedChunk::new(Bytes::from(raw));
        assert!(corrupt.decompress().is_err());
    }
}
