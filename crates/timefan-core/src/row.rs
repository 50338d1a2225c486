//! Flat Metric Row Encoding
//!
//! This module defines the broker's wire unit: a metric row as a single
//! size-prefixed byte block. The block is built once at the ingestion
//! boundary and from then on travels as opaque bytes — into chunks, through
//! compression, over the replication stream — with only two hot accessors
//! (`timestamp`, `hash`) read in place.
//!
//! ## Frame Layout
//!
//! ```text
//! ┌───────────┬──────────┬─────────────┬───────────────────────────────┐
//! │ size      │ hash     │ timestamp   │ name_len + name               │
//! │ (u32 LE)  │ (u64 LE) │ (i64 LE)    │ (u16 LE + bytes)              │
//! └───────────┴──────────┴─────────────┴───────────────────────────────┘
//! ┌───────────────────────────┬────────────────────────────┬──────────┐
//! │ tag_count + tags          │ field_count + simple fields│ compound │
//! │ (u16 + klen,k,vlen,v ...) │ (u16 + type,nlen,n,f64 ...)│ (u8 ...) │
//! └───────────────────────────┴────────────────────────────┴──────────┘
//! ```
//!
//! The size prefix covers everything after itself. The series hash is
//! xxhash64 over `name ‖ canonical-tag-bytes` (tags sorted by key, rendered
//! as `,k=v`), precomputed by the builder so shard routing never re-hashes.
//!
//! ## Design Decisions
//!
//! - Rows are `Bytes`-backed for zero-copy hand-off between pipeline stages
//! - Tags are canonicalized (sorted, last value wins) at build time so equal
//!   series always produce equal hashes
//! - The out-of-time-range flag is broker-local state, never serialized: a
//!   flagged row reports size 0 and writes nothing

use crate::error::{Error, Result};
use crate::models::ShardId;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use twox_hash::XxHash64;

/// Seed for series hashing; shared by the builder and the metric registry.
pub const SERIES_HASH_SEED: u64 = 0;

/// Hard cap on a single encoded row, matching the u32 frame prefix with
/// plenty of headroom.
pub const MAX_ROW_SIZE: usize = 16 * 1024 * 1024;

const FRAME_PREFIX: usize = 4;
const HASH_OFFSET: usize = FRAME_PREFIX;
const TIMESTAMP_OFFSET: usize = FRAME_PREFIX + 8;
const HEADER_SIZE: usize = 8 + 8;

/// Type of a simple (single-value) field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SimpleFieldType {
    Gauge = 1,
    DeltaSum = 2,
    Min = 3,
    Max = 4,
}

impl TryFrom<u8> for SimpleFieldType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SimpleFieldType::Gauge),
            2 => Ok(SimpleFieldType::DeltaSum),
            3 => Ok(SimpleFieldType::Min),
            4 => Ok(SimpleFieldType::Max),
            other => Err(Error::UnknownFieldType(other)),
        }
    }
}

/// A decoded simple field.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleField {
    pub name: Bytes,
    pub field_type: SimpleFieldType,
    pub value: f64,
}

/// One bucket of a compound (histogram) field: upper bound and count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramBucket {
    pub upper: f64,
    pub count: f64,
}

/// Builds one flat metric row. Reusable: `reset` clears all state so a single
/// builder can encode a whole batch without reallocating.
#[derive(Debug, Default)]
pub struct RowBuilder {
    name: Vec<u8>,
    timestamp: i64,
    tags: BTreeMap<Vec<u8>, Vec<u8>>,
    simple_fields: Vec<(Vec<u8>, SimpleFieldType, f64)>,
    compound: Vec<HistogramBucket>,
}

impl RowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.name.clear();
        self.timestamp = 0;
        self.tags.clear();
        self.simple_fields.clear();
        self.compound.clear();
    }

    pub fn metric_name(&mut self, name: &[u8]) -> &mut Self {
        self.name.clear();
        self.name.extend_from_slice(name);
        self
    }

    pub fn timestamp(&mut self, ts: i64) -> &mut Self {
        self.timestamp = ts;
        self
    }

    /// Adds one tag. Tags are canonicalized: sorted by key, last value wins.
    pub fn tag(&mut self, key: &[u8], value: &[u8]) -> &mut Self {
        self.tags.insert(key.to_vec(), value.to_vec());
        self
    }

    pub fn simple_field(
        &mut self,
        name: &[u8],
        field_type: SimpleFieldType,
        value: f64,
    ) -> Result<&mut Self> {
        if name.is_empty() {
            return Err(Error::EmptyFieldName);
        }
        self.simple_fields.push((name.to_vec(), field_type, value));
        Ok(self)
    }

    pub fn compound_field(&mut self, buckets: &[HistogramBucket]) -> &mut Self {
        self.compound.clear();
        self.compound.extend_from_slice(buckets);
        self
    }

    /// Series hash of the current name + canonical tags. Stable across
    /// builds: equal (name, tags) always hash equal.
    pub fn series_hash(&self) -> u64 {
        series_hash(&self.name, self.tags.iter().map(|(k, v)| (&k[..], &v[..])))
    }

    /// Encodes the row as a size-prefixed frame appended to `dst`.
    pub fn build_into(&self, dst: &mut BytesMut) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::EmptyMetricName);
        }
        if self.simple_fields.is_empty() && self.compound.is_empty() {
            return Err(Error::NoFields);
        }

        let mark = dst.len();
        dst.put_u32_le(0); // patched below
        dst.put_u64_le(self.series_hash());
        dst.put_i64_le(self.timestamp);

        dst.put_u16_le(self.name.len() as u16);
        dst.put_slice(&self.name);

        dst.put_u16_le(self.tags.len() as u16);
        for (k, v) in &self.tags {
            dst.put_u16_le(k.len() as u16);
            dst.put_slice(k);
            dst.put_u16_le(v.len() as u16);
            dst.put_slice(v);
        }

        dst.put_u16_le(self.simple_fields.len() as u16);
        for (name, field_type, value) in &self.simple_fields {
            dst.put_u8(*field_type as u8);
            dst.put_u16_le(name.len() as u16);
            dst.put_slice(name);
            dst.put_f64_le(*value);
        }

        if self.compound.is_empty() {
            dst.put_u8(0);
        } else {
            dst.put_u8(1);
            dst.put_u16_le(self.compound.len() as u16);
            for bucket in &self.compound {
                dst.put_f64_le(bucket.upper);
                dst.put_f64_le(bucket.count);
            }
        }

        let payload = dst.len() - mark - FRAME_PREFIX;
        if payload > MAX_ROW_SIZE {
            dst.truncate(mark);
            return Err(Error::RowTooLarge(payload));
        }
        dst[mark..mark + FRAME_PREFIX].copy_from_slice(&(payload as u32).to_le_bytes());
        Ok(())
    }

    /// Encodes the row as a standalone frame.
    pub fn build(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.build_into(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// One flat-encoded metric row plus broker-local routing state.
///
/// The buffer holds the full frame (size prefix included), so `write_raw_to`
/// emits bytes a downstream decoder can re-split without help.
#[derive(Debug, Clone)]
pub struct MetricRow {
    buf: Bytes,
    /// Shard stamped by the batch's shard-group iterator.
    pub shard_id: ShardId,
    /// Rows outside the accepted time window are flagged, not removed: they
    /// keep their batch slot but report size 0 and write nothing.
    pub out_of_time_range: bool,
}

impl MetricRow {
    /// Wraps and validates one framed block.
    pub fn from_block(buf: Bytes) -> Result<Self> {
        Self::validate(&buf)?;
        Ok(Self {
            buf,
            shard_id: 0,
            out_of_time_range: false,
        })
    }

    fn validate(buf: &Bytes) -> Result<()> {
        if buf.len() < FRAME_PREFIX + HEADER_SIZE {
            return Err(Error::TruncatedRow {
                need: FRAME_PREFIX + HEADER_SIZE,
                have: buf.len(),
            });
        }
        let declared = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        if buf.len() != FRAME_PREFIX + declared {
            return Err(Error::InvalidFrame(format!(
                "size prefix {} does not match payload {}",
                declared,
                buf.len() - FRAME_PREFIX
            )));
        }
        // Walk the full layout once so accessors can slice without checks.
        let mut cur = &buf[FRAME_PREFIX + HEADER_SIZE..];
        let name_len = read_u16(&mut cur)? as usize;
        if name_len == 0 {
            return Err(Error::EmptyMetricName);
        }
        skip(&mut cur, name_len)?;
        let tag_count = read_u16(&mut cur)?;
        for _ in 0..tag_count {
            let klen = read_u16(&mut cur)? as usize;
            skip(&mut cur, klen)?;
            let vlen = read_u16(&mut cur)? as usize;
            skip(&mut cur, vlen)?;
        }
        let field_count = read_u16(&mut cur)?;
        for _ in 0..field_count {
            let ft = read_u8(&mut cur)?;
            SimpleFieldType::try_from(ft)?;
            let nlen = read_u16(&mut cur)? as usize;
            skip(&mut cur, nlen)?;
            skip(&mut cur, 8)?;
        }
        let compound = read_u8(&mut cur)?;
        if compound == 1 {
            let buckets = read_u16(&mut cur)? as usize;
            skip(&mut cur, buckets * 16)?;
        } else if compound != 0 {
            return Err(Error::InvalidFrame(format!(
                "bad compound flag: {compound}"
            )));
        }
        if field_count == 0 && compound == 0 {
            return Err(Error::NoFields);
        }
        if !cur.is_empty() {
            return Err(Error::InvalidFrame(format!(
                "{} trailing bytes after row",
                cur.len()
            )));
        }
        Ok(())
    }

    /// 64-bit series hash (metric name + canonical tags).
    pub fn hash(&self) -> u64 {
        u64::from_le_bytes(self.buf[HASH_OFFSET..HASH_OFFSET + 8].try_into().unwrap())
    }

    /// Epoch-millisecond timestamp.
    pub fn timestamp(&self) -> i64 {
        i64::from_le_bytes(
            self.buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    /// Encoded size including the frame prefix; 0 once evicted.
    pub fn size_bytes(&self) -> usize {
        if self.out_of_time_range {
            0
        } else {
            self.buf.len()
        }
    }

    /// Appends the raw frame to `dst`. Evicted rows write nothing.
    pub fn write_raw_to(&self, dst: &mut BytesMut) -> usize {
        if self.out_of_time_range {
            return 0;
        }
        dst.put_slice(&self.buf);
        self.buf.len()
    }

    pub fn metric_name(&self) -> Bytes {
        let mut cur = FRAME_PREFIX + HEADER_SIZE;
        let len = self.read_u16_at(&mut cur) as usize;
        self.buf.slice(cur..cur + len)
    }

    /// Decoded tag pairs, in canonical (key-sorted) order.
    pub fn tags(&self) -> Vec<(Bytes, Bytes)> {
        let mut cur = FRAME_PREFIX + HEADER_SIZE;
        let name_len = self.read_u16_at(&mut cur) as usize;
        cur += name_len;
        let tag_count = self.read_u16_at(&mut cur);
        let mut tags = Vec::with_capacity(tag_count as usize);
        for _ in 0..tag_count {
            let klen = self.read_u16_at(&mut cur) as usize;
            let key = self.buf.slice(cur..cur + klen);
            cur += klen;
            let vlen = self.read_u16_at(&mut cur) as usize;
            let value = self.buf.slice(cur..cur + vlen);
            cur += vlen;
            tags.push((key, value));
        }
        tags
    }

    /// Decoded simple fields.
    pub fn simple_fields(&self) -> Vec<SimpleField> {
        let mut cur = self.fields_offset();
        let count = self.read_u16_at(&mut cur);
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let field_type = SimpleFieldType::try_from(self.buf[cur]).expect("validated on build");
            cur += 1;
            let nlen = self.read_u16_at(&mut cur) as usize;
            let name = self.buf.slice(cur..cur + nlen);
            cur += nlen;
            let value = f64::from_le_bytes(self.buf[cur..cur + 8].try_into().unwrap());
            cur += 8;
            fields.push(SimpleField {
                name,
                field_type,
                value,
            });
        }
        fields
    }

    /// Decoded histogram buckets, if the row carries a compound field.
    pub fn compound_field(&self) -> Option<Vec<HistogramBucket>> {
        let mut cur = self.fields_offset();
        let count = self.read_u16_at(&mut cur);
        for _ in 0..count {
            cur += 1;
            let nlen = self.read_u16_at(&mut cur) as usize;
            cur += nlen + 8;
        }
        if self.buf[cur] == 0 {
            return None;
        }
        cur += 1;
        let buckets = self.read_u16_at(&mut cur);
        let mut out = Vec::with_capacity(buckets as usize);
        for _ in 0..buckets {
            let upper = f64::from_le_bytes(self.buf[cur..cur + 8].try_into().unwrap());
            cur += 8;
            let count = f64::from_le_bytes(self.buf[cur..cur + 8].try_into().unwrap());
            cur += 8;
            out.push(HistogramBucket { upper, count });
        }
        Some(out)
    }

    fn fields_offset(&self) -> usize {
        let mut cur = FRAME_PREFIX + HEADER_SIZE;
        let name_len = self.read_u16_at(&mut cur) as usize;
        cur += name_len;
        let tag_count = self.read_u16_at(&mut cur);
        for _ in 0..tag_count {
            let klen = self.read_u16_at(&mut cur) as usize;
            cur += klen;
            let vlen = self.read_u16_at(&mut cur) as usize;
            cur += vlen;
        }
        cur
    }

    fn read_u16_at(&self, cur: &mut usize) -> u16 {
        let v = u16::from_le_bytes(self.buf[*cur..*cur + 2].try_into().unwrap());
        *cur += 2;
        v
    }
}

/// xxhash64 over `name ‖ ,k=v ...` with tags already in canonical (sorted)
/// key order. Every series key in the system — row routing and the metric
/// registry alike — goes through this one function.
pub fn series_hash<'a>(name: &[u8], tags: impl Iterator<Item = (&'a [u8], &'a [u8])>) -> u64 {
    let mut key = Vec::with_capacity(name.len() + 32);
    key.extend_from_slice(name);
    for (k, v) in tags {
        key.push(b',');
        key.extend_from_slice(k);
        key.push(b'=');
        key.extend_from_slice(v);
    }
    XxHash64::oneshot(SERIES_HASH_SEED, &key)
}

/// Splits a payload of back-to-back size-prefixed frames into row blocks.
///
/// Each yielded `Bytes` is one full frame (prefix included), ready for
/// `MetricRow::from_block`. Iteration stops with an error on a torn or
/// oversized frame.
pub struct FrameIter {
    payload: Bytes,
}

impl FrameIter {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }
}

impl Iterator for FrameIter {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.payload.is_empty() {
            return None;
        }
        if self.payload.len() < FRAME_PREFIX {
            let have = self.payload.len();
            self.payload.clear();
            return Some(Err(Error::TruncatedRow {
                need: FRAME_PREFIX,
                have,
            }));
        }
        let size = u32::from_le_bytes(self.payload[..4].try_into().unwrap()) as usize;
        if size > MAX_ROW_SIZE {
            self.payload.clear();
            return Some(Err(Error::RowTooLarge(size)));
        }
        let total = FRAME_PREFIX + size;
        if self.payload.len() < total {
            let have = self.payload.len();
            self.payload.clear();
            return Some(Err(Error::TruncatedRow { need: total, have }));
        }
        let frame = self.payload.slice(..total);
        self.payload.advance(total);
        Some(Ok(frame))
    }
}

fn read_u16(cur: &mut &[u8]) -> Result<u16> {
    if cur.len() < 2 {
        return Err(Error::TruncatedRow {
            need: 2,
            have: cur.len(),
        });
    }
    let v = u16::from_le_bytes(cur[..2].try_into().unwrap());
    *cur = &cur[2..];
    Ok(v)
}

fn read_u8(cur: &mut &[u8]) -> Result<u8> {
    if cur.is_empty() {
        return Err(Error::TruncatedRow { need: 1, have: 0 });
    }
    let v = cur[0];
    *cur = &cur[1..];
    Ok(v)
}

fn skip(cur: &mut &[u8], n: usize) -> Result<()> {
    if cur.len() < n {
        return Err(Error::TruncatedRow {
            need: n,
            have: cur.len(),
        });
    }
    *cur = &cur[n..];
    Ok(())
}
