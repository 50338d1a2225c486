//! Row Batch and Two-Level Grouping
//!
//! A `RowBatch` holds the rows decoded from one ingestion request. Before the
//! batch reaches the write channels it is grouped twice:
//!
//! 1. **By shard**: every row is stamped with
//!    `jump_consistent_hash(row.hash(), num_shards)`, the batch is sorted by
//!    shard id, and the shard iterator walks maximal runs of equal shards.
//! 2. **By family**: inside one shard run, rows are grouped by the family
//!    window containing their timestamp. If the whole run already sits in a
//!    single window (the overwhelmingly common case) no sort happens;
//!    otherwise the run is stably sorted by timestamp and emitted as
//!    ascending family groups.
//!
//! Both sorts are stable, so rows of one family keep their ingestion order
//! all the way into the chunk.
//!
//! ```text
//! batch ──sort by shard──► [shard 0 ..][shard 3 ....][shard 7 ..]
//!                                │
//!                                ▼ per shard run
//!                     [family 10:00][family 11:00]
//! ```

use crate::error::Result;
use crate::models::ShardId;
use crate::row::MetricRow;
use crate::sharding::jump_consistent_hash;
use crate::timeutil::{now_ms, Interval, IntervalCalculator};

/// Rows decoded from one ingestion request.
#[derive(Debug, Default)]
pub struct RowBatch {
    rows: Vec<MetricRow>,
}

impl RowBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[MetricRow] {
        &self.rows
    }

    /// Clears the batch for reuse.
    pub fn reset(&mut self) {
        self.rows.clear();
    }

    /// Reserves the next row slot and commits it only if `decode` succeeds.
    pub fn try_append<F>(&mut self, decode: F) -> Result<()>
    where
        F: FnOnce() -> Result<MetricRow>,
    {
        let row = decode()?;
        self.rows.push(row);
        Ok(())
    }

    /// Flags rows outside `[now - behind_ms, now + ahead_ms]` as out of
    /// range. A non-positive bound disables that side. Returns the number of
    /// rows flagged by this call.
    pub fn evict_out_of_time_range(&mut self, behind_ms: i64, ahead_ms: i64) -> usize {
        self.evict_out_of_time_range_at(now_ms(), behind_ms, ahead_ms)
    }

    fn evict_out_of_time_range_at(&mut self, now: i64, behind_ms: i64, ahead_ms: i64) -> usize {
        let mut evicted = 0;
        for row in &mut self.rows {
            let ts = row.timestamp();
            if (behind_ms > 0 && ts < now - behind_ms) || (ahead_ms > 0 && ts > now + ahead_ms) {
                row.out_of_time_range = true;
                evicted += 1;
            }
        }
        evicted
    }

    /// Stamps every row with its shard, sorts the batch by shard id and
    /// returns the shard-group iterator. Visits each row exactly once.
    pub fn new_shard_group_iterator(&mut self, num_shards: u32) -> ShardGroupIter<'_> {
        for row in &mut self.rows {
            row.shard_id = jump_consistent_hash(row.hash(), num_shards);
        }
        self.rows.sort_by_key(|row| row.shard_id);
        ShardGroupIter {
            rows: &mut self.rows,
            group_start: 0,
            group_end: 0,
            group_shard: 0,
        }
    }
}

/// Walks maximal runs of equal shard ids over a shard-sorted batch.
#[derive(Debug)]
pub struct ShardGroupIter<'a> {
    rows: &'a mut [MetricRow],
    group_start: usize,
    group_end: usize,
    group_shard: ShardId,
}

impl<'a> ShardGroupIter<'a> {
    /// Advances to the next shard run. Returns false once exhausted.
    pub fn has_rows_for_next_shard(&mut self) -> bool {
        if self.group_end >= self.rows.len() {
            return false;
        }
        self.group_shard = self.rows[self.group_end].shard_id;
        self.group_start = self.group_end;
        while self.group_end < self.rows.len()
            && self.rows[self.group_end].shard_id == self.group_shard
        {
            self.group_end += 1;
        }
        self.group_start < self.group_end
    }

    /// Family iterator over the current shard run.
    pub fn family_rows_for_next_shard(&mut self, interval: Interval) -> (ShardId, FamilyIter<'_>) {
        let rows = &mut self.rows[self.group_start..self.group_end];
        (self.group_shard, FamilyIter::new(rows, interval))
    }
}

/// Groups one shard run into family windows.
#[derive(Debug)]
pub struct FamilyIter<'a> {
    rows: &'a mut [MetricRow],
    group_start: usize,
    group_end: usize,
    same_family: bool,
    emitted_same_family: bool,
    family_time: i64,
    calc: IntervalCalculator,
}

impl<'a> FamilyIter<'a> {
    fn new(rows: &'a mut [MetricRow], interval: Interval) -> Self {
        let calc = interval.calculator();
        let mut iter = Self {
            rows,
            group_start: 0,
            group_end: 0,
            same_family: false,
            emitted_same_family: false,
            family_time: 0,
            calc,
        };
        // Fast path: the whole run inside one window means no sort at all.
        if iter.is_same_family() {
            iter.same_family = true;
            return iter;
        }
        iter.rows.sort_by_key(|row| row.timestamp());
        iter
    }

    fn is_same_family(&mut self) -> bool {
        if self.rows.is_empty() {
            return true;
        }
        let first_ts = self.rows[0].timestamp();
        let range = self.calc.time_range_of(first_ts);
        self.family_time = range.start;
        self.rows[1..]
            .iter()
            .all(|row| range.contains(row.timestamp()))
    }

    /// Next family group, ascending by family time. Every group is non-empty
    /// and lies entirely inside one family window.
    pub fn next_family(&mut self) -> Option<(i64, &[MetricRow])> {
        if self.rows.is_empty() {
            return None;
        }
        if self.same_family {
            if self.emitted_same_family {
                return None;
            }
            self.emitted_same_family = true;
            return Some((self.family_time, &self.rows[..]));
        }
        if self.group_end >= self.rows.len() {
            return None;
        }
        let range = self.calc.time_range_of(self.rows[self.group_end].timestamp());
        self.group_start = self.group_end;
        self.family_time = range.start;
        while self.group_end < self.rows.len()
            && range.contains(self.rows[self.group_end].timestamp())
        {
            self.group_end += 1;
        }
        Some((self.family_time, &self.rows[self.group_start..self.group_end]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RowBuilder, SimpleFieldType};
    use crate::timeutil::{ONE_HOUR_MS, ONE_MINUTE_MS};
    use std::collections::HashMap;

    fn row(name: &str, ts: i64) -> MetricRow {
        let mut builder = RowBuilder::new();
        builder.metric_name(name.as_bytes()).timestamp(ts);
        builder.simple_field(b"f", SimpleFieldType::Gauge, 1.0).unwrap();
        MetricRow::from_block(builder.build().unwrap()).unwrap()
    }

    fn batch_of(rows: Vec<MetricRow>) -> RowBatch {
        let mut batch = RowBatch::new();
        for r in rows {
            batch.try_append(|| Ok(r)).unwrap();
        }
        batch
    }

    #[test]
    fn test_try_append_failure_leaves_batch_unchanged() {
        let mut batch = RowBatch::new();
        batch.try_append(|| Ok(row("a", 1))).unwrap();
        let result = batch.try_append(|| Err(crate::Error::EmptyMetricName));
        assert!(result.is_err());
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_shard_groups_cover_every_row_once() {
        // property: sum of group sizes equals batch size for any shard count
        let ts = 1_700_000_000_000;
        for num_shards in [1u32, 2, 4, 7] {
            let mut batch = batch_of(
                (0..50)
                    .map(|i| row(&format!("metric-{i}"), ts + i))
                    .collect(),
            );
            let total = batch.len();
            let mut seen = 0usize;
            let mut iter = batch.new_shard_group_iterator(num_shards);
            while iter.has_rows_for_next_shard() {
                let (shard_id, mut families) = iter.family_rows_for_next_shard(Interval::default());
                assert!(shard_id < num_shards);
                while let Some((_, rows)) = families.next_family() {
                    assert!(!rows.is_empty());
                    for r in rows {
                        assert_eq!(r.shard_id, shard_id);
                        seen += 1;
                    }
                }
            }
            assert_eq!(seen, total);
        }
    }

    #[test]
    fn test_single_shard_collects_everything() {
        let ts = 1_700_000_000_000;
        let mut batch = batch_of((0..10).map(|i| row(&format!("m{i}"), ts)).collect());
        let mut iter = batch.new_shard_group_iterator(1);
        assert!(iter.has_rows_for_next_shard());
        let (shard_id, mut families) = iter.family_rows_for_next_shard(Interval::default());
        assert_eq!(shard_id, 0);
        let (_, rows) = families.next_family().unwrap();
        assert_eq!(rows.len(), 10);
        assert!(families.next_family().is_none());
        assert!(!iter.has_rows_for_next_shard());
    }

    #[test]
    fn test_empty_batch_yields_no_groups() {
        let mut batch = RowBatch::new();
        let mut iter = batch.new_shard_group_iterator(4);
        assert!(!iter.has_rows_for_next_shard());
    }

    #[test]
    fn test_three_distinct_series_across_four_shards() {
        // 3 rows in one family window across 4 shards: one family group per shard
        let ts = 1_700_000_000_000;
        let mut batch = batch_of(vec![row("cpu", ts), row("mem", ts + 1), row("disk", ts + 2)]);
        let mut groups: HashMap<ShardId, usize> = HashMap::new();
        let mut iter = batch.new_shard_group_iterator(4);
        while iter.has_rows_for_next_shard() {
            let (shard_id, mut families) = iter.family_rows_for_next_shard(Interval::default());
            let mut family_count = 0;
            let mut row_count = 0;
            while let Some((_, rows)) = families.next_family() {
                family_count += 1;
                row_count += rows.len();
            }
            assert_eq!(family_count, 1);
            *groups.entry(shard_id).or_default() += row_count;
        }
        assert_eq!(groups.values().sum::<usize>(), 3);
    }

    #[test]
    fn test_two_families_emitted_in_ascending_order() {
        // same shard, timestamps two windows apart
        let ts = 1_700_000_000_000;
        let later = ts + 2 * ONE_HOUR_MS;
        let mut batch = batch_of(vec![row("cpu", later), row("cpu", ts)]);
        let mut iter = batch.new_shard_group_iterator(4);
        assert!(iter.has_rows_for_next_shard());
        let (_, mut families) = iter.family_rows_for_next_shard(Interval::default());

        let calc = Interval::default().calculator();
        let (family_a, rows_a) = {
            let (f, r) = families.next_family().unwrap();
            (f, r.len())
        };
        assert_eq!(family_a, calc.family_time_of(ts));
        assert_eq!(rows_a, 1);

        let (family_b, rows_b) = {
            let (f, r) = families.next_family().unwrap();
            (f, r.len())
        };
        assert_eq!(family_b, calc.family_time_of(later));
        assert_eq!(rows_b, 1);
        assert!(family_a < family_b);
        assert!(families.next_family().is_none());
    }

    #[test]
    fn test_same_family_fast_path_preserves_order() {
        // all rows in one window: emitted as-is, no timestamp sort
        let ts = 1_700_000_000_000;
        let mut batch = batch_of(vec![
        row("cpu", ts + 30), row("cpu", ts + 10), row("cpu", ts + 20)]);
        let mut iter = batch.new_shard_group_iterator(1);
        assert!(iter.has_rows_for_next_shard());
        let (_, mut families) = iter.family_rows_for_next_shard(Interval::default());
        let (_, rows) = families.next_family().unwrap();
        let stamps: Vec<_> = rows.iter().map(|r| r.timestamp()).collect();
        assert_eq!(stamps, vec![ts + 30, ts + 10, ts + 20]);
    }

    #[test]
    fn test_family_groups_partition_the_shard_run() {
        // concatenated groups are a permutation of the run, each inside one window
        let ts = 1_700_000_000_000;
        let calc = Interval::default().calculator();
        let mut batch = batch_of(vec![
            row("cpu", ts + ONE_HOUR_MS),
            row("cpu", ts),
            row("cpu", ts + 2 * ONE_HOUR_MS),
            row("cpu", ts + ONE_MINUTE_MS),
        ]);
        let total = batch.len();
        let mut iter = batch.new_shard_group_iterator(1);
        assert!(iter.has_rows_for_next_shard());
        let (_, mut families) = iter.family_rows_for_next_shard(Interval::default());

        let mut seen = 0;
        let mut last_family = i64::MIN;
        while let Some((family_time, rows)) = families.next_family() {
            assert!(family_time > last_family);
            last_family = family_time;
            for r in rows {
                assert_eq!(calc.family_time_of(r.timestamp()), family_time);
                seen += 1;
            }
        }
        assert_eq!(seen, total);
    }

    #[test]
    fn test_evict_out_of_time_range_both_sides() {
        let now = 1_700_000_000_000;
        let mut batch = batch_of(vec![
            row("old", now - 10 * ONE_MINUTE_MS),
            row("ok", now),
            row("future", now + 10 * ONE_MINUTE_MS),
        ]);
        let evicted = batch.evict_out_of_time_range_at(now, 5 * ONE_MINUTE_MS, 5 * ONE_MINUTE_MS);
        assert_eq!(evicted, 2);
        let flags: Vec<_> = batch.rows().iter().map(|r| r.out_of_time_range).collect();
        assert_eq!(flags, vec![true, false, true]);
        // evicted rows still count toward length
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_evict_disabled_sides() {
        let now = 1_700_000_000_000;
        let mut batch = batch_of(vec![
            row("old", now - 10 * ONE_MINUTE_MS),
            row("future", now + 10 * ONE_MINUTE_MS),
        ]);
        // behind disabled: only the future row goes
        assert_eq!(batch.evict_out_of_time_range_at(now, 0, 5 * ONE_MINUTE_MS), 1);
        let mut batch = batch_of(vec![
            row("old", now - 10 * ONE_MINUTE_MS),
            row("future", now + 10 * ONE_MINUTE_MS),
        ]);
        // both disabled: nothing goes
        assert_eq!(batch.evict_out_of_time_range_at(now, 0, 0), 0);
    }

    #[test]
    fn test_shard_stamp_matches_jump_hash() {
        let ts = 1_700_000_000_000;
        let mut batch = batch_of((0..20).map(|i| row(&format!("m{i}"), ts)).collect());
        let _ = batch.new_shard_group_iterator(8);
        for r in batch.rows() {
            assert_eq!(r.shard_id, jump_consistent_hash(r.hash(), 8));
        }
    }
}
