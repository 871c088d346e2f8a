//! Column-major numeric time-series frame.
//!
//! A [`Series`] holds one timestamp vector plus a contiguous row-major `f32`
//! buffer of `num * data_stride` cells. Batched fetches produce one frame per
//! sub-range; [`Series::sorted_merge`] stitches them back into a single
//! time-ordered frame. NaN cells mean "no value yet" and are resolved by the
//! forward-fill operations.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{ensure, Snafu};
use std::collections::HashMap;

pub mod codec;

/// Errors of the frame algebra and the binary codec.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("time length {time_len} does not match row count {num}"))]
    TimeLenMismatch { time_len: usize, num: usize },

    #[snafu(display("{columns} columns do not match data stride {data_stride}"))]
    ColumnsMismatch { columns: usize, data_stride: usize },

    #[snafu(display("data length {data_len} does not match {num} rows of stride {data_stride}"))]
    DataLenMismatch {
        data_len: usize,
        num: usize,
        data_stride: usize,
    },

    #[snafu(display(
        "cannot merge time-overlapping batches: batch ends at {left_end}, next starts at {right_start}"
    ))]
    Overlap { left_end: i64, right_start: i64 },

    #[snafu(display("cannot merge batches without columns"))]
    NoColumns,

    #[snafu(display("time jumps backwards at row {row}"))]
    BackwardsTime { row: usize },

    #[snafu(display("cannot join series without a common timestamp"))]
    JoinMisaligned,

    #[snafu(display("splice {start}+{count} out of range for {num} rows"))]
    SpliceOutOfRange {
        start: usize,
        count: usize,
        num: usize,
    },

    #[snafu(display("invalid series encoding: {what}"))]
    Format { what: &'static str },

    #[snafu(display("series codec i/o failure: {source}"))]
    Io { source: std::io::Error },
}

/// Specialized result with the frame [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One fetched time-series: timestamps, a column-major numeric payload and
/// the tag set the backend attached to it.
///
/// `columns[0]` is always `"time"`; the remaining `data_stride` names label
/// the numeric columns of each row.
#[derive(Debug, Clone, Default)]
pub struct Series {
    /// Measurement name, empty when the backend omits it.
    pub name: String,

    /// Tag key/value pairs of this series.
    pub tags: HashMap<String, String>,

    /// Column names, `"time"` first.
    pub columns: Vec<String>,

    /// Logical row count.
    pub num: usize,

    /// Numeric columns per row, `columns.len() - 1`.
    pub data_stride: usize,

    /// Row-major cell buffer, `num * data_stride` values. NaN = no value.
    pub data: Vec<f32>,

    /// Millisecond epoch timestamps, strictly ascending, one per row.
    pub time: Vec<i64>,
}

/// Cell-exact equality: NaN cells compare by bit pattern, so a frame equals
/// its codec round-trip even before any fill pass.
impl PartialEq for Series {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.tags == other.tags
            && self.columns == other.columns
            && self.num == other.num
            && self.data_stride == other.data_stride
            && self.time == other.time
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Series {
    /// Timestamp of row `frame`.
    pub fn t(&self, frame: usize) -> i64 {
        self.time[frame]
    }

    /// Timestamp of the last row.
    pub fn t_end(&self) -> i64 {
        self.t(self.num - 1)
    }

    /// Numeric cells of row `i`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.data_stride..(i + 1) * self.data_stride]
    }

    /// Drop all rows, keeping columns and tags.
    pub fn clear(&mut self) {
        self.data.clear();
        self.time.clear();
        self.num = 0;
    }

    /// Assert the length invariants tying `num`, `time`, `columns` and
    /// `data` together.
    pub fn check_num(&self) -> Result<()> {
        ensure!(
            self.time.len() == self.num,
            TimeLenMismatchSnafu {
                time_len: self.time.len(),
                num: self.num,
            }
        );
        ensure!(
            self.data_stride + 1 == self.columns.len(),
            ColumnsMismatchSnafu {
                columns: self.columns.len(),
                data_stride: self.data_stride,
            }
        );
        ensure!(
            self.data.len() == self.num * self.data_stride,
            DataLenMismatchSnafu {
                data_len: self.data.len(),
                num: self.num,
                data_stride: self.data_stride,
            }
        );
        Ok(())
    }

    /// Stitch individually sorted, time-disjoint batches into one frame.
    ///
    /// Empty batches are dropped, the rest are ordered by first timestamp.
    /// Adjacent batches must not touch: a batch ending at the next one's
    /// first timestamp counts as overlap. Columns are taken from the first
    /// non-empty batch. After concatenation one forward-fill pass resolves
    /// NaN cells against the previous row (the first row keeps its NaNs).
    pub fn sorted_merge(mut batches: Vec<Self>) -> Result<Self> {
        batches.retain(|r| r.num > 0);

        let mut merged = Self::default();
        if batches.is_empty() {
            return Ok(merged);
        }

        batches.sort_by(|a, b| a.time[0].cmp(&b.time[0]));

        for pair in batches.windows(2) {
            ensure!(
                pair[0].t_end() < pair[1].t(0),
                OverlapSnafu {
                    left_end: pair[0].t_end(),
                    right_start: pair[1].t(0),
                }
            );
        }

        let columns = batches[0].columns.clone();
        ensure!(!columns.is_empty(), NoColumnsSnafu);

        merged.num = batches.iter().map(|r| r.num).sum();
        merged.data_stride = columns.len() - 1;
        merged.columns = columns;
        merged.time = Vec::with_capacity(merged.num);
        merged.data = Vec::with_capacity(merged.num * merged.data_stride);

        for r in batches {
            merged.time.extend(r.time);
            merged.data.extend(r.data);
        }

        // fill NaNs with previous
        for i in 1..merged.num {
            for c in 0..merged.data_stride {
                if merged.data[i * merged.data_stride + c].is_nan() {
                    merged.data[i * merged.data_stride + c] =
                        merged.data[(i - 1) * merged.data_stride + c];
                }
            }
        }

        Ok(merged)
    }

    /// Forward-fill NaN cells from the previous row, then close sampling
    /// gaps via [`Self::fill_time_gaps`]. Returns cells filled plus rows
    /// inserted. The first row is never touched.
    pub fn fill(&mut self) -> Result<usize> {
        if self.num < 2 {
            return Ok(0);
        }

        let mut filled = 0;
        for i in 1..self.num {
            for c in 0..self.data_stride {
                if self.data[i * self.data_stride + c].is_nan() {
                    self.data[i * self.data_stride + c] =
                        self.data[(i - 1) * self.data_stride + c];
                    filled += 1;
                }
            }
        }

        filled += self.fill_time_gaps()?;

        Ok(filled)
    }

    /// Like [`Self::fill`], but replaces every whole row failing `pred` with
    /// a copy of the previous row.
    pub fn fill_where<F>(&mut self, pred: F) -> Result<usize>
    where
        F: Fn(&[f32]) -> bool,
    {
        if self.num < 2 {
            return Ok(0);
        }

        let stride = self.data_stride;
        let mut filled = 0;
        for i in 1..self.num {
            let (prev, rest) = self.data.split_at_mut(i * stride);
            let row = &mut rest[..stride];
            if !pred(row) {
                row.copy_from_slice(&prev[(i - 1) * stride..]);
                filled += stride;
            }
        }

        filled += self.fill_time_gaps()?;

        Ok(filled)
    }

    /// Insert replica rows wherever adjacent timestamps are more than one
    /// sampling interval (`time[1] - time[0]`) apart. Inserted rows copy the
    /// previous row and step the timestamp by the interval. Returns rows
    /// inserted.
    pub fn fill_time_gaps(&mut self) -> Result<usize> {
        if self.num < 2 {
            return Ok(0);
        }

        let mut filled = 0;
        let si = self.time[1] - self.time[0];
        let mut last_t = self.time[0];
        let mut i = 1;
        while i < self.num {
            let n_ins = (self.time[i] - last_t) / si - 1;
            ensure!(n_ins >= 0, BackwardsTimeSnafu { row: i });
            if n_ins > 0 {
                let n = n_ins as usize;
                let stride = self.data_stride;
                let prev_row = self.data[(i - 1) * stride..i * stride].to_vec();

                self.time.splice(i..i, (1..=n_ins).map(|k| last_t + k * si));
                self.data.splice(
                    i * stride..i * stride,
                    prev_row.iter().copied().cycle().take(n * stride),
                );

                self.num += n;
                i += n;
                filled += n;
            }
            last_t = self.time[i];
            i += 1;
        }

        Ok(filled)
    }

    /// Drop the leading run of rows containing non-finite cells. Returns the
    /// number of rows removed.
    pub fn trim(&mut self) -> usize {
        self.trim_where(|row| row.iter().all(|v| v.is_finite()))
    }

    /// Drop leading rows until `pred` holds. Returns the number of rows
    /// removed; only the leading run is considered.
    pub fn trim_where<F>(&mut self, pred: F) -> usize
    where
        F: Fn(&[f32]) -> bool,
    {
        let stride = self.data_stride;
        let mut i = 0;
        while i < self.num && !pred(&self.data[i * stride..(i + 1) * stride]) {
            i += 1;
        }

        if i > 0 {
            self.num -= i;
            self.time.drain(..i);
            self.data.drain(..i * stride);
        }

        i
    }

    /// Align `other` onto `self` by timestamp equality and append its
    /// columns to each aligned row.
    ///
    /// Rows before the first common timestamp are dropped from both sides;
    /// from there the series must run in lock-step. `time` keeps only the
    /// aligned window.
    pub fn join_inner(&mut self, other: &Self) -> Result<()> {
        ensure!(self.num > 0 && other.num > 0, JoinMisalignedSnafu);

        let mut other_a = 0;
        while other_a < other.num && other.t(other_a) < self.t(0) {
            other_a += 1;
        }
        ensure!(other_a < other.num, JoinMisalignedSnafu);

        let mut self_a = 0;
        while other.t(other_a) != self.t(self_a) {
            self_a += 1;
            ensure!(self_a < self.num, JoinMisalignedSnafu);
        }

        let mut joint = Vec::with_capacity(self.data.len() + other.data.len());
        let mut k = 0;
        while self_a + k < self.num && other_a + k < other.num {
            ensure!(
                self.t(self_a + k) == other.t(other_a + k),
                JoinMisalignedSnafu
            );
            joint.extend_from_slice(self.row(self_a + k));
            joint.extend_from_slice(other.row(other_a + k));
            k += 1;
        }

        self.num = k;
        self.columns.extend(other.columns.iter().skip(1).cloned());
        self.data_stride += other.data_stride;
        self.data = joint;
        self.time.drain(..self_a);
        self.time.truncate(k);

        self.check_num()
    }

    /// Remove `count` rows starting at `start`.
    pub fn erase(&mut self, start: usize, count: usize) -> Result<()> {
        ensure!(
            start + count <= self.num,
            SpliceOutOfRangeSnafu {
                start,
                count,
                num: self.num,
            }
        );

        self.num -= count;
        self.data
            .drain(start * self.data_stride..(start + count) * self.data_stride);
        self.time.drain(start..start + count);

        self.check_num()
    }

    /// Insert `count` zeroed rows at `start` and hand back the inserted
    /// timestamp window for the caller to fill.
    pub fn insert(&mut self, start: usize, count: usize) -> Result<&mut [i64]> {
        ensure!(
            start <= self.num,
            SpliceOutOfRangeSnafu {
                start,
                count,
                num: self.num,
            }
        );

        self.num += count;
        self.data.splice(
            start * self.data_stride..start * self.data_stride,
            std::iter::repeat(0.0).take(count * self.data_stride),
        );
        self.time
            .splice(start..start, std::iter::repeat(0).take(count));

        self.check_num()?;

        Ok(&mut self.time[start..start + count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(columns: &[&str], time: &[i64], data: &[f32]) -> Series {
        let data_stride = columns.len() - 1;
        assert_eq!(data.len(), time.len() * data_stride);
        Series {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            num: time.len(),
            data_stride,
            data: data.to_vec(),
            time: time.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn fill_single_gap() {
        let si = 100;
        let mut s0 = frame(
            &["time", "a", "b", "c"],
            &[1000, 1000 + si, 1000 + 3 * si],
            &[
                2.0, 2.1, 700., //
                2.2, 2.3, 800., //
                // 1 sample gap
                3.0, 3.4, 1000.0,
            ],
        );

        s0.fill().unwrap();

        assert_eq!(s0.num, 4);
        assert_eq!(s0.num, s0.time.len());
        assert_eq!(s0.t(2), 1000 + 2 * si);

        assert_eq!(s0.row(2), s0.row(1));

        s0.fill().unwrap();
        assert_eq!(s0.num, 4);
    }

    #[test]
    fn fill_double_gap() {
        let si = 100;
        let mut s0 = frame(
            &["time", "a", "b", "c"],
            &[1000, 1000 + si, 1000 + 4 * si],
            &[
                2.0, 2.1, 700., //
                2.2, 2.3, 800., //
                // 2 sample gap
                3.0, 3.4, 1000.0,
            ],
        );

        s0.fill().unwrap();

        assert_eq!(s0.num, 5);
        assert_eq!(s0.num, s0.time.len());
        assert_eq!(s0.t(2), 1000 + 2 * si);
        assert_eq!(s0.t(3), 1000 + 3 * si);

        assert_eq!(s0.row(2), s0.row(1));
        assert_eq!(s0.row(3), s0.row(1));
        s0.check_num().unwrap();

        s0.fill().unwrap();
        assert_eq!(s0.num, 5);
    }

    #[test]
    fn fill_nan_cells() {
        let mut s0 = frame(
            &["time", "a", "b"],
            &[0, 10, 20],
            &[1.0, 2.0, f32::NAN, 2.5, f32::NAN, f32::NAN],
        );

        let filled = s0.fill().unwrap();
        assert_eq!(filled, 3);
        assert_eq!(s0.data, vec![1.0, 2.0, 1.0, 2.5, 1.0, 2.5]);

        assert_eq!(s0.fill().unwrap(), 0);
    }

    #[test]
    fn fill_where_replaces_whole_rows() {
        let mut s0 = frame(
            &["time", "a", "b"],
            &[0, 10, 20],
            &[1.0, 2.0, -1.0, 99.0, 3.0, 4.0],
        );

        let filled = s0.fill_where(|row| row.iter().all(|v| *v >= 0.0)).unwrap();
        assert_eq!(filled, 2);
        assert_eq!(s0.data, vec![1.0, 2.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn fill_backwards_time_fails() {
        let mut s0 = frame(&["time", "v"], &[0, 100, 50], &[1.0, 2.0, 3.0]);
        assert!(matches!(
            s0.fill().unwrap_err(),
            Error::BackwardsTime { row: 2 }
        ));
    }

    #[test]
    fn trim_leading_nans() {
        let mut s0 = frame(
            &["time", "v"],
            &[0, 10, 20, 30],
            &[f32::NAN, f32::NAN, 0.23, f32::NAN],
        );

        assert_eq!(s0.trim(), 2);
        assert_eq!(s0.num, 2);
        assert_eq!(s0.time, vec![20, 30]);
        assert!((s0.data[0] - 0.23).abs() < 1e-7);
        // inner NaN is not trimmed
        assert!(s0.data[1].is_nan());

        assert_eq!(s0.trim(), 0);
        s0.check_num().unwrap();
    }

    #[test]
    fn sorted_merge_concatenates_in_time_order() {
        let b0 = frame(&["time", "v"], &[0, 10], &[1.0, 2.0]);
        let b1 = frame(&["time", "v"], &[20, 30], &[3.0, 4.0]);
        let b2 = frame(&["time", "v"], &[40], &[5.0]);

        // out-of-order input, plus an empty batch that must be dropped
        let merged =
            Series::sorted_merge(vec![b2, Series::default(), b0, b1]).unwrap();

        assert_eq!(merged.num, 5);
        assert_eq!(merged.time, vec![0, 10, 20, 30, 40]);
        assert_eq!(merged.data, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(merged.columns, vec!["time", "v"]);
        merged.check_num().unwrap();
    }

    #[test]
    fn sorted_merge_fills_nan_across_batch_edge() {
        let b0 = frame(&["time", "v"], &[0, 10], &[1.0, f32::NAN]);
        let b1 = frame(&["time", "v"], &[20], &[f32::NAN]);

        let merged = Series::sorted_merge(vec![b1, b0]).unwrap();
        assert_eq!(merged.data, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn sorted_merge_keeps_leading_nan() {
        let b0 = frame(&["time", "v"], &[0, 10], &[f32::NAN, 2.0]);
        let merged = Series::sorted_merge(vec![b0]).unwrap();
        assert!(merged.data[0].is_nan());
        assert_eq!(merged.data[1], 2.0);
    }

    #[test]
    fn sorted_merge_rejects_overlap() {
        let b0 = frame(&["time", "v"], &[0, 20], &[1.0, 2.0]);
        // touching boundary counts as overlap
        let b1 = frame(&["time", "v"], &[20, 30], &[3.0, 4.0]);

        assert!(matches!(
            Series::sorted_merge(vec![b0, b1]).unwrap_err(),
            Error::Overlap {
                left_end: 20,
                right_start: 20,
            }
        ));
    }

    #[test]
    fn sorted_merge_rejects_missing_columns() {
        let mut b0 = frame(&["time", "v"], &[0], &[1.0]);
        b0.columns.clear();

        assert!(matches!(
            Series::sorted_merge(vec![b0]).unwrap_err(),
            Error::NoColumns
        ));
    }

    #[test]
    fn sorted_merge_of_nothing_is_empty() {
        let merged = Series::sorted_merge(vec![Series::default()]).unwrap();
        assert_eq!(merged.num, 0);
        assert!(merged.columns.is_empty());
    }

    #[test]
    fn join_inner_aligns_offset_series() {
        let mut a = frame(
            &["time", "v"],
            &[10, 20, 30, 40],
            &[1.0, 2.0, 3.0, 4.0],
        );
        let b = frame(
            &["time", "v2", "n"],
            &[0, 10, 20, 30],
            &[0.0, 9.0, 2.0, 4.0, 4.0, 4.0, 6.0, 4.0],
        );

        a.join_inner(&b).unwrap();

        assert_eq!(a.columns, vec!["time", "v", "v2", "n"]);
        assert_eq!(a.data_stride, 3);
        assert_eq!(a.num, 3);
        assert_eq!(a.time, vec![10, 20, 30]);
        assert_eq!(
            a.data,
            vec![1.0, 2.0, 4.0, 2.0, 4.0, 4.0, 3.0, 6.0, 4.0]
        );
        a.check_num().unwrap();
    }

    #[test]
    fn join_inner_skips_leading_self_rows() {
        // other starts after self: self rows before the first common
        // timestamp are dropped
        let mut a = frame(&["time", "v"], &[0, 10, 20], &[1.0, 2.0, 3.0]);
        let b = frame(&["time", "w"], &[10, 20, 30], &[8.0, 9.0, 10.0]);

        a.join_inner(&b).unwrap();

        assert_eq!(a.num, 2);
        assert_eq!(a.time, vec![10, 20]);
        assert_eq!(a.data, vec![2.0, 8.0, 3.0, 9.0]);
    }

    #[test]
    fn join_inner_rejects_disjoint_series() {
        let mut a = frame(&["time", "v"], &[0, 10], &[1.0, 2.0]);
        let b = frame(&["time", "w"], &[100, 110], &[8.0, 9.0]);
        assert!(matches!(
            a.join_inner(&b).unwrap_err(),
            Error::JoinMisaligned
        ));
    }

    #[test]
    fn join_inner_rejects_interval_mismatch() {
        let mut a = frame(&["time", "v"], &[0, 10, 20], &[1.0, 2.0, 3.0]);
        let b = frame(&["time", "w"], &[0, 20, 40], &[8.0, 9.0, 10.0]);
        assert!(matches!(
            a.join_inner(&b).unwrap_err(),
            Error::JoinMisaligned
        ));
    }

    #[test]
    fn erase_and_insert_splice_rows() {
        let mut s0 = frame(
            &["time", "a", "b"],
            &[0, 10, 20, 30],
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0],
        );

        s0.erase(1, 2).unwrap();
        assert_eq!(s0.num, 2);
        assert_eq!(s0.time, vec![0, 30]);
        assert_eq!(s0.data, vec![1.0, 2.0, 7.0, 8.0]);

        let window = s0.insert(1, 2).unwrap();
        window.copy_from_slice(&[10, 20]);
        assert_eq!(s0.num, 4);
        assert_eq!(s0.time, vec![0, 10, 20, 30]);
        assert_eq!(s0.row(1), &[0.0, 0.0]);
        s0.check_num().unwrap();

        assert!(matches!(
            s0.erase(3, 2).unwrap_err(),
            Error::SpliceOutOfRange { .. }
        ));
    }

    #[test]
    fn check_num_flags_each_invariant() {
        let mut s0 = frame(&["time", "v"], &[0], &[1.0]);
        s0.check_num().unwrap();

        s0.time.push(1);
        assert!(matches!(
            s0.check_num().unwrap_err(),
            Error::TimeLenMismatch { .. }
        ));
        s0.time.pop();

        s0.columns.push("w".into());
        assert!(matches!(
            s0.check_num().unwrap_err(),
            Error::ColumnsMismatch { .. }
        ));
        s0.columns.pop();

        s0.data.push(2.0);
        assert!(matches!(
            s0.check_num().unwrap_err(),
            Error::DataLenMismatch { .. }
        ));
    }
}
