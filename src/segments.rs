//! # File Reassembly Module
//!
//! The core abstraction provided by this module is the [DataFile], which stores the received
//! segments of a file and keeps track of the received byte ranges with [ReceivedSegments].
//!
//! The received ranges are kept sorted, disjoint and non-touching: every newly received range is
//! merged with all ranges it overlaps or touches. The missing ranges are the complement of the
//! received ranges with respect to the announced file size, and are used as the segment requests
//! of NAK PDUs.
use alloc::vec::Vec;
use smallvec::SmallVec;

use crate::pdu::nak::SegmentRequest;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SegmentError {
    #[error("segment ({start}, {end}) exceeds the file size {file_size}")]
    OutOfBounds { start: u64, end: u64, file_size: u64 },
    #[error("file size {file_size} exceeds the maximum of {max_file_size}")]
    FileTooLarge { file_size: u64, max_file_size: u64 },
}

/// Sorted list of disjoint, non-touching half-open ranges.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceivedSegments {
    ranges: SmallVec<[(u64, u64); 8]>,
}

impl ReceivedSegments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the range `[start, end)`. Empty ranges are ignored and inserting a range twice
    /// has no effect.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        // First range which ends at or after the new start can be merged.
        let first = self.ranges.partition_point(|&(_, range_end)| range_end < start);
        let mut last = first;
        let mut merged = (start, end);
        while last < self.ranges.len() && self.ranges[last].0 <= end {
            merged.0 = merged.0.min(self.ranges[last].0);
            merged.1 = merged.1.max(self.ranges[last].1);
            last += 1;
        }
        self.ranges.drain(first..last);
        self.ranges.insert(first, merged);
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn number_of_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn received_bytes(&self) -> u64 {
        self.ranges.iter().map(|(start, end)| end - start).sum()
    }

    /// Whether `[0, total)` is fully covered.
    pub fn covers(&self, total: u64) -> bool {
        if total == 0 {
            return true;
        }
        self.ranges.len() == 1 && self.ranges[0].0 == 0 && self.ranges[0].1 >= total
    }

    /// All gaps inside `[0, total)` in ascending order.
    pub fn missing(&self, total: u64) -> Vec<SegmentRequest> {
        let mut missing = Vec::new();
        let mut cursor = 0;
        for &(start, end) in &self.ranges {
            if start >= total {
                break;
            }
            if start > cursor {
                missing.push(SegmentRequest::new(cursor, start));
            }
            cursor = end;
        }
        if cursor < total {
            missing.push(SegmentRequest::new(cursor, total));
        }
        missing
    }
}

/// In-memory reassembly buffer for a file announced by a Metadata PDU.
#[derive(Debug, Clone)]
pub struct DataFile {
    file_size: u64,
    segments: ReceivedSegments,
    data: Vec<u8>,
}

impl DataFile {
    /// Creates the buffer for a file of `file_size` bytes. Files larger than `max_file_size` or
    /// the address space are rejected.
    pub fn new(file_size: u64, max_file_size: u64) -> Result<Self, SegmentError> {
        if file_size > max_file_size || usize::try_from(file_size).is_err() {
            return Err(SegmentError::FileTooLarge {
                file_size,
                max_file_size,
            });
        }
        Ok(Self {
            file_size,
            segments: ReceivedSegments::new(),
            data: Vec::new(),
        })
    }

    /// Stores a received segment. Segments which extend beyond the file size are rejected.
    /// Receiving the same segment twice is harmless.
    pub fn add_segment(&mut self, offset: u64, segment: &[u8]) -> Result<(), SegmentError> {
        let end = offset
            .checked_add(segment.len() as u64)
            .filter(|end| *end <= self.file_size)
            .ok_or(SegmentError::OutOfBounds {
                start: offset,
                end: offset.saturating_add(segment.len() as u64),
                file_size: self.file_size,
            })?;
        if segment.is_empty() {
            return Ok(());
        }
        // Both values are bounded by the file size, which fits into an usize.
        let (start_idx, end_idx) = (offset as usize, end as usize);
        if self.data.len() < end_idx {
            self.data.resize(end_idx, 0);
        }
        self.data[start_idx..end_idx].copy_from_slice(segment);
        self.segments.insert(offset, end);
        Ok(())
    }

    pub fn missing_chunks(&self) -> Vec<SegmentRequest> {
        self.segments.missing(self.file_size)
    }

    pub fn is_complete(&self) -> bool {
        self.segments.covers(self.file_size)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn received_segments(&self) -> &ReceivedSegments {
        &self.segments
    }

    /// Number of received bytes.
    pub fn progress(&self) -> u64 {
        self.segments.received_bytes()
    }

    /// The buffered file content. Its length is the file size once the file is complete.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

    use super::*;

    const MAX: u64 = 1024;

    /// Splits `[0, total)` into consecutive ranges of random length.
    fn random_partition(rng: &mut StdRng, total: u64) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut start = 0;
        while start < total {
            let end = (start + rng.gen_range(1..=16)).min(total);
            ranges.push((start, end));
            start = end;
        }
        ranges
    }

    #[test]
    fn test_merge_adjacent() {
        let mut segments = ReceivedSegments::new();
        segments.insert(0, 10);
        segments.insert(10, 20);
        assert_eq!(segments.iter().collect::<Vec<_>>(), [(0, 20)]);
    }

    #[test]
    fn test_merge_overlapping_and_bridging() {
        let mut segments = ReceivedSegments::new();
        segments.insert(30, 40);
        segments.insert(0, 10);
        segments.insert(50, 60);
        assert_eq!(segments.number_of_ranges(), 3);
        segments.insert(5, 55);
        assert_eq!(segments.iter().collect::<Vec<_>>(), [(0, 60)]);
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut segments = ReceivedSegments::new();
        segments.insert(40, 50);
        segments.insert(10, 20);
        segments.insert(25, 30);
        assert_eq!(
            segments.iter().collect::<Vec<_>>(),
            [(10, 20), (25, 30), (40, 50)]
        );
        assert_eq!(segments.received_bytes(), 25);
    }

    #[test]
    fn test_idempotent_insert() {
        let mut segments = ReceivedSegments::new();
        segments.insert(10, 20);
        let snapshot = segments.clone();
        segments.insert(10, 20);
        segments.insert(12, 18);
        segments.insert(5, 5);
        assert_eq!(segments, snapshot);
    }

    #[test]
    fn test_missing_chunks_with_gap() {
        let mut file = DataFile::new(25, MAX).unwrap();
        file.add_segment(0, &[0; 10]).unwrap();
        file.add_segment(20, &[0; 5]).unwrap();
        assert!(!file.is_complete());
        assert_eq!(file.missing_chunks(), [SegmentRequest::new(10, 20)]);
        file.add_segment(10, &[1; 10]).unwrap();
        assert!(file.is_complete());
        assert!(file.missing_chunks().is_empty());
        assert_eq!(file.data().len(), 25);
        assert_eq!(file.data()[10], 1);
    }

    #[test]
    fn test_missing_chunks_without_data() {
        let file = DataFile::new(25, MAX).unwrap();
        assert_eq!(file.missing_chunks(), [SegmentRequest::new(0, 25)]);
        let mut file = DataFile::new(25, MAX).unwrap();
        file.add_segment(5, &[0; 5]).unwrap();
        assert_eq!(
            file.missing_chunks(),
            [SegmentRequest::new(0, 5), SegmentRequest::new(10, 25)]
        );
        assert_eq!(file.progress(), 5);
    }

    #[test]
    fn test_empty_file_complete() {
        let file = DataFile::new(0, MAX).unwrap();
        assert!(file.is_complete());
        assert!(file.missing_chunks().is_empty());
    }

    #[test]
    fn test_out_of_bounds() {
        let mut file = DataFile::new(10, MAX).unwrap();
        assert_eq!(
            file.add_segment(8, &[0; 4]).unwrap_err(),
            SegmentError::OutOfBounds {
                start: 8,
                end: 12,
                file_size: 10
            }
        );
        assert!(file.add_segment(u64::MAX, &[0; 4]).is_err());
        // Empty segment at the end of the file is fine.
        file.add_segment(10, &[]).unwrap();
        assert!(file.received_segments().is_empty());
    }

    #[test]
    fn test_data_copied() {
        let mut file = DataFile::new(6, MAX).unwrap();
        file.add_segment(3, b"def").unwrap();
        file.add_segment(0, b"abc").unwrap();
        assert_eq!(file.data(), b"abcdef");
    }

    #[test]
    fn test_any_order_and_duplication_same_result() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let total = rng.gen_range(1..300);
            let ranges = random_partition(&mut rng, total);
            let mut in_order = ReceivedSegments::new();
            for &(start, end) in &ranges {
                in_order.insert(start, end);
            }
            assert_eq!(in_order.iter().collect::<Vec<_>>(), [(0, total)]);

            let mut shuffled = ranges.clone();
            let duplicates: Vec<_> = (0..rng.gen_range(0..ranges.len() + 1))
                .map(|_| ranges[rng.gen_range(0..ranges.len())])
                .collect();
            shuffled.extend(duplicates);
            shuffled.shuffle(&mut rng);
            let mut permuted = ReceivedSegments::new();
            for &(start, end) in &shuffled {
                permuted.insert(start, end);
            }
            assert_eq!(permuted, in_order);
            assert!(permuted.covers(total));
            assert!(permuted.missing(total).is_empty());
        }
    }

    #[test]
    fn test_held_back_range_is_only_gap() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let total = rng.gen_range(2..300);
            let mut ranges = random_partition(&mut rng, total);
            let (held_start, held_end) = ranges.remove(rng.gen_range(0..ranges.len()));
            let mut delivered = ranges.clone();
            delivered.extend_from_slice(&ranges[..ranges.len() / 2]);
            delivered.shuffle(&mut rng);
            let mut file = DataFile::new(total, MAX).unwrap();
            for (start, end) in delivered {
                let segment: Vec<u8> = (start..end).map(|v| v as u8).collect();
                file.add_segment(start, &segment).unwrap();
            }
            assert_eq!(
                file.missing_chunks(),
                [SegmentRequest::new(held_start, held_end)]
            );
            assert!(!file.is_complete());
            assert_eq!(file.progress(), total - (held_end - held_start));
        }
    }

    #[test]
    fn test_file_size_limit() {
        assert!(DataFile::new(MAX, MAX).is_ok());
        assert_eq!(
            DataFile::new(MAX + 1, MAX).unwrap_err(),
            SegmentError::FileTooLarge {
                file_size: MAX + 1,
                max_file_size: MAX
            }
        );
    }
}
