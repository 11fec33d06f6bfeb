use serde::Serialize;

use crate::state::{ByteRange, ResumeRecord};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    Pending,
    Fetching,
    Done,
    Errored,
}

/// A contiguous slice of the file fetched by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    /// Bytes written so far in this run. Only ever grows.
    pub written: u64,
    pub status: SegmentStatus,
    /// Retry events spent on this segment.
    pub retries: u32,
}

impl Segment {
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            written: 0,
            status: SegmentStatus::Pending,
            retries: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// The part of the segment still to fetch.
    pub fn remaining(&self) -> ByteRange {
        ByteRange::new(self.start + self.written, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Byte ranges to fetch in parallel. Empty when everything is already recorded.
    Ranged(Vec<Segment>),
    /// Length or range support unknown: one full-body stream, no resume.
    SingleStream,
}

/// Splits the unrecorded parts of the file across up to `max_segments` workers.
///
/// `total_size` is `None` when the server did not report a length or refuses ranges.
pub fn plan(
    total_size: Option<u64>,
    record: &ResumeRecord,
    max_segments: usize,
    min_chunk_size: u64,
) -> Plan {
    let Some(total) = total_size else {
        return Plan::SingleStream;
    };
    debug_assert_eq!(total, record.total_size);
    Plan::Ranged(split_ranges(&record.gaps(), max_segments, min_chunk_size))
}

/// Splits `ranges` into segments of roughly equal length.
pub fn split_ranges(ranges: &[ByteRange], max_segments: usize, min_chunk_size: u64) -> Vec<Segment> {
    let remaining: u64 = ranges.iter().map(ByteRange::len).sum();
    if remaining == 0 {
        return Vec::new();
    }
    let min_chunk = min_chunk_size.max(1);
    let workers = (max_segments.max(1) as u64).min((remaining / min_chunk).max(1));
    let target = remaining.div_ceil(workers);

    let mut segments = Vec::new();
    for range in ranges.iter().filter(|r| !r.is_empty()) {
        let len = range.len();
        let pieces = len.div_ceil(target).min((len / min_chunk).max(1));
        let base = len / pieces;
        let extra = len % pieces;
        let mut start = range.start;
        for i in 0..pieces {
            let size = base + u64::from(i < extra);
            segments.push(Segment::new(segments.len(), start, start + size));
            start += size;
        }
    }
    segments
}
