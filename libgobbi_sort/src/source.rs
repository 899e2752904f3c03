use super::error::SourceError;
use super::hit::RawEvent;
use super::layout::DetectorLayout;

/// A half-open range [start, end) of record indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionRange {
    pub start: u64,
    pub end: u64,
}

impl PartitionRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Divide a record count in to a set of contiguous partitions (one per worker)
///
/// The partitions are disjoint, cover [0, total) with no gaps, and differ in size by at
/// most one record. If there are more partitions than records, the trailing partitions
/// are empty.
pub fn create_partitions(total: u64, n_partitions: usize) -> Vec<PartitionRange> {
    let n = n_partitions.max(1) as u64;
    let base = total / n;
    let remainder = total % n;
    let mut partitions = Vec::with_capacity(n as usize);
    let mut start = 0;
    for idx in 0..n {
        let size = base + u64::from(idx < remainder);
        partitions.push(PartitionRange::new(start, start + size));
        start += size;
    }
    partitions
}

/// The result of asking a PartitionReader for the next record
#[derive(Debug, Clone, PartialEq)]
pub enum ReadStatus {
    /// The event was filled with the record at this index
    Record(u64),
    /// The record at this index could not be decoded. The reader has moved past it.
    Malformed { index: u64, reason: String },
    /// No more records in the partition
    End,
}

/// A cursor over one partition of a RecordSource.
///
/// Readers are created and used by a single worker.
pub trait PartitionReader {
    /// Read the next record of the partition into `event`
    fn next_record(&mut self, event: &mut RawEvent) -> Result<ReadStatus, SourceError>;
}

/// A read-only set of records which can be split in to independent partitions.
///
/// Sources are shared by all workers, so they must be Sync. Each worker asks for its own
/// PartitionReader.
pub trait RecordSource: Sync {
    /// Total number of records in the source
    fn record_count(&self) -> u64;

    /// The layout of each record
    fn layout(&self) -> &DetectorLayout;

    /// Open a reader over a range of records
    fn open_partition(
        &self,
        range: PartitionRange,
    ) -> Result<Box<dyn PartitionReader + '_>, SourceError>;

    /// Check a requested range against the record count
    fn check_range(&self, range: &PartitionRange) -> Result<(), SourceError> {
        if range.start > range.end || range.end > self.record_count() {
            return Err(SourceError::RangeOutOfBounds {
                start: range.start,
                end: range.end,
                count: self.record_count(),
            });
        }
        Ok(())
    }
}

/// A RecordSource held in memory.
///
/// Records which are None are treated as malformed. Useful for testing and for callers who
/// already unpacked their data.
#[derive(Debug, Clone)]
pub struct MemoryRecordSource {
    layout: DetectorLayout,
    records: Vec<Option<RawEvent>>,
}

impl MemoryRecordSource {
    /// Create a source, checking that every record matches the layout
    pub fn new(layout: DetectorLayout, records: Vec<Option<RawEvent>>) -> Result<Self, SourceError> {
        for event in records.iter().flatten() {
            if event.boards() != layout.boards || event.channels() != layout.channels {
                return Err(SourceError::LayoutMismatch {
                    expected: (layout.boards, layout.channels),
                    found: (event.boards(), event.channels()),
                });
            }
        }
        Ok(Self { layout, records })
    }
}

impl RecordSource for MemoryRecordSource {
    fn record_count(&self) -> u64 {
        self.records.len() as u64
    }

    fn layout(&self) -> &DetectorLayout {
        &self.layout
    }

    fn open_partition(
        &self,
        range: PartitionRange,
    ) -> Result<Box<dyn PartitionReader + '_>, SourceError> {
        self.check_range(&range)?;
        Ok(Box::new(MemoryPartitionReader {
            records: &self.records,
            cursor: range.start,
            end: range.end,
        }))
    }
}

struct MemoryPartitionReader<'a> {
    records: &'a [Option<RawEvent>],
    cursor: u64,
    end: u64,
}

impl PartitionReader for MemoryPartitionReader<'_> {
    fn next_record(&mut self, event: &mut RawEvent) -> Result<ReadStatus, SourceError> {
        if self.cursor >= self.end {
            return Ok(ReadStatus::End);
        }
        let index = self.cursor;
        self.cursor += 1;
        match &self.records[index as usize] {
            Some(record) => {
                event.clone_from(record);
                Ok(ReadStatus::Record(index))
            }
            None => Ok(ReadStatus::Malformed {
                index,
                reason: String::from("record is missing"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partitions_cover_dataset() {
        for total in [0u64, 1, 7, 100, 1001] {
            for n in [1usize, 2, 3, 4, 16] {
                let partitions = create_partitions(total, n);
                assert_eq!(partitions.len(), n);
                assert_eq!(partitions[0].start, 0);
                assert_eq!(partitions[n - 1].end, total);
                for pair in partitions.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                let max = partitions.iter().map(|p| p.len()).max().unwrap();
                let min = partitions.iter().map(|p| p.len()).min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }

    #[test]
    fn test_zero_partitions_is_one() {
        let partitions = create_partitions(10, 0);
        assert_eq!(partitions, vec![PartitionRange::new(0, 10)]);
    }

    #[test]
    fn test_memory_reader_reports_malformed() {
        let layout = DetectorLayout::default();
        let records = vec![Some(RawEvent::new(&layout)), None, Some(RawEvent::new(&layout))];
        let source = MemoryRecordSource::new(layout.clone(), records).unwrap();
        let mut reader = source.open_partition(PartitionRange::new(0, 3)).unwrap();
        let mut event = RawEvent::new(&layout);
        assert_eq!(reader.next_record(&mut event).unwrap(), ReadStatus::Record(0));
        assert!(matches!(
            reader.next_record(&mut event).unwrap(),
            ReadStatus::Malformed { index: 1, .. }
        ));
        assert_eq!(reader.next_record(&mut event).unwrap(), ReadStatus::Record(2));
        assert_eq!(reader.next_record(&mut event).unwrap(), ReadStatus::End);
    }

    #[test]
    fn test_memory_source_rejects_bad_range() {
        let layout = DetectorLayout::default();
        let source = MemoryRecordSource::new(layout, vec![]).unwrap();
        assert!(source.open_partition(PartitionRange::new(0, 1)).is_err());
    }

    #[test]
    fn test_memory_source_rejects_mismatched_layout() {
        let small = DetectorLayout {
            boards: 2,
            ..Default::default()
        };
        let result = MemoryRecordSource::new(
            DetectorLayout::default(),
            vec![Some(RawEvent::new(&small))],
        );
        assert!(matches!(result, Err(SourceError::LayoutMismatch { .. })));
    }
}
