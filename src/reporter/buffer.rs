use crate::record::LogRecord;

/// Records kept in ascending `time` order
///
/// Records with equal timestamps keep their arrival order.
#[derive(Debug, Default)]
pub struct SortedBuffer {
    records: Vec<LogRecord>,
}

impl SortedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: LogRecord) {
        let idx = self.records.partition_point(|r| r.time <= record.time);
        self.records.insert(idx, record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn oldest_time(&self) -> Option<i64> {
        self.records.first().map(|r| r.time)
    }

    /// Remove and return every record with `time <= cutoff`
    pub fn take_eligible(&mut self, cutoff: i64) -> Vec<LogRecord> {
        let n = self.records.partition_point(|r| r.time <= cutoff);
        self.records.drain(..n).collect()
    }

    pub fn take_all(&mut self) -> Vec<LogRecord> {
        std::mem::take(&mut self.records)
    }

    pub fn as_slice(&self) -> &[LogRecord] {
        &self.records
    }
}
