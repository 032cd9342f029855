use kmeta_core::{Classification, LogGroup, Record, Sink};
use metrics::{counter, histogram};
use tracing::{debug, error};

use crate::Counters;

/// Append-only accumulator for one classification. Owned by the flush task.
#[derive(Debug)]
pub struct Batch {
    classification: Classification,
    records: Vec<Record>,
}

impl Batch {
    pub fn new(classification: Classification, capacity: usize) -> Self {
        Self { classification, records: Vec::with_capacity(capacity) }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.records.capacity()
    }

    /// Convert the pending records into one group and clear in place.
    /// Returns `None` when empty. Conversion losses are logged per key.
    pub fn take_group(&mut self) -> Option<(LogGroup, u64)> {
        if self.records.is_empty() {
            return None;
        }
        let mut logs = Vec::with_capacity(self.records.len());
        let mut lost = 0u64;
        for record in self.records.iter() {
            let (wire, errors) = record.to_wire();
            for e in errors {
                error!(kind = %self.classification, key = %e.key, found = e.found, "convert event to log fail, value is not string");
                lost += 1;
            }
            logs.push(wire);
        }
        self.records.clear();
        Some((LogGroup { classification: self.classification, logs }, lost))
    }

    pub(crate) fn flush(&mut self, sink: &dyn Sink, counters: &Counters) {
        let Some((group, lost)) = self.take_group() else { return };
        let kind = self.classification.as_str();
        if lost > 0 {
            Counters::add(&counters.conversion_errors, lost);
            counter!("kmeta_conversion_errors_total", lost, "kind" => kind);
        }
        let n = group.len() as u64;
        histogram!("kmeta_flush_records", n as f64, "kind" => kind);
        match sink.submit(group) {
            Ok(()) => {
                Counters::add(&counters.flushes, 1);
                Counters::add(&counters.flushed_records, n);
                counter!("kmeta_flush_total", 1, "kind" => kind);
                debug!(kind, records = n, "batch flushed");
            }
            Err(e) => {
                Counters::add(&counters.sink_errors, 1);
                counter!("kmeta_sink_errors_total", 1, "kind" => kind);
                error!(kind, records = n, error = ?e, "sink rejected batch; dropped");
            }
        }
    }
}
