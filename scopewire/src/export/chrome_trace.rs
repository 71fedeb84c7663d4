use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::ExportError;
use crate::trace_data::TraceEvent;

/// Chrome trace exporter for timeline visualization
///
/// Events are collected unsorted from any number of sources and ordered once,
/// by timestamp, when they are written. The sort is stable so records with
/// equal timestamps (such as metadata at `ts = 0`, or a scope that ends where
/// the next begins) keep their collection order.
#[derive(Debug, Default)]
pub struct ChromeTraceExporter {
    events: Vec<TraceEvent>,
}

impl ChromeTraceExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        Self { events }
    }

    pub fn add_event(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn extend(&mut self, events: impl IntoIterator<Item = TraceEvent>) {
        self.events.extend(events);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events in output order
    pub fn sorted_events(&self) -> Vec<&TraceEvent> {
        let mut sorted: Vec<&TraceEvent> = self.events.iter().collect();
        sorted.sort_by(|a, b| a.ts.total_cmp(&b.ts));
        sorted
    }

    /// Write the JSON array to `writer`.
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn export<W: Write>(&self, writer: &mut W) -> Result<(), ExportError> {
        serde_json::to_writer(&mut *writer, &self.sorted_events())?;
        writer.flush()?;
        Ok(())
    }

    /// Serialized JSON array as a string
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string(&self.sorted_events())?)
    }

    /// Write the JSON array to a file at `path`, replacing it.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or written.
    pub fn export_to_file(&self, path: &Path) -> Result<(), ExportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.export(&mut writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Pid, Tid};

    #[test]
    fn test_export_sorts_by_timestamp() {
        let mut exporter = ChromeTraceExporter::new();
        exporter.add_event(TraceEvent::end(Pid(1), Tid(1), 20.0, "late"));
        exporter.add_event(TraceEvent::begin(Pid(1), Tid(1), 10.0, "early"));

        let mut buffer = Vec::new();
        exporter.export(&mut buffer).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        let array = parsed.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["name"], "early");
        assert_eq!(array[1]["ph"], "E");
    }

    #[test]
    fn test_equal_timestamps_keep_collection_order() {
        let exporter = ChromeTraceExporter::from_events(vec![
            TraceEvent::end(Pid(1), Tid(1), 5.0, "a"),
            TraceEvent::begin(Pid(1), Tid(1), 5.0, "b"),
        ]);
        let names: Vec<&str> = exporter.sorted_events().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn test_empty_export_is_empty_array() {
        assert_eq!(ChromeTraceExporter::new().to_json().unwrap(), "[]");
    }
}
