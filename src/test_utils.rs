//! Recording fakes for the logger and metrics capabilities.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::Level;

use crate::log::Logger;
use crate::metrics::{HistogramHandle, Metrics};

#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<(Level, String, String)>>,
}

impl RecordingLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, level: Level) -> usize {
        self.entries.lock().unwrap().iter().filter(|(l, _, _)| *l == level).count()
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _, _)| *l == level)
            .map(|(_, tag, msg)| format!("{tag}: {msg}"))
            .collect()
    }
}

impl Logger for RecordingLogger {
    fn log(&self, level: Level, tag: &str, message: fmt::Arguments<'_>) {
        self.entries.lock().unwrap().push((level, tag.to_owned(), message.to_string()));
    }
}

/// One `count_labels` call: subsystem, name, labels.
pub type CountCall = (String, String, Vec<(String, String)>);

#[derive(Default)]
pub struct RecordingMetrics {
    pub counts: Mutex<Vec<CountCall>>,
    pub histograms: Mutex<Vec<(String, String, Arc<RecordingHistogram>)>>,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counts(&self) -> Vec<CountCall> {
        self.counts.lock().unwrap().clone()
    }

    /// Total observations across every registered histogram.
    pub fn observations(&self) -> usize {
        self.histograms.lock().unwrap().iter().map(|(_, _, h)| h.observations()).sum()
    }

    pub fn histogram_count(&self) -> usize {
        self.histograms.lock().unwrap().len()
    }
}

impl Metrics for RecordingMetrics {
    fn count_labels(&self, subsystem: &str, name: &str, labels: &[(&str, &str)]) {
        let labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.counts.lock().unwrap().push((subsystem.to_owned(), name.to_owned(), labels));
    }

    fn add_histogram(&self, subsystem: &str, route: &str) -> Arc<dyn HistogramHandle> {
        let h = Arc::new(RecordingHistogram::default());
        self.histograms
            .lock()
            .unwrap()
            .push((subsystem.to_owned(), route.to_owned(), Arc::clone(&h)));
        h
    }

    fn render(&self) -> String {
        format!("counts {}", self.counts.lock().unwrap().len())
    }
}

#[derive(Default)]
pub struct RecordingHistogram {
    elapsed: Mutex<Vec<Duration>>,
}

impl RecordingHistogram {
    pub fn observations(&self) -> usize {
        self.elapsed.lock().unwrap().len()
    }
}

impl HistogramHandle for RecordingHistogram {
    fn record_time_elapsed(&self, elapsed: Duration) {
        self.elapsed.lock().unwrap().push(elapsed);
    }
}
