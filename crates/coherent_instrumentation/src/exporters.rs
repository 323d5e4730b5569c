//! Metric sinks.

use std::{
    fs::{File, OpenOptions}, io::{BufWriter, Write}, path::Path, sync::{Mutex, mpsc::Sender}
};

use serde_json::to_string;

use crate::recorder::{EnrichedMetricEvent, MetricExporter};

/// Appends one JSON object per line to a file.
pub struct JsonlExporter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlExporter {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl MetricExporter for JsonlExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        let Ok(serialised) = to_string(event) else {
            return;
        };
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(error) = writeln!(writer, "{serialised}").and_then(|()| writer.flush()) {
            tracing::error!(target: "coherent::instrument", ?error, "failed to write metric to jsonl");
        }
    }
}

/// Prints each event to stdout.
#[derive(Default)]
pub struct ConsoleExporter;

impl ConsoleExporter {
    pub fn new() -> Self {
        Self
    }
}

impl MetricExporter for ConsoleExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        if let Ok(serialised) = to_string(event) {
            println!("METRIC: {serialised}");
        }
    }
}

/// Forwards cloned events into an in-process channel.
pub struct ChannelExporter {
    sender: Sender<EnrichedMetricEvent>,
}

impl ChannelExporter {
    pub fn new(sender: Sender<EnrichedMetricEvent>) -> Self {
        Self { sender }
    }
}

impl MetricExporter for ChannelExporter {
    fn export(&self, event: &EnrichedMetricEvent) {
        let _ = self.sender.send(event.clone());
    }
}
