//! qlog output records.
//!
//! Converters build a [`QlogFile`] and serialize it as draft-02 qlog, which
//! the loader reads back like any other qlog file.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::io::Write;
use thiserror::Error;

/// qlog version written by the converters.
pub const QLOG_VERSION: &str = "draft-02";

/// Errors that can occur while writing qlog output.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for qlog writing operations.
pub type WriteResult<T> = std::result::Result<T, WriteError>;

/// Where a trace was observed from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VantagePoint {
    /// `client`, `server` or `network`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Direction of observation for `network` vantage points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

impl VantagePoint {
    pub fn new(kind: &str, name: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            name: Some(name.to_string()),
            flow: None,
        }
    }
}

/// Per-trace configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub time_units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_offset: Option<f64>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            time_units: "ms".to_string(),
            time_offset: None,
        }
    }
}

/// One trace of a qlog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QlogTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub vantage_point: VantagePoint,
    #[serde(default)]
    pub configuration: Configuration,
    #[serde(default)]
    pub common_fields: Map<String, Value>,
    pub event_fields: Vec<String>,
    pub events: Vec<Value>,
}

impl QlogTrace {
    /// An empty trace using the converters' field order.
    pub fn new(vantage_point: VantagePoint) -> Self {
        Self {
            title: None,
            description: None,
            vantage_point,
            configuration: Configuration::default(),
            common_fields: Map::new(),
            event_fields: crate::event::DEFAULT_EVENT_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            events: Vec::new(),
        }
    }

    /// Append an event in `[relative_time, category, event, data]` order.
    pub fn push_event(&mut self, time: f64, category: &str, event: &str, data: Value) {
        self.events.push(event_record(time, category, event, data));
    }
}

/// A complete qlog file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QlogFile {
    pub qlog_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub summary: Map<String, Value>,
    pub traces: Vec<QlogTrace>,
}

impl QlogFile {
    pub fn new(title: Option<String>, description: Option<String>) -> Self {
        Self {
            qlog_version: QLOG_VERSION.to_string(),
            title,
            description,
            summary: Map::new(),
            traces: Vec::new(),
        }
    }

    /// Total number of events across all traces.
    pub fn event_count(&self) -> usize {
        self.traces.iter().map(|t| t.events.len()).sum()
    }

    /// Serialize into a JSON value suitable for the loader.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    /// Write the file as JSON.
    pub fn write<W: Write>(&self, mut writer: W, pretty: bool) -> WriteResult<()> {
        if pretty {
            serde_json::to_writer_pretty(&mut writer, self)?;
        } else {
            serde_json::to_writer(&mut writer, self)?;
        }
        writeln!(writer)?;
        Ok(())
    }
}

/// Build one positional event record.
pub fn event_record(time: f64, category: &str, event: &str, data: Value) -> Value {
    json!([time, category, event, data])
}
