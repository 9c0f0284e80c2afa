//! Build a [`ConnectionGroup`] from a parsed qlog root.
//!
//! The loader detects the dialect, creates one [`Connection`] per trace or
//! connection block and stores the raw event records. Events are not decoded
//! here; see [`Connection::decode`].

use crate::dialect::{Dialect, detect};
use crate::event::{EventParser, SchemaContext, TimeFormat};
use crate::model::{Connection, ConnectionGroup, ConnectionMeta, EventStore, TraceError};
use crate::numeric::parse_number;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that prevent a root from being loaded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    #[error("unrecognized trace format")]
    UnsupportedDialect,

    #[error("{0} input must be converted to qlog before loading")]
    NeedsConversion(Dialect),

    #[error("file contains no traces or connections")]
    NoConnections,
}

/// Result type for loading operations.
pub type Result<T> = std::result::Result<T, LoadError>;

/// Configuration for the loader.
#[derive(Debug, Clone, Default)]
pub struct LoaderConfig {
    /// File name or URL recorded on the group.
    pub origin: Option<String>,
    /// Split traces that mix several `group_id` values into one connection
    /// per group. Off by default, so each trace is one connection.
    pub split_by_group_id: bool,
}

/// Loader for qlog roots.
#[derive(Debug, Clone, Default)]
pub struct QlogLoader {
    config: LoaderConfig,
}

/// Load a root with the default configuration.
pub fn from_json(root: Value) -> Result<ConnectionGroup> {
    QlogLoader::new().from_json(root)
}

impl QlogLoader {
    /// Create a loader with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a loader with a custom configuration.
    pub fn with_config(config: LoaderConfig) -> Self {
        Self { config }
    }

    /// Load a parsed root.
    ///
    /// Roots that are not qlog (netlog, tshark JSON) are rejected with
    /// [`LoadError::NeedsConversion`].
    pub fn from_json(&self, root: Value) -> Result<ConnectionGroup> {
        let dialect = detect(&root).ok_or(LoadError::UnsupportedDialect)?;
        let parser = EventParser::for_dialect(dialect).ok_or(LoadError::NeedsConversion(dialect))?;

        let Value::Object(mut root) = root else {
            return Err(LoadError::UnsupportedDialect);
        };

        let blocks_key = match dialect {
            Dialect::PreSpec => "connections",
            _ => "traces",
        };
        let blocks = match root.remove(blocks_key) {
            Some(Value::Array(blocks)) => blocks,
            _ => Vec::new(),
        };

        let mut connections = Vec::new();
        for (index, block) in blocks.into_iter().enumerate() {
            match block {
                Value::Object(block) => connections.extend(self.load_block(parser, block)),
                _ => log::warn!("skipping {} entry {}: not an object", blocks_key, index),
            }
        }

        if connections.is_empty() {
            return Err(LoadError::NoConnections);
        }

        let text = |key: &str| root.get(key).and_then(Value::as_str).map(str::to_string);
        let group = ConnectionGroup {
            title: text("title"),
            description: text("description"),
            summary: root
                .get("summary")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            origin: self.config.origin.clone(),
            dialect,
            qlog_version: text("qlog_version"),
            connections,
        };

        log::info!(
            "loaded {} ({}): {} connection(s), {} event(s)",
            group.origin.as_deref().unwrap_or("qlog"),
            dialect,
            group.connections.len(),
            group.event_count()
        );

        Ok(group)
    }

    /// Turn one trace or connection block into connections.
    fn load_block(&self, parser: EventParser, mut block: Map<String, Value>) -> Vec<Connection> {
        let meta = ConnectionMeta::from_block(&block);

        if let Some(description) = block.get("error_description") {
            let description = description
                .as_str()
                .map_or_else(|| description.to_string(), str::to_string);
            log::warn!(
                "trace {} reports an error: {}",
                meta.title.as_deref().unwrap_or("(untitled)"),
                description
            );
            let uri = block.get("uri").and_then(Value::as_str).map(str::to_string);
            return vec![Connection::error_stub(meta, TraceError { description, uri })];
        }

        let mut events = match block.remove("events") {
            Some(Value::Array(events)) => events,
            Some(_) => {
                log::warn!("'events' is not an array; loading an empty connection");
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut context = parser.init(&block, &events);
        if context.time_format == TimeFormat::Delta {
            accumulate_delta_times(&mut events, &context);
            context.time_format = TimeFormat::Relative;
        }

        if parser == EventParser::DraftObject && self.config.split_by_group_id {
            if let Some(groups) = split_by_group_id(&events, &context) {
                return groups
                    .into_iter()
                    .map(|(group_id, indices)| {
                        let mut meta = meta.clone();
                        let label = group_id.as_deref().unwrap_or("no group_id");
                        meta.title = Some(match &meta.title {
                            Some(title) => format!("{} ({})", title, label),
                            None => label.to_string(),
                        });
                        meta.group_id = group_id;
                        let records = indices.into_iter().map(|i| events[i].clone()).collect();
                        Connection::new(meta, EventStore::new(parser, context.clone(), records))
                    })
                    .collect();
            }
        }

        vec![Connection::new(meta, EventStore::new(parser, context, events))]
    }
}

/// Rewrite delta times into times relative to the first event.
///
/// This is the one place the loader edits stored records: afterwards the
/// time slot of each record holds the running total.
fn accumulate_delta_times(events: &mut [Value], ctx: &SchemaContext) {
    let time_index = ctx.time_field_index();
    let mut elapsed = 0.0;

    for event in events.iter_mut() {
        let slot = match event {
            Value::Array(items) => items.get_mut(time_index.unwrap_or(0)),
            Value::Object(map) => ["delta_time", "time", "relative_time"]
                .into_iter()
                .find(|key| map.contains_key(*key))
                .and_then(|key| map.get_mut(key)),
            _ => None,
        };
        let Some(slot) = slot else { continue };
        if let Some(delta) = parse_number(slot) {
            elapsed += delta;
            *slot = Value::from(elapsed);
        }
    }
}

/// The `group_id` of an event, as a string.
fn group_id_of(event: &Value, ctx: &SchemaContext) -> Option<String> {
    let value = match event {
        Value::Array(items) => ctx.field_index("group_id").and_then(|i| items.get(i)),
        Value::Object(map) => map.get("group_id"),
        _ => None,
    }?;
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Event indices per `group_id` in first-seen order, or `None` when the
/// trace holds a single group.
fn split_by_group_id(
    events: &[Value],
    ctx: &SchemaContext,
) -> Option<Vec<(Option<String>, Vec<usize>)>> {
    let mut groups: Vec<(Option<String>, Vec<usize>)> = Vec::new();
    for (index, event) in events.iter().enumerate() {
        let id = group_id_of(event, ctx);
        match groups.iter_mut().find(|(existing, _)| *existing == id) {
            Some((_, indices)) => indices.push(index),
            None => groups.push((id, vec![index])),
        }
    }

    let distinct_ids = groups.iter().filter(|(id, _)| id.is_some()).count();
    (distinct_ids > 1).then_some(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DecodeError, TimeUnit};
    use serde_json::json;

    fn draft_root() -> Value {
        json!({
            "qlog_version": "draft-02",
            "title": "example",
            "description": "two traces",
            "summary": {"trace_count": 2},
            "traces": [
                {
                    "title": "client",
                    "vantage_point": {"type": "client"},
                    "configuration": {"time_units": "ms"},
                    "common_fields": {"reference_time": "1000", "ODCID": "abcd"},
                    "event_fields": ["relative_time", "category", "event", "data"],
                    "events": [
                        [0, "transport", "packet_sent", {"packet_number": 0}],
                        [5, "transport", "packet_received", {"packet_number": 0}],
                        [9, "recovery", "metrics_updated", {"bytes_in_flight": "1200"}]
                    ]
                },
                {
                    "title": "server",
                    "vantage_point": {"type": "server"},
                    "event_fields": ["relative_time", "category", "event", "data"],
                    "events": [
                        [1, "transport", "packet_received", {}]
                    ]
                }
            ]
        })
    }

    #[test]
    fn one_connection_per_trace() {
        let root = draft_root();
        let expected: Vec<Vec<(f64, String, String)>> = root["traces"]
            .as_array()
            .unwrap()
            .iter()
            .map(|trace| {
                trace["events"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|e| {
                        (
                            e[0].as_f64().unwrap(),
                            e[1].as_str().unwrap().to_string(),
                            e[2].as_str().unwrap().to_string(),
                        )
                    })
                    .collect()
            })
            .collect();

        let group = from_json(root).unwrap();

        assert_eq!(group.connections().len(), 2);
        for (connection, expected) in group.connections().iter().zip(expected) {
            let decoded = connection.decode_all();
            assert!(!decoded.is_partial());
            let tuples: Vec<(f64, String, String)> = decoded
                .events
                .into_iter()
                .map(|e| (e.time, e.category, e.name))
                .collect();
            assert_eq!(tuples, expected);
        }
    }

    #[test]
    fn group_metadata_is_read() {
        let group = QlogLoader::with_config(LoaderConfig {
            origin: Some("example.qlog".into()),
            ..LoaderConfig::default()
        })
        .from_json(draft_root())
        .unwrap();

        assert_eq!(group.title.as_deref(), Some("example"));
        assert_eq!(group.description.as_deref(), Some("two traces"));
        assert_eq!(group.summary["trace_count"], json!(2));
        assert_eq!(group.origin.as_deref(), Some("example.qlog"));
        assert_eq!(group.dialect, Dialect::DraftObject);
        assert_eq!(group.qlog_version.as_deref(), Some("draft-02"));

        let client = &group.connections()[0];
        assert_eq!(client.meta.title.as_deref(), Some("client"));
        assert_eq!(client.meta.common_fields["ODCID"], json!("abcd"));
        assert_eq!(client.time_unit(), TimeUnit::Milliseconds);
    }

    #[test]
    fn raw_events_are_stored_verbatim() {
        let group = from_json(draft_root()).unwrap();
        let client = &group.connections()[0];

        assert_eq!(
            client.raw_events()[2],
            json!([9, "recovery", "metrics_updated", {"bytes_in_flight": "1200"}])
        );
        assert_eq!(
            client.decode(2).unwrap().data["bytes_in_flight"],
            json!(1200)
        );
    }

    #[test]
    fn connection_refs_point_back_to_group() {
        let group = from_json(draft_root()).unwrap();

        for conn_ref in group.connection_refs() {
            assert_eq!(conn_ref.group.title.as_deref(), Some("example"));
            assert!(!conn_ref.connection.is_empty());
        }
    }

    #[test]
    fn pre_spec_root_loads() {
        let root = json!({
            "qlog_version": "0.1",
            "description": "legacy",
            "connections": [{
                "vantagepoint": "SERVER",
                "fields": ["time", "category", "type", "trigger", "data"],
                "events": [
                    [1000, "TRANSPORT", "PACKET_RECEIVED", "LINE", {"packet_number": "1"}],
                    [1004, "TRANSPORT", "PACKET_SENT", {"packet_number": "2"}],
                    [1008, "TRANSPORT"]
                ]
            }]
        });
        let group = from_json(root).unwrap();

        assert_eq!(group.dialect, Dialect::PreSpec);
        assert_eq!(group.description.as_deref(), Some("legacy"));
        let connection = &group.connections()[0];
        assert_eq!(
            connection.meta.vantage_point.as_ref().unwrap().kind.as_deref(),
            Some("SERVER")
        );

        let decoded = connection.decode_all();
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[0].time, 0.0);
        assert_eq!(decoded.events[0].trigger, Some(json!("LINE")));
        assert_eq!(decoded.events[1].time, 4.0);
        assert_eq!(decoded.events[1].trigger, None);
        assert_eq!(decoded.skipped[0].index, 2);
        assert_eq!(decoded.skipped[0].error, DecodeError::Arity(2));
    }

    #[test]
    fn error_traces_become_stubs() {
        let root = json!({
            "qlog_version": "draft-02",
            "traces": [
                {"error_description": "file could not be fetched", "uri": "https://example.com/a.qlog", "vantage_point": {"type": "server"}},
                {"event_fields": ["relative_time", "category", "event", "data"], "events": [[0, "a", "b", {}]]}
            ]
        });
        let group = from_json(root).unwrap();

        assert_eq!(group.connections().len(), 2);
        let stub = &group.connections()[0];
        assert!(stub.is_error());
        assert!(stub.is_empty());
        let error = stub.error().unwrap();
        assert_eq!(error.description, "file could not be fetched");
        assert_eq!(error.uri.as_deref(), Some("https://example.com/a.qlog"));
        assert_eq!(group.error_stubs().count(), 1);
    }

    #[test]
    fn only_error_traces_still_load() {
        let root = json!({
            "qlog_version": "draft-02",
            "traces": [{"error_description": "boom"}]
        });
        let group = from_json(root).unwrap();

        assert_eq!(group.connections().len(), 1);
        assert!(group.connections()[0].is_error());
    }

    #[test]
    fn unknown_root_is_unparseable() {
        assert_eq!(
            from_json(json!({"hello": "world"})).unwrap_err(),
            LoadError::UnsupportedDialect
        );
        assert_eq!(from_json(json!(42)).unwrap_err(), LoadError::UnsupportedDialect);
        assert_eq!(from_json(json!([])).unwrap_err(), LoadError::UnsupportedDialect);
    }

    #[test]
    fn converter_dialects_are_rejected() {
        assert_eq!(
            from_json(json!({"constants": {}, "events": []})).unwrap_err(),
            LoadError::NeedsConversion(Dialect::Netlog)
        );
        assert_eq!(
            from_json(json!([{"_source": {}}])).unwrap_err(),
            LoadError::NeedsConversion(Dialect::PcapJson)
        );
    }

    #[test]
    fn empty_traces_list_is_an_error() {
        let root = json!({"qlog_version": "draft-02", "traces": []});

        assert_eq!(from_json(root).unwrap_err(), LoadError::NoConnections);
    }

    #[test]
    fn delta_times_accumulate() {
        let root = json!({
            "qlog_version": "draft-01",
            "traces": [{
                "event_fields": ["delta_time", "category", "event", "data"],
                "events": [
                    [10, "a", "x", {}],
                    [5, "a", "y", {}],
                    ["2.5", "a", "z", {}]
                ]
            }]
        });
        let group = from_json(root).unwrap();
        let connection = &group.connections()[0];
        let times: Vec<f64> = connection.decode_all().events.iter().map(|e| e.time).collect();

        assert_eq!(times, vec![10.0, 15.0, 17.5]);
        assert_eq!(
            connection.context().unwrap().time_format,
            TimeFormat::Relative
        );
        assert_eq!(connection.raw_events()[1], json!([15.0, "a", "y", {}]));
        assert_eq!(connection.raw_events()[2][0], json!(17.5));
    }

    #[test]
    fn draft_00_uppercase_event_fields() {
        let root = json!({
            "qlog_version": "draft-00",
            "traces": [{
                "event_fields": ["relative_time", "CATEGORY", "EVENT_TYPE", "TRIGGER", "DATA"],
                "events": [
                    ["0", "TRANSPORT", "PACKET_SENT", "LINE", {"packet_number": "1"}],
                    ["3", "RECOVERY", "METRICS_UPDATE", "ACK_RX", {"cwnd": 14520}]
                ]
            }]
        });
        let group = from_json(root).unwrap();
        let decoded = group.connections()[0].decode_all();

        assert!(!decoded.is_partial());
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[0].category, "TRANSPORT");
        assert_eq!(decoded.events[0].name, "PACKET_SENT");
        assert_eq!(decoded.events[0].trigger, Some(json!("LINE")));
        assert_eq!(decoded.events[0].data["packet_number"], json!(1));
        assert_eq!(decoded.events[1].time, 3.0);
        assert_eq!(decoded.events[1].data["cwnd"], json!(14520));
    }

    fn mixed_group_root() -> Value {
        json!({
            "qlog_version": "draft-01",
            "traces": [{
                "title": "mixed",
                "event_fields": ["relative_time", "group_id", "category", "event", "data"],
                "events": [
                    [0, "aa", "transport", "packet_sent", {}],
                    [1, "bb", "transport", "packet_sent", {}],
                    [2, "aa", "transport", "packet_received", {}]
                ]
            }]
        })
    }

    fn splitting_loader() -> QlogLoader {
        QlogLoader::with_config(LoaderConfig {
            split_by_group_id: true,
            ..LoaderConfig::default()
        })
    }

    #[test]
    fn default_loader_keeps_one_connection_per_trace() {
        let group = from_json(mixed_group_root()).unwrap();

        assert_eq!(group.connections().len(), 1);
        let connection = &group.connections()[0];
        assert_eq!(connection.len(), 3);
        assert_eq!(connection.meta.group_id, None);
        assert_eq!(connection.meta.title.as_deref(), Some("mixed"));
    }

    #[test]
    fn traces_split_by_group_id_when_enabled() {
        let group = splitting_loader().from_json(mixed_group_root()).unwrap();

        assert_eq!(group.connections().len(), 2);
        let first = &group.connections()[0];
        assert_eq!(first.meta.group_id.as_deref(), Some("aa"));
        assert_eq!(first.meta.title.as_deref(), Some("mixed (aa)"));
        assert_eq!(first.len(), 2);
        assert_eq!(first.decode(1).unwrap().name, "packet_received");
        assert_eq!(group.connections()[1].len(), 1);
    }

    #[test]
    fn single_group_id_is_not_split() {
        let root = json!({
            "qlog_version": "0.3",
            "traces": [{
                "events": [
                    {"time": 0, "name": "transport:packet_sent", "group_id": "aa"},
                    {"time": 1, "name": "transport:packet_sent", "group_id": "aa"}
                ]
            }]
        });
        let group = splitting_loader().from_json(root).unwrap();

        assert_eq!(group.connections().len(), 1);
        assert_eq!(group.connections()[0].meta.group_id, None);
    }
}
