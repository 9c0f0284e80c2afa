//! Structural dialect detection.
//!
//! A parsed root is classified by one ordered chain of predicates over its
//! shape. The first predicate that matches decides the dialect; a root that
//! matches none is unknown. New dialects get a new variant and a new
//! predicate appended to [`DETECTORS`].

use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// A structurally distinct encoding of trace data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// Legacy `connections` + `fields` layout with positional event arrays.
    PreSpec,
    /// Versioned qlog with `traces`; events are arrays read through
    /// `event_fields` or named objects.
    DraftObject,
    /// Chrome netlog capture with an embedded `constants` table.
    Netlog,
    /// `tshark -T json` packet dissections.
    PcapJson,
}

impl Dialect {
    /// Whether the loader can read this dialect without conversion.
    pub fn is_qlog(self) -> bool {
        matches!(self, Dialect::PreSpec | Dialect::DraftObject)
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::PreSpec => "pre-spec qlog",
            Dialect::DraftObject => "draft qlog",
            Dialect::Netlog => "Chrome netlog",
            Dialect::PcapJson => "tshark JSON",
        };
        f.write_str(name)
    }
}

type Detector = fn(&Value) -> bool;

/// Predicates in evaluation order.
const DETECTORS: &[(Dialect, Detector)] = &[
    (Dialect::DraftObject, is_draft_object),
    (Dialect::PreSpec, is_pre_spec),
    (Dialect::Netlog, is_netlog),
    (Dialect::PcapJson, is_pcap_json),
];

/// Detect the dialect of a parsed root.
pub fn detect(root: &Value) -> Option<Dialect> {
    DETECTORS
        .iter()
        .find(|(_, matches)| matches(root))
        .map(|(dialect, _)| *dialect)
}

fn is_draft_object(root: &Value) -> bool {
    let has_traces = root.get("traces").is_some_and(Value::is_array);
    let draft_version = root
        .get("qlog_version")
        .and_then(Value::as_str)
        .is_some_and(is_draft_version);
    has_traces && draft_version
}

/// `draft-02`, `0.3`, `0.4`, ...
fn is_draft_version(version: &str) -> bool {
    let version = version.trim();
    let dotted = version.contains('.') && version.starts_with(|c: char| c.is_ascii_digit());
    version.starts_with("draft-") || dotted
}

fn is_pre_spec(root: &Value) -> bool {
    match root.get("connections").and_then(Value::as_array) {
        Some(connections) if !connections.is_empty() => connections
            .iter()
            .all(|conn| conn.get("fields").is_some_and(Value::is_array)),
        _ => false,
    }
}

fn is_netlog(root: &Value) -> bool {
    root.is_object() && root.get("constants").is_some() && root.get("events").is_some()
}

fn is_pcap_json(root: &Value) -> bool {
    match root.as_array() {
        Some(packets) if !packets.is_empty() => packets
            .iter()
            .all(|packet| packet.get("_source").is_some()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detects_draft_object() {
        let root = json!({"qlog_version": "draft-02", "traces": []});
        assert_eq!(detect(&root), Some(Dialect::DraftObject));

        let root = json!({"qlog_version": "0.3", "traces": [{}]});
        assert_eq!(detect(&root), Some(Dialect::DraftObject));
    }

    #[test]
    fn draft_needs_versioned_string() {
        let root = json!({"qlog_version": 2, "traces": []});
        assert_eq!(detect(&root), None);

        let root = json!({"qlog_version": "0xff000001", "traces": []});
        assert_eq!(detect(&root), None);
    }

    #[test]
    fn detects_pre_spec() {
        let root = json!({
            "qlog_version": "0.1",
            "connections": [{"fields": ["time", "category", "type", "trigger", "data"], "events": []}]
        });
        assert_eq!(detect(&root), Some(Dialect::PreSpec));
    }

    #[test]
    fn pre_spec_requires_fields_on_every_connection() {
        let root = json!({"connections": [{"fields": []}, {"events": []}]});
        assert_eq!(detect(&root), None);

        let root = json!({"connections": []});
        assert_eq!(detect(&root), None);
    }

    #[test]
    fn detects_netlog() {
        let root = json!({"constants": {}, "events": []});
        assert_eq!(detect(&root), Some(Dialect::Netlog));
    }

    #[test]
    fn detects_pcap_json() {
        let root = json!([{"_source": {"layers": {}}}, {"_source": {"layers": {}}}]);
        assert_eq!(detect(&root), Some(Dialect::PcapJson));
    }

    #[test]
    fn unknown_shapes() {
        for root in [
            json!({}),
            json!([]),
            json!([{"_index": "x"}]),
            json!("text"),
            json!(null),
            json!({"traces": []}),
            json!({"events": []}),
        ] {
            assert_eq!(detect(&root), None, "{} should not match", root);
        }
    }

    #[test]
    fn draft_wins_over_later_predicates() {
        let root = json!({
            "qlog_version": "draft-01",
            "traces": [],
            "constants": {},
            "events": []
        });
        assert_eq!(detect(&root), Some(Dialect::DraftObject));
    }
}
