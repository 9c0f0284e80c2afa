//! Convert Chrome netlog captures to qlog.
//!
//! A netlog file carries integer-coded event types, source types and phases.
//! The names behind those codes change between Chrome versions, so every
//! conversion resolves them through the `constants` block of the file being
//! converted.
//!
//! Only events whose source is a `QUIC_SESSION` are kept. Each session
//! becomes one trace, and all times are made relative to the first kept
//! event of the capture.
//!
//! # Example
//!
//! ```no_run
//! use qlog_convert::netlog::NetlogConverter;
//!
//! let text = std::fs::read_to_string("chrome-net-export.json").unwrap();
//! let root: serde_json::Value = serde_json::from_str(&text).unwrap();
//!
//! let qlog = NetlogConverter::new().convert(&root).unwrap();
//! qlog.write(std::io::stdout(), true).unwrap();
//! ```

use qlog_parse::numeric::parse_number;
use qlog_parse::{QlogFile, QlogTrace, VantagePoint};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during netlog conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("netlog constants table '{0}' is missing")]
    MissingConstants(&'static str),

    #[error("invalid netlog: {0}")]
    InvalidNetlog(String),

    #[error("no QUIC session events found in netlog")]
    NoQuicSessions,
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Source type name of QUIC connections.
const QUIC_SESSION_SOURCE: &str = "QUIC_SESSION";

// ============================================================================
// Netlog format types
// ============================================================================

/// The code tables of a netlog `constants` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetlogConstants {
    #[serde(default)]
    pub log_event_types: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub log_source_type: Option<HashMap<String, i64>>,
    #[serde(default)]
    pub log_event_phase: Option<HashMap<String, i64>>,
}

/// One netlog event.
#[derive(Debug, Clone, Deserialize)]
pub struct NetlogEvent {
    pub source: NetlogSource,
    /// Absolute time in milliseconds. Chrome writes it as a string.
    #[serde(deserialize_with = "deserialize_time")]
    pub time: f64,
    #[serde(rename = "type")]
    pub event_type: i64,
    #[serde(default)]
    pub phase: i64,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// The entity an event belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct NetlogSource {
    pub id: u64,
    #[serde(rename = "type")]
    pub source_type: i64,
}

fn deserialize_time<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = Value::deserialize(deserializer)?;
    parse_number(&value).ok_or_else(|| D::Error::custom("expected a numeric time"))
}

// ============================================================================
// Code tables
// ============================================================================

/// Code-to-name lookups for one netlog file.
#[derive(Debug)]
struct NetlogTables {
    event_types: HashMap<i64, String>,
    source_types: HashMap<i64, String>,
    phases: HashMap<i64, String>,
}

impl NetlogTables {
    fn from_constants(constants: NetlogConstants) -> Result<Self> {
        Ok(Self {
            event_types: reverse(constants.log_event_types, "logEventTypes")?,
            source_types: reverse(constants.log_source_type, "logSourceType")?,
            phases: reverse(constants.log_event_phase, "logEventPhase")?,
        })
    }

    fn event_type(&self, code: i64) -> String {
        self.event_types
            .get(&code)
            .cloned()
            .unwrap_or_else(|| format!("UNKNOWN_EVENT_{}", code))
    }

    fn is_quic_session(&self, source_type: i64) -> bool {
        self.source_types
            .get(&source_type)
            .is_some_and(|name| name == QUIC_SESSION_SOURCE)
    }
}

fn reverse(
    table: Option<HashMap<String, i64>>,
    name: &'static str,
) -> Result<HashMap<i64, String>> {
    let table = table.ok_or(ConvertError::MissingConstants(name))?;
    Ok(table.into_iter().map(|(name, code)| (code, name)).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Begin,
    End,
    None,
}

impl Phase {
    fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("PHASE_BEGIN") => Phase::Begin,
            Some("PHASE_END") => Phase::End,
            _ => Phase::None,
        }
    }
}

// ============================================================================
// Event mapping
// ============================================================================

/// What a handler sees of one netlog event.
struct NetlogInput<'a> {
    name: &'a str,
    params: &'a Map<String, Value>,
    phase: Phase,
}

impl NetlogInput<'_> {
    fn is_sent(&self) -> bool {
        self.name.ends_with("_SENT")
    }

    fn owner(&self) -> &'static str {
        if self.is_sent() { "local" } else { "remote" }
    }

    fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

/// A qlog event produced from one netlog event.
struct Mapped {
    category: &'static str,
    event: String,
    data: Value,
}

impl Mapped {
    fn new(category: &'static str, event: &str, data: Map<String, Value>) -> Self {
        Self {
            category,
            event: event.to_string(),
            data: Value::Object(data),
        }
    }
}

type Handler = fn(&NetlogInput) -> Mapped;

/// Event-type handlers keyed by netlog event name.
const HANDLERS: &[(&str, Handler)] = &[
    ("QUIC_SESSION", session),
    ("QUIC_SESSION_CLOSED", session_closed),
    ("QUIC_SESSION_PACKET_SENT", packet_sent),
    ("QUIC_SESSION_PACKET_RECEIVED", datagram_received),
    ("QUIC_SESSION_UNAUTHENTICATED_PACKET_HEADER_RECEIVED", header_received),
    ("QUIC_SESSION_STREAM_FRAME_SENT", stream_frame),
    ("QUIC_SESSION_STREAM_FRAME_RECEIVED", stream_frame),
    ("QUIC_SESSION_ACK_FRAME_SENT", ack_frame),
    ("QUIC_SESSION_ACK_FRAME_RECEIVED", ack_frame),
    ("QUIC_SESSION_CRYPTO_FRAME_SENT", crypto_frame),
    ("QUIC_SESSION_CRYPTO_FRAME_RECEIVED", crypto_frame),
    ("QUIC_SESSION_PADDING_FRAME_SENT", padding_frame),
    ("QUIC_SESSION_PADDING_FRAME_RECEIVED", padding_frame),
    ("QUIC_SESSION_PING_FRAME_SENT", ping_frame),
    ("QUIC_SESSION_PING_FRAME_RECEIVED", ping_frame),
    ("QUIC_SESSION_RST_STREAM_FRAME_SENT", reset_stream_frame),
    ("QUIC_SESSION_RST_STREAM_FRAME_RECEIVED", reset_stream_frame),
    ("QUIC_SESSION_CONNECTION_CLOSE_FRAME_SENT", close_frame),
    ("QUIC_SESSION_CONNECTION_CLOSE_FRAME_RECEIVED", close_frame),
    ("QUIC_SESSION_WINDOW_UPDATE_FRAME_SENT", window_update_frame),
    ("QUIC_SESSION_WINDOW_UPDATE_FRAME_RECEIVED", window_update_frame),
    ("QUIC_SESSION_TRANSPORT_PARAMETERS_SENT", transport_parameters),
    ("QUIC_SESSION_TRANSPORT_PARAMETERS_RECEIVED", transport_parameters),
    ("QUIC_SESSION_VERSION_NEGOTIATION_PACKET_RECEIVED", version_negotiation),
    ("QUIC_SESSION_HANDSHAKE_CONFIRMED", handshake_confirmed),
];

fn handler_for(name: &str) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(event_name, _)| *event_name == name)
        .map(|(_, handler)| *handler)
}

/// Copy the listed params into a new map, renaming them on the way.
fn copy_params(input: &NetlogInput, fields: &[(&str, &str)]) -> Map<String, Value> {
    let mut data = Map::new();
    for (from, to) in fields {
        if let Some(value) = input.param(from) {
            data.insert(to.to_string(), value.clone());
        }
    }
    data
}

fn packet_type(encryption_level: Option<&Value>) -> &'static str {
    match encryption_level.and_then(Value::as_str) {
        Some("ENCRYPTION_INITIAL") => "initial",
        Some("ENCRYPTION_HANDSHAKE") => "handshake",
        Some("ENCRYPTION_ZERO_RTT") => "0RTT",
        Some("ENCRYPTION_FORWARD_SECURE") => "1RTT",
        _ => "unknown",
    }
}

fn session(input: &NetlogInput) -> Mapped {
    if input.phase == Phase::End {
        let mut data = Map::new();
        data.insert("new".into(), json!("closed"));
        return Mapped::new("connectivity", "connection_state_updated", data);
    }

    let data = copy_params(
        input,
        &[("host", "host"), ("port", "dst_port"), ("version", "quic_version")],
    );
    Mapped::new("connectivity", "connection_started", data)
}

fn session_closed(input: &NetlogInput) -> Mapped {
    let mut data = copy_params(input, &[("quic_error", "error_code"), ("details", "reason")]);
    let owner = match input.param("from_peer").and_then(Value::as_bool) {
        Some(true) => "remote",
        _ => "local",
    };
    data.insert("owner".into(), json!(owner));
    Mapped::new("connectivity", "connection_closed", data)
}

fn packet_sent(input: &NetlogInput) -> Mapped {
    let mut data = Map::new();
    data.insert(
        "packet_type".into(),
        json!(packet_type(input.param("encryption_level"))),
    );
    data.insert(
        "header".into(),
        Value::Object(copy_params(
            input,
            &[("packet_number", "packet_number"), ("size", "packet_size")],
        )),
    );
    data.extend(copy_params(input, &[("transmission_type", "transmission_type")]));
    Mapped::new("transport", "packet_sent", data)
}

fn datagram_received(input: &NetlogInput) -> Mapped {
    let data = copy_params(
        input,
        &[
            ("size", "byte_length"),
            ("peer_address", "peer_address"),
            ("self_address", "self_address"),
        ],
    );
    Mapped::new("transport", "datagrams_received", data)
}

fn header_received(input: &NetlogInput) -> Mapped {
    let packet_type = match input.param("long_header_type").and_then(Value::as_str) {
        Some("INITIAL") => "initial",
        Some("HANDSHAKE") => "handshake",
        Some("ZERO_RTT_PROTECTED") => "0RTT",
        Some("RETRY") => "retry",
        Some("VERSION_NEGOTIATION") => "version_negotiation",
        Some(_) => "unknown",
        None => "1RTT",
    };

    let mut data = Map::new();
    data.insert("packet_type".into(), json!(packet_type));
    data.insert(
        "header".into(),
        Value::Object(copy_params(
            input,
            &[("packet_number", "packet_number"), ("connection_id", "dcid")],
        )),
    );
    Mapped::new("transport", "packet_received", data)
}

/// Wrap one frame into a `frames_processed` event.
fn frame_event(input: &NetlogInput, frame_type: &str, mut frame: Map<String, Value>) -> Mapped {
    frame.insert("frame_type".into(), json!(frame_type));

    let direction = if input.is_sent() { "sent" } else { "received" };
    let mut data = Map::new();
    data.insert("direction".into(), json!(direction));
    data.insert("frames".into(), Value::Array(vec![Value::Object(frame)]));
    Mapped::new("transport", "frames_processed", data)
}

fn stream_frame(input: &NetlogInput) -> Mapped {
    let frame = copy_params(
        input,
        &[
            ("stream_id", "stream_id"),
            ("offset", "offset"),
            ("length", "length"),
            ("fin", "fin"),
        ],
    );
    frame_event(input, "stream", frame)
}

fn ack_frame(input: &NetlogInput) -> Mapped {
    let mut frame = copy_params(
        input,
        &[
            ("largest_observed", "largest_acknowledged"),
            ("missing_packets", "missing_packets"),
        ],
    );
    if let Some(delay_us) = input
        .param("delta_time_largest_observed_us")
        .and_then(parse_number)
    {
        frame.insert("ack_delay".into(), json!(delay_us / 1000.0));
    }
    frame_event(input, "ack", frame)
}

fn crypto_frame(input: &NetlogInput) -> Mapped {
    let frame = copy_params(
        input,
        &[
            ("offset", "offset"),
            ("data_length", "length"),
            ("encryption_level", "encryption_level"),
        ],
    );
    frame_event(input, "crypto", frame)
}

fn padding_frame(input: &NetlogInput) -> Mapped {
    let frame = copy_params(input, &[("num_padding_bytes", "payload_length")]);
    frame_event(input, "padding", frame)
}

fn ping_frame(input: &NetlogInput) -> Mapped {
    frame_event(input, "ping", Map::new())
}

fn reset_stream_frame(input: &NetlogInput) -> Mapped {
    let frame = copy_params(
        input,
        &[
            ("stream_id", "stream_id"),
            ("quic_rst_stream_error", "error_code"),
            ("offset", "final_size"),
        ],
    );
    frame_event(input, "reset_stream", frame)
}

fn close_frame(input: &NetlogInput) -> Mapped {
    let mut frame = copy_params(input, &[("quic_error", "error_code"), ("details", "reason")]);
    frame.insert("error_space".into(), json!("transport"));
    frame_event(input, "connection_close", frame)
}

fn window_update_frame(input: &NetlogInput) -> Mapped {
    let frame = copy_params(input, &[("stream_id", "stream_id"), ("byte_offset", "maximum")]);
    let frame_type = if frame.contains_key("stream_id") {
        "max_stream_data"
    } else {
        "max_data"
    };
    frame_event(input, frame_type, frame)
}

fn transport_parameters(input: &NetlogInput) -> Mapped {
    let mut data = copy_params(input, &[("quic_transport_parameters", "description")]);
    data.insert("owner".into(), json!(input.owner()));
    Mapped::new("transport", "parameters_set", data)
}

fn version_negotiation(input: &NetlogInput) -> Mapped {
    let data = copy_params(input, &[("versions", "server_versions")]);
    Mapped::new("transport", "version_information", data)
}

fn handshake_confirmed(_input: &NetlogInput) -> Mapped {
    let mut data = Map::new();
    data.insert("new".into(), json!("handshake_confirmed"));
    Mapped::new("connectivity", "connection_state_updated", data)
}

/// Events without a handler keep their params and phase.
fn passthrough(input: &NetlogInput, phase_name: &str) -> Mapped {
    let mut data = input.params.clone();
    data.insert("phase".into(), json!(phase_name));
    Mapped {
        category: "netlog",
        event: input.name.to_lowercase(),
        data: Value::Object(data),
    }
}

// ============================================================================
// Converter
// ============================================================================

/// Configuration for the netlog converter.
#[derive(Debug, Clone)]
pub struct NetlogConfig {
    /// Title of the produced qlog file.
    pub title: Option<String>,
    /// Vantage point name of every produced trace.
    pub vantage_point_name: String,
}

impl Default for NetlogConfig {
    fn default() -> Self {
        Self {
            title: None,
            vantage_point_name: "chrome".to_string(),
        }
    }
}

/// Converter from Chrome netlog to qlog.
#[derive(Debug, Clone, Default)]
pub struct NetlogConverter {
    config: NetlogConfig,
}

impl NetlogConverter {
    /// Create a new converter with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new converter with custom configuration.
    pub fn with_config(config: NetlogConfig) -> Self {
        Self { config }
    }

    /// Convert a parsed netlog root into a qlog file.
    pub fn convert(&self, root: &Value) -> Result<QlogFile> {
        let constants = root
            .get("constants")
            .ok_or(ConvertError::MissingConstants("constants"))?;
        let tables = NetlogTables::from_constants(NetlogConstants::deserialize(constants)?)?;
        let events = root
            .get("events")
            .and_then(Value::as_array)
            .ok_or_else(|| ConvertError::InvalidNetlog("'events' is not an array".into()))?;

        let mut file = QlogFile::new(
            self.config.title.clone(),
            Some("Converted from Chrome netlog".to_string()),
        );
        let mut sessions: HashMap<u64, usize> = HashMap::new();
        let mut time_zero: Option<f64> = None;
        let empty = Map::new();

        for (index, raw) in events.iter().enumerate() {
            let event = match NetlogEvent::deserialize(raw) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("skipping netlog event {}: {}", index, e);
                    continue;
                }
            };
            if !tables.is_quic_session(event.source.source_type) {
                continue;
            }

            let zero = *time_zero.get_or_insert(event.time);
            let name = tables.event_type(event.event_type);
            let phase_name = tables
                .phases
                .get(&event.phase)
                .cloned()
                .unwrap_or_else(|| event.phase.to_string());
            let input = NetlogInput {
                name: &name,
                params: event.params.as_ref().unwrap_or(&empty),
                phase: Phase::from_name(Some(phase_name.as_str())),
            };

            let trace_index = *sessions.entry(event.source.id).or_insert_with(|| {
                file.traces.push(self.session_trace(event.source.id, zero));
                file.traces.len() - 1
            });
            let trace = &mut file.traces[trace_index];

            if name == "QUIC_SESSION" && input.phase == Phase::Begin {
                if let Some(host) = input.param("host").and_then(Value::as_str) {
                    trace.title = Some(host.to_string());
                }
            }

            let mapped = match handler_for(&name) {
                Some(handler) => handler(&input),
                None => {
                    log::debug!("no handler for netlog event {}", name);
                    passthrough(&input, &phase_name)
                }
            };
            trace.push_event(event.time - zero, mapped.category, &mapped.event, mapped.data);
        }

        if file.traces.is_empty() {
            return Err(ConvertError::NoQuicSessions);
        }

        log::info!(
            "converted netlog: {} QUIC session(s), {} event(s)",
            file.traces.len(),
            file.event_count()
        );

        Ok(file)
    }

    fn session_trace(&self, source_id: u64, time_zero: f64) -> QlogTrace {
        let mut trace = QlogTrace::new(VantagePoint::new("client", &self.config.vantage_point_name));
        trace.title = Some(format!("QUIC session {}", source_id));
        trace.description = Some(format!("netlog source {}", source_id));
        trace
            .common_fields
            .insert("reference_time".into(), json!(time_zero));
        trace
    }
}
