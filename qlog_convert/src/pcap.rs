//! Convert tshark JSON packet dissections to qlog.
//!
//! The input is the output of `tshark -T json`: an array of packets, each
//! wrapping its protocol layers under `_source.layers`. tshark repeats keys
//! when a packet carries several instances of a layer or field (two TLS
//! records, for example), so the input should be parsed with
//! [`qlog_parse::parse_json_with_deduplication`]. Every layer and field
//! accessor here accepts either a single value or a folded list.
//!
//! Each TCP stream becomes one trace. The endpoint that sent the first
//! packet of a stream is the client, so its packets are `packet_sent` and
//! the peer's are `packet_received`.
//!
//! # Example
//!
//! ```no_run
//! use qlog_convert::pcap::PcapConverter;
//! use qlog_parse::parse_json_with_deduplication;
//!
//! let text = std::fs::read_to_string("capture.json").unwrap();
//! let root = parse_json_with_deduplication(&text).unwrap();
//!
//! let qlog = PcapConverter::new().convert(&root).unwrap();
//! println!("{} trace(s)", qlog.traces.len());
//! ```

use qlog_parse::numeric::{parse_number, parse_u64};
use qlog_parse::{QlogFile, QlogTrace, VantagePoint};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors that can occur during capture conversion.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("invalid capture: {0}")]
    InvalidCapture(String),

    #[error("no TCP packets found in capture")]
    NoTcpPackets,
}

pub type Result<T> = std::result::Result<T, ConvertError>;

// ============================================================================
// Layer access
// ============================================================================

/// The objects behind a layer or sub-tree that may have been folded into a
/// list by duplicate-key parsing.
fn objects(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().flat_map(objects).collect(),
        _ => Vec::new(),
    }
}

/// First scalar value of a field, looking through folded lists.
fn scalar(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(scalar),
        Value::Object(_) | Value::Null => None,
        other => Some(other),
    }
}

/// First value of `key` across every instance of a layer.
fn field<'a>(layer: Option<&'a Value>, key: &str) -> Option<&'a Value> {
    let layer = layer?;
    objects(layer)
        .into_iter()
        .find_map(|map| map.get(key).and_then(scalar))
}

fn field_str(layer: Option<&Value>, key: &str) -> Option<String> {
    field(layer, key).map(|value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn field_u64(layer: Option<&Value>, key: &str) -> Option<u64> {
    field(layer, key).and_then(parse_u64)
}

fn field_f64(layer: Option<&Value>, key: &str) -> Option<f64> {
    field(layer, key).and_then(parse_number)
}

// ============================================================================
// Packet extraction
// ============================================================================

/// An address and port.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    address: String,
    port: u64,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// The fields of one TCP packet that end up in qlog.
#[derive(Debug, Clone)]
struct TcpPacket {
    stream: u64,
    src: Endpoint,
    dst: Endpoint,
    /// Capture time in seconds since the epoch.
    epoch: Option<f64>,
    /// Seconds since the start of the capture.
    time_relative: Option<f64>,
    number: Option<u64>,
    frame_length: Option<u64>,
    payload_length: Option<u64>,
    seq: Option<u64>,
    ack: Option<u64>,
    flags: Option<u64>,
    window: Option<u64>,
    tls_records: Vec<Value>,
}

/// Read a TCP packet out of its layers. Packets without a `tcp` layer yield
/// `None`.
fn extract_packet(layers: &Map<String, Value>) -> Option<TcpPacket> {
    let tcp = layers.get("tcp")?;
    let frame = layers.get("frame");
    let ip = layers.get("ip");
    let ipv6 = layers.get("ipv6");

    let src_address = field_str(ip, "ip.src").or_else(|| field_str(ipv6, "ipv6.src"));
    let dst_address = field_str(ip, "ip.dst").or_else(|| field_str(ipv6, "ipv6.dst"));

    let stream = field_u64(Some(tcp), "tcp.stream")?;
    let src = Endpoint {
        address: src_address.unwrap_or_else(|| "unknown".into()),
        port: field_u64(Some(tcp), "tcp.srcport")?,
    };
    let dst = Endpoint {
        address: dst_address.unwrap_or_else(|| "unknown".into()),
        port: field_u64(Some(tcp), "tcp.dstport")?,
    };

    Some(TcpPacket {
        stream,
        src,
        dst,
        epoch: field_f64(frame, "frame.time_epoch"),
        time_relative: field_f64(frame, "frame.time_relative"),
        number: field_u64(frame, "frame.number"),
        frame_length: field_u64(frame, "frame.len"),
        payload_length: field_u64(Some(tcp), "tcp.len"),
        seq: field_u64(Some(tcp), "tcp.seq"),
        ack: field_u64(Some(tcp), "tcp.ack"),
        flags: field_u64(Some(tcp), "tcp.flags"),
        window: field_u64(Some(tcp), "tcp.window_size_value")
            .or_else(|| field_u64(Some(tcp), "tcp.window_size")),
        tls_records: tls_records(layers),
    })
}

const TCP_FLAGS: [(u64, &str); 8] = [
    (0x01, "FIN"),
    (0x02, "SYN"),
    (0x04, "RST"),
    (0x08, "PSH"),
    (0x10, "ACK"),
    (0x20, "URG"),
    (0x40, "ECE"),
    (0x80, "CWR"),
];

fn flag_names(flags: u64) -> Vec<&'static str> {
    TCP_FLAGS
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

fn tls_content_type(code: u64) -> String {
    match code {
        20 => "change_cipher_spec".into(),
        21 => "alert".into(),
        22 => "handshake".into(),
        23 => "application_data".into(),
        other => format!("unknown({})", other),
    }
}

fn tls_version(code: u64) -> String {
    match code {
        0x0300 => "SSL 3.0".into(),
        0x0301 => "TLS 1.0".into(),
        0x0302 => "TLS 1.1".into(),
        0x0303 => "TLS 1.2".into(),
        0x0304 => "TLS 1.3".into(),
        other => format!("0x{:04x}", other),
    }
}

/// TLS records of a packet as qlog frames. Older tshark versions name the
/// layer `ssl`.
fn tls_records(layers: &Map<String, Value>) -> Vec<Value> {
    let (layer, prefix) = match (layers.get("tls"), layers.get("ssl")) {
        (Some(tls), _) => (tls, "tls"),
        (None, Some(ssl)) => (ssl, "ssl"),
        (None, None) => return Vec::new(),
    };
    let record_key = format!("{}.record", prefix);

    let mut frames = Vec::new();
    for instance in objects(layer) {
        let Some(records) = instance.get(&record_key) else {
            continue;
        };
        for record in objects(records) {
            let record = Value::Object(record.clone());
            let mut frame = Map::new();
            frame.insert("frame_type".into(), json!("tls_record"));
            if let Some(code) = field_u64(Some(&record), &format!("{}.content_type", record_key)) {
                frame.insert("content_type".into(), json!(tls_content_type(code)));
            }
            if let Some(code) = field_u64(Some(&record), &format!("{}.version", record_key)) {
                frame.insert("version".into(), json!(tls_version(code)));
            }
            if let Some(length) = field_u64(Some(&record), &format!("{}.length", record_key)) {
                frame.insert("length".into(), json!(length));
            }
            frames.push(Value::Object(frame));
        }
    }
    frames
}

/// qlog `data` for one packet.
fn packet_data(packet: &TcpPacket) -> Value {
    let mut header = Map::new();
    let mut put = |key: &str, value: Option<u64>| {
        if let Some(value) = value {
            header.insert(key.to_string(), json!(value));
        }
    };
    put("packet_number", packet.number);
    put("packet_size", packet.frame_length);
    put("payload_length", packet.payload_length);
    put("sequence_number", packet.seq);
    put("ack_number", packet.ack);
    put("window", packet.window);
    if let Some(flags) = packet.flags {
        header.insert("flags".into(), json!(flag_names(flags)));
    }

    let mut data = Map::new();
    data.insert("packet_type".into(), json!("tcp"));
    data.insert("header".into(), Value::Object(header));
    data.insert("src".into(), json!(packet.src.to_string()));
    data.insert("dst".into(), json!(packet.dst.to_string()));
    if !packet.tls_records.is_empty() {
        data.insert("frames".into(), Value::Array(packet.tls_records.clone()));
    }
    Value::Object(data)
}

// ============================================================================
// Converter
// ============================================================================

/// Configuration for the capture converter.
#[derive(Debug, Clone, Default)]
pub struct PcapConfig {
    /// Title of the produced qlog file.
    pub title: Option<String>,
}

/// Converter from tshark JSON to qlog.
#[derive(Debug, Clone, Default)]
pub struct PcapConverter {
    config: PcapConfig,
}

struct StreamState {
    trace_index: usize,
    initiator: Endpoint,
}

/// Clock that event times are measured on, latched from the first TCP packet.
#[derive(Debug, Clone, Copy)]
enum TimeBase {
    Epoch(f64),
    Relative(f64),
}

impl TimeBase {
    fn latch(packet: &TcpPacket) -> Option<Self> {
        packet
            .epoch
            .map(TimeBase::Epoch)
            .or_else(|| packet.time_relative.map(TimeBase::Relative))
    }

    /// Milliseconds since the first TCP packet, on this base's clock only.
    fn millis(&self, packet: &TcpPacket) -> Option<f64> {
        match *self {
            TimeBase::Epoch(zero) => packet.epoch.map(|epoch| (epoch - zero) * 1000.0),
            TimeBase::Relative(zero) => packet
                .time_relative
                .map(|relative| (relative - zero) * 1000.0),
        }
    }

    fn reference_epoch(&self) -> Option<f64> {
        match *self {
            TimeBase::Epoch(zero) => Some(zero),
            TimeBase::Relative(_) => None,
        }
    }
}

impl PcapConverter {
    /// Create a new converter with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new converter with custom configuration.
    pub fn with_config(config: PcapConfig) -> Self {
        Self { config }
    }

    /// Convert a parsed tshark JSON array into a qlog file.
    pub fn convert(&self, root: &Value) -> Result<QlogFile> {
        let packets = root
            .as_array()
            .ok_or_else(|| ConvertError::InvalidCapture("expected an array of packets".into()))?;

        let mut file = QlogFile::new(
            self.config.title.clone(),
            Some("Converted from tshark JSON".to_string()),
        );
        let mut streams: HashMap<u64, StreamState> = HashMap::new();
        let mut base: Option<TimeBase> = None;

        for (index, raw) in packets.iter().enumerate() {
            let layers = raw
                .get("_source")
                .and_then(|source| source.get("layers"))
                .and_then(Value::as_object);
            let Some(layers) = layers else {
                log::warn!("skipping packet {}: no _source.layers", index);
                continue;
            };
            let Some(packet) = extract_packet(layers) else {
                log::debug!("skipping packet {}: not TCP", index);
                continue;
            };

            if base.is_none() {
                base = TimeBase::latch(&packet);
            }
            let Some(base) = base else {
                log::warn!("skipping packet {}: no timestamp", index);
                continue;
            };
            let Some(time) = base.millis(&packet) else {
                log::warn!("skipping packet {}: no timestamp on the capture clock", index);
                continue;
            };

            let state = streams.entry(packet.stream).or_insert_with(|| {
                file.traces.push(stream_trace(&packet, base.reference_epoch()));
                StreamState {
                    trace_index: file.traces.len() - 1,
                    initiator: packet.src.clone(),
                }
            });
            let event = if packet.src == state.initiator {
                "packet_sent"
            } else {
                "packet_received"
            };
            file.traces[state.trace_index].push_event(time, "transport", event, packet_data(&packet));
        }

        if file.traces.is_empty() {
            return Err(ConvertError::NoTcpPackets);
        }

        log::info!(
            "converted capture: {} TCP stream(s), {} packet(s)",
            file.traces.len(),
            file.event_count()
        );

        Ok(file)
    }
}

/// A capture observes both peers, so the vantage point is `network` named
/// after the initiator, with the flow seen from the client side.
fn stream_trace(first: &TcpPacket, first_epoch: Option<f64>) -> QlogTrace {
    let mut vantage_point = VantagePoint::new("network", &first.src.to_string());
    vantage_point.flow = Some("client".to_string());
    let mut trace = QlogTrace::new(vantage_point);
    trace.title = Some(format!("TCP stream {}", first.stream));
    trace.description = Some(format!("{} -> {}", first.src, first.dst));
    trace.common_fields.insert("protocol_type".into(), json!("TCP"));
    if let Some(epoch) = first_epoch {
        trace
            .common_fields
            .insert("reference_time".into(), json!(epoch * 1000.0));
    }
    trace
}
