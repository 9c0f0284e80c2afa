//! Trace converters and the end-to-end loading pipeline.
//!
//! This crate turns trace formats that are not qlog into qlog and ties the
//! converters to the [`qlog_parse`] loader.
//!
//! # Available Converters
//!
//! - [`netlog`] - Convert Chrome netlog captures to qlog
//! - [`pcap`] - Convert tshark JSON packet dissections to qlog
//!
//! # Example
//!
//! ```no_run
//! use qlog_convert::input::read_input_file;
//! use qlog_convert::load_any;
//! use std::path::Path;
//!
//! let text = read_input_file(Path::new("chrome-net-export.json.gz")).unwrap();
//! let group = load_any(&text, Some("chrome-net-export.json.gz")).unwrap();
//!
//! println!("{} connection(s) from {}", group.connections().len(), group.dialect);
//! ```

pub mod input;
pub mod netlog;
pub mod pcap;

// Re-export qlog_parse for convenience
pub use qlog_parse;

use netlog::{NetlogConfig, NetlogConverter};
use pcap::{PcapConfig, PcapConverter};
use qlog_parse::{
    ConnectionGroup, Dialect, LoadError, LoaderConfig, ParseError, QlogLoader, detect,
    parse_json_with_deduplication, parse_qlog_text,
};
use serde_json::Value;
use thiserror::Error;

/// Errors from any stage of the pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("netlog conversion error: {0}")]
    Netlog(#[from] netlog::ConvertError),

    #[error("capture conversion error: {0}")]
    Pcap(#[from] pcap::ConvertError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Configuration for every stage of the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub netlog: NetlogConfig,
    pub pcap: PcapConfig,
    pub loader: LoaderConfig,
}

/// Parse trace text of any supported format.
///
/// Array roots (tshark JSON) go through the duplicate-key preserving parser;
/// everything else through [`parse_qlog_text`], which also assembles JSON-SEQ
/// and NDJSON streams.
pub fn parse_any(text: &str) -> Result<Value> {
    let body = text.trim_start_matches('\u{feff}').trim_start();
    if body.starts_with('[') {
        Ok(parse_json_with_deduplication(body)?)
    } else {
        Ok(parse_qlog_text(text)?)
    }
}

/// Convert a parsed root into a qlog root.
///
/// Returns the dialect of the input along with the qlog root. qlog inputs are
/// returned unchanged.
pub fn to_qlog(root: Value, config: &PipelineConfig) -> Result<(Dialect, Value)> {
    let dialect = detect(&root).ok_or(LoadError::UnsupportedDialect)?;
    log::debug!("detected {}", dialect);

    let qlog = match dialect {
        Dialect::PreSpec | Dialect::DraftObject => root,
        Dialect::Netlog => NetlogConverter::with_config(config.netlog.clone())
            .convert(&root)?
            .to_value()?,
        Dialect::PcapJson => PcapConverter::with_config(config.pcap.clone())
            .convert(&root)?
            .to_value()?,
    };
    Ok((dialect, qlog))
}

/// Parse, convert and load trace text with a custom configuration.
pub fn load_any_with_config(text: &str, config: &PipelineConfig) -> Result<ConnectionGroup> {
    let root = parse_any(text)?;
    let (dialect, qlog) = to_qlog(root, config)?;

    let mut group = QlogLoader::with_config(config.loader.clone()).from_json(qlog)?;
    group.dialect = dialect;
    Ok(group)
}

/// Parse, convert and load trace text of any supported format.
///
/// `origin` names the file or URL the text came from.
pub fn load_any(text: &str, origin: Option<&str>) -> Result<ConnectionGroup> {
    let config = PipelineConfig {
        loader: LoaderConfig {
            origin: origin.map(str::to_string),
            ..LoaderConfig::default()
        },
        ..PipelineConfig::default()
    };
    load_any_with_config(text, &config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETLOG: &str = r#"{
        "constants": {
            "logEventTypes": {"QUIC_SESSION": 1, "QUIC_SESSION_PACKET_SENT": 2},
            "logSourceType": {"URL_REQUEST": 1, "QUIC_SESSION": 2},
            "logEventPhase": {"PHASE_NONE": 0, "PHASE_BEGIN": 1, "PHASE_END": 2}
        },
        "events": [
            {"source": {"id": 4, "type": 2}, "time": "500", "type": 1, "phase": 1, "params": {"host": "example.org"}},
            {"source": {"id": 9, "type": 1}, "time": "501", "type": 1, "phase": 1},
            {"source": {"id": 4, "type": 2}, "time": "510", "type": 2, "phase": 0, "params": {"packet_number": 0, "size": 1250}}
        ]
    }"#;

    const CAPTURE: &str = r#"[
        {"_source": {"layers": {
            "frame": {"frame.time_epoch": "10.000", "frame.len": "100"},
            "ip": {"ip.src": "10.0.0.1", "ip.dst": "10.0.0.2"},
            "tcp": {"tcp.srcport": "1000", "tcp.dstport": "443", "tcp.stream": "0"},
            "tls": {
                "tls.record": {"tls.record.content_type": "23", "tls.record.length": "20"},
                "tls.record": {"tls.record.content_type": "23", "tls.record.length": "30"}
            }
        }}}
    ]"#;

    #[test]
    fn loads_netlog() {
        let group = load_any(NETLOG, Some("net-export.json")).unwrap();

        assert_eq!(group.dialect, Dialect::Netlog);
        assert_eq!(group.origin.as_deref(), Some("net-export.json"));
        let connection = &group.connections()[0];
        assert_eq!(connection.meta.title.as_deref(), Some("example.org"));

        let times: Vec<f64> = connection.decode_all().events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.0, 10.0]);
    }

    #[test]
    fn loads_capture_with_repeated_keys() {
        let group = load_any(CAPTURE, None).unwrap();

        assert_eq!(group.dialect, Dialect::PcapJson);
        let event = group.connections()[0].decode(0).unwrap();
        assert_eq!(event.name, "packet_sent");
        assert_eq!(event.data["frames"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn loads_qlog_and_json_seq() {
        let text = "\u{1e}{\"qlog_version\": \"0.3\", \"trace\": {\"vantage_point\": {\"type\": \"client\"}}}\n\
                    \u{1e}{\"time\": 1, \"name\": \"transport:packet_sent\", \"data\": {}}\n\
                    \u{1e}{\"time\": 2, \"name\": \"transport:packet_received\", \"data\": {}}\n";
        let group = load_any(text, None).unwrap();

        assert_eq!(group.dialect, Dialect::DraftObject);
        assert_eq!(group.connections().len(), 1);
        assert_eq!(group.connections()[0].len(), 2);
    }

    #[test]
    fn errors_name_their_stage() {
        assert!(matches!(
            load_any(r#"{"hello": "world"}"#, None),
            Err(PipelineError::Load(LoadError::UnsupportedDialect))
        ));
        assert!(matches!(
            load_any(r#"{"traces": [}"#, None),
            Err(PipelineError::Parse(_))
        ));
        assert!(matches!(
            load_any(r#"{"constants": {}, "events": []}"#, None),
            Err(PipelineError::Netlog(netlog::ConvertError::MissingConstants(_)))
        ));
    }

    #[test]
    fn to_qlog_keeps_qlog_roots() {
        let root: Value =
            serde_json::from_str(r#"{"qlog_version": "draft-02", "traces": [{"events": []}]}"#)
                .unwrap();
        let (dialect, qlog) = to_qlog(root.clone(), &PipelineConfig::default()).unwrap();

        assert_eq!(dialect, Dialect::DraftObject);
        assert_eq!(qlog, root);
    }
}
