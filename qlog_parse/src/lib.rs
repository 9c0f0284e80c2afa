//! Loader for qlog QUIC/HTTP3 traces.
//!
//! This library reads qlog files in their pre-spec and draft dialects and
//! exposes them as a [`ConnectionGroup`] of connections whose events are
//! decoded on demand.
//!
//! # Example
//!
//! ```no_run
//! use qlog_parse::{QlogLoader, parse_qlog_text};
//!
//! let text = std::fs::read_to_string("trace.qlog").unwrap();
//! let root = parse_qlog_text(&text).unwrap();
//! let group = QlogLoader::new().from_json(root).unwrap();
//!
//! for connection in group.connections() {
//!     for event in connection.decode_all().events {
//!         println!("{} {}:{}", event.time, event.category, event.name);
//!     }
//! }
//! ```

pub mod dialect;
pub mod event;
pub mod json;
pub mod loader;
pub mod model;
pub mod numeric;
pub mod schema;

pub use dialect::{Dialect, detect};
pub use event::{DecodeError, EventParser, EventView, SchemaContext, TimeFormat, TimeUnit};
pub use json::{
    JsonNode, ParseError, QlogInput, fold_duplicates, parse_json_with_deduplication,
    parse_multimap, parse_qlog_text,
};
pub use loader::{LoadError, LoaderConfig, QlogLoader};
pub use model::{
    Connection, ConnectionGroup, ConnectionMeta, ConnectionRef, DecodedEvents, EventStore,
    SkippedEvent, TraceError,
};
pub use schema::{
    Configuration, QLOG_VERSION, QlogFile, QlogTrace, VantagePoint, WriteError, WriteResult,
};
