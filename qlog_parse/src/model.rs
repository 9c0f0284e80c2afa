//! In-memory model of a loaded trace file.

use crate::dialect::Dialect;
use crate::event::{DecodeError, EventParser, EventView, SchemaContext, TimeUnit};
use crate::schema::VantagePoint;
use serde::Deserialize;
use serde_json::{Map, Value};

/// One loaded file.
#[derive(Debug, Clone)]
pub struct ConnectionGroup {
    pub title: Option<String>,
    pub description: Option<String>,
    pub summary: Map<String, Value>,
    /// File name or URL the group was loaded from.
    pub origin: Option<String>,
    /// Dialect of the source file (before any conversion).
    pub dialect: Dialect,
    pub qlog_version: Option<String>,
    pub(crate) connections: Vec<Connection>,
}

impl ConnectionGroup {
    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Connections paired with a reference back to this group.
    pub fn connection_refs(&self) -> impl Iterator<Item = ConnectionRef<'_>> {
        self.connections.iter().map(move |connection| ConnectionRef {
            group: self,
            connection,
        })
    }

    /// Total number of stored raw events.
    pub fn event_count(&self) -> usize {
        self.connections.iter().map(Connection::len).sum()
    }

    /// Connections that only carry an error description.
    pub fn error_stubs(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter(|c| c.is_error())
    }
}

/// A connection together with the group that owns it.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionRef<'g> {
    pub group: &'g ConnectionGroup,
    pub connection: &'g Connection,
}

/// Descriptive fields of a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub vantage_point: Option<VantagePoint>,
    pub configuration: Map<String, Value>,
    pub common_fields: Map<String, Value>,
    /// Set when a trace was split by `group_id`.
    pub group_id: Option<String>,
}

impl ConnectionMeta {
    /// Read metadata from a trace or connection block.
    pub fn from_block(block: &Map<String, Value>) -> Self {
        let text = |key: &str| block.get(key).and_then(Value::as_str).map(str::to_string);
        let object = |key: &str| {
            block
                .get(key)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        Self {
            title: text("title").or_else(|| text("name")),
            description: text("description"),
            vantage_point: block
                .get("vantage_point")
                .or_else(|| block.get("vantagepoint"))
                .and_then(parse_vantage_point),
            configuration: object("configuration"),
            common_fields: object("common_fields"),
            group_id: None,
        }
    }
}

fn parse_vantage_point(value: &Value) -> Option<VantagePoint> {
    match value {
        Value::String(kind) => Some(VantagePoint {
            kind: Some(kind.clone()),
            ..VantagePoint::default()
        }),
        Value::Object(_) => VantagePoint::deserialize(value).ok(),
        _ => None,
    }
}

/// A capture or processing failure reported in place of a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceError {
    pub description: String,
    pub uri: Option<String>,
}

/// Raw events of a connection plus what is needed to decode them.
#[derive(Debug, Clone)]
pub struct EventStore {
    parser: EventParser,
    context: SchemaContext,
    records: Vec<Value>,
}

impl EventStore {
    pub fn new(parser: EventParser, context: SchemaContext, records: Vec<Value>) -> Self {
        Self {
            parser,
            context,
            records,
        }
    }
}

#[derive(Debug, Clone)]
enum Content {
    Events(EventStore),
    Error(TraceError),
}

/// One logical connection within a group.
#[derive(Debug, Clone)]
pub struct Connection {
    pub meta: ConnectionMeta,
    content: Content,
}

/// An event that could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEvent {
    pub index: usize,
    pub error: DecodeError,
}

/// Result of decoding every event of a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedEvents {
    pub events: Vec<EventView>,
    pub skipped: Vec<SkippedEvent>,
}

impl DecodedEvents {
    /// Whether some events were skipped.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }
}

impl Connection {
    pub fn new(meta: ConnectionMeta, store: EventStore) -> Self {
        Self {
            meta,
            content: Content::Events(store),
        }
    }

    pub fn error_stub(meta: ConnectionMeta, error: TraceError) -> Self {
        Self {
            meta,
            content: Content::Error(error),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.content, Content::Error(_))
    }

    pub fn error(&self) -> Option<&TraceError> {
        match &self.content {
            Content::Error(error) => Some(error),
            Content::Events(_) => None,
        }
    }

    pub fn parser(&self) -> Option<EventParser> {
        match &self.content {
            Content::Events(store) => Some(store.parser),
            Content::Error(_) => None,
        }
    }

    pub fn context(&self) -> Option<&SchemaContext> {
        match &self.content {
            Content::Events(store) => Some(&store.context),
            Content::Error(_) => None,
        }
    }

    pub fn time_unit(&self) -> TimeUnit {
        self.context().map(|c| c.time_unit).unwrap_or_default()
    }

    /// Stored raw event records, in order.
    ///
    /// Records are kept as read, except that traces using `delta_time` have
    /// their time slot replaced by the accumulated relative time at load.
    pub fn raw_events(&self) -> &[Value] {
        match &self.content {
            Content::Events(store) => &store.records,
            Content::Error(_) => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.raw_events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_events().is_empty()
    }

    /// Append a raw event. Error stubs ignore appends.
    pub fn push_raw(&mut self, raw: Value) {
        if let Content::Events(store) = &mut self.content {
            store.records.push(raw);
        }
    }

    /// Decode the event at `index`.
    pub fn decode(&self, index: usize) -> Result<EventView, DecodeError> {
        match &self.content {
            Content::Error(error) => Err(DecodeError::ErrorStub(error.description.clone())),
            Content::Events(store) => {
                let raw = store
                    .records
                    .get(index)
                    .ok_or(DecodeError::OutOfRange(index))?;
                store.parser.decode(raw, &store.context)
            }
        }
    }

    /// Decode every event lazily, in order.
    pub fn events(&self) -> impl Iterator<Item = Result<EventView, DecodeError>> + '_ {
        (0..self.len()).map(move |index| self.decode(index))
    }

    /// Decode every event, skipping and logging the ones that fail.
    pub fn decode_all(&self) -> DecodedEvents {
        let mut decoded = DecodedEvents::default();
        for (index, result) in self.events().enumerate() {
            match result {
                Ok(view) => decoded.events.push(view),
                Err(error) => {
                    log::warn!(
                        "skipping event {} of {}: {}",
                        index,
                        self.meta.title.as_deref().unwrap_or("untitled connection"),
                        error
                    );
                    decoded.skipped.push(SkippedEvent { index, error });
                }
            }
        }
        decoded
    }
}
