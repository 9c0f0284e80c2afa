//! Per-dialect event decoding.
//!
//! Raw event records are stored untouched by the loader. Decoding is a pure
//! function of the raw record and the connection's [`SchemaContext`], so the
//! same record can be decoded any number of times, in any order.

use crate::dialect::Dialect;
use crate::numeric::{normalize_data, parse_number};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors that can occur while decoding a single event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("event array has {0} elements, expected 4 or 5")]
    Arity(usize),

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' is malformed: {reason}")]
    MalformedField { field: String, reason: String },

    #[error("event record is neither an array nor an object")]
    UnexpectedShape,

    #[error("event index {0} is out of range")]
    OutOfRange(usize),

    #[error("connection is an error stub: {0}")]
    ErrorStub(String),
}

/// Result type for event decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Field names that can carry an event's time, in lookup order.
pub const TIME_FIELDS: [&str; 3] = ["relative_time", "time", "delta_time"];

/// Field order assumed for array events when a trace declares none.
pub const DEFAULT_EVENT_FIELDS: [&str; 4] = ["relative_time", "category", "event", "data"];

/// Unit of the time values in a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Microseconds,
}

impl TimeUnit {
    /// Parse a qlog `time_units` value.
    pub fn parse(units: &str) -> Option<Self> {
        match units.trim() {
            "ms" => Some(TimeUnit::Milliseconds),
            "us" | "µs" => Some(TimeUnit::Microseconds),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "ms",
            TimeUnit::Microseconds => "us",
        }
    }

    /// Convert a time in this unit to milliseconds.
    pub fn to_millis(self, time: f64) -> f64 {
        match self {
            TimeUnit::Milliseconds => time,
            TimeUnit::Microseconds => time / 1000.0,
        }
    }
}

/// How raw time values relate to the reference time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFormat {
    /// Times are already relative to the reference time.
    #[default]
    Relative,
    /// Times are absolute; the reference time is subtracted.
    Absolute,
    /// Times are deltas from the previous event.
    Delta,
}

impl TimeFormat {
    /// Parse a qlog `time_format` value.
    pub fn parse(format: &str) -> Option<Self> {
        match format.trim() {
            "relative" => Some(TimeFormat::Relative),
            "absolute" => Some(TimeFormat::Absolute),
            "delta" => Some(TimeFormat::Delta),
            _ => None,
        }
    }

    /// Time format implied by an `event_fields` entry.
    fn from_field_name(name: &str) -> Option<Self> {
        match name {
            "relative_time" => Some(TimeFormat::Relative),
            "time" => Some(TimeFormat::Absolute),
            "delta_time" => Some(TimeFormat::Delta),
            _ => None,
        }
    }
}

/// Per-connection decoding parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaContext {
    /// Unit of raw and decoded times.
    pub time_unit: TimeUnit,
    /// How raw times relate to `reference_time`.
    pub time_format: TimeFormat,
    /// Subtracted from absolute times.
    pub reference_time: f64,
    /// Added to every decoded time.
    pub time_offset: f64,
    /// Declared positions of fields in array events.
    pub field_order: Vec<String>,
    /// Values shared by every event of the connection.
    pub common_fields: Map<String, Value>,
}

impl SchemaContext {
    /// Position of a named field in array events.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field_order.iter().position(|field| field == name)
    }

    /// Position of the time field in array events.
    pub fn time_field_index(&self) -> Option<usize> {
        self.field_order
            .iter()
            .position(|field| TIME_FIELDS.contains(&field.as_str()))
    }

    /// The raw time value of an event, without resolving it.
    pub fn time_value<'v>(&self, raw: &'v Value) -> Option<&'v Value> {
        match raw {
            Value::Array(items) => items.get(self.time_field_index().unwrap_or(0)),
            Value::Object(map) => TIME_FIELDS.iter().find_map(|field| map.get(*field)),
            _ => None,
        }
    }

    /// Resolve a raw time value against the reference time and offset.
    pub fn resolve_time(&self, value: Option<&Value>) -> Result<f64> {
        let value = value
            .filter(|v| !v.is_null())
            .ok_or_else(|| DecodeError::MissingField("time".into()))?;
        let raw = parse_number(value).ok_or_else(|| DecodeError::MalformedField {
            field: "time".into(),
            reason: format!("not a number: {}", value),
        })?;
        let relative = match self.time_format {
            TimeFormat::Absolute => raw - self.reference_time,
            TimeFormat::Relative | TimeFormat::Delta => raw,
        };
        Ok(relative + self.time_offset)
    }
}

/// A decoded event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventView {
    /// Time in the connection's unit, relative to its reference time.
    pub time: f64,
    pub category: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Value>,
    pub data: Map<String, Value>,
}

/// Decoder for one event encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventParser {
    /// `[time, category, name, trigger?, data]` arrays.
    PreSpec,
    /// Arrays read through `event_fields`, or named objects.
    DraftObject,
}

impl EventParser {
    /// The parser for a loadable dialect.
    pub fn for_dialect(dialect: Dialect) -> Option<Self> {
        match dialect {
            Dialect::PreSpec => Some(EventParser::PreSpec),
            Dialect::DraftObject => Some(EventParser::DraftObject),
            Dialect::Netlog | Dialect::PcapJson => None,
        }
    }

    /// Build the decoding context for one connection or trace block.
    pub fn init(self, block: &Map<String, Value>, events: &[Value]) -> SchemaContext {
        match self {
            EventParser::PreSpec => init_pre_spec(block, events),
            EventParser::DraftObject => init_draft(block, events),
        }
    }

    /// Decode one raw event record.
    pub fn decode(self, raw: &Value, ctx: &SchemaContext) -> Result<EventView> {
        match self {
            EventParser::PreSpec => decode_pre_spec(raw, ctx),
            EventParser::DraftObject => match raw {
                Value::Array(items) => decode_positional(items, ctx),
                Value::Object(map) => decode_named(map, ctx),
                _ => Err(DecodeError::UnexpectedShape),
            },
        }
    }
}

fn object_field<'a>(block: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    block.get(key).and_then(Value::as_object)
}

fn declared_time_unit(values: &[Option<&Value>]) -> TimeUnit {
    let declared = values.iter().flatten().find_map(|v| v.as_str());
    match declared {
        None => TimeUnit::default(),
        Some(units) => TimeUnit::parse(units).unwrap_or_else(|| {
            log::warn!("unknown time_units '{}', assuming milliseconds", units);
            TimeUnit::default()
        }),
    }
}

/// Declared field names, lowercased. draft-00 traces write them in caps.
fn field_names(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_ascii_lowercase))
                .collect()
        })
        .unwrap_or_default()
}

fn init_pre_spec(block: &Map<String, Value>, events: &[Value]) -> SchemaContext {
    let configuration = object_field(block, "configuration");
    let time_unit = declared_time_unit(&[
        block.get("time_units"),
        configuration.and_then(|c| c.get("time_units")),
    ]);

    // Pre-spec times are absolute; the first event becomes t=0.
    let reference_time = events
        .first()
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(parse_number)
        .unwrap_or(0.0);

    SchemaContext {
        time_unit,
        time_format: TimeFormat::Absolute,
        reference_time,
        time_offset: 0.0,
        field_order: field_names(block.get("fields")),
        common_fields: object_field(block, "common_fields").cloned().unwrap_or_default(),
    }
}

fn init_draft(block: &Map<String, Value>, events: &[Value]) -> SchemaContext {
    let configuration = object_field(block, "configuration");
    let common_fields = object_field(block, "common_fields")
        .cloned()
        .unwrap_or_default();

    let time_unit = declared_time_unit(&[
        configuration.and_then(|c| c.get("time_units")),
        common_fields.get("time_units"),
    ]);
    let time_offset = configuration
        .and_then(|c| c.get("time_offset"))
        .and_then(parse_number)
        .unwrap_or(0.0);

    let mut field_order = field_names(block.get("event_fields"));
    if field_order.is_empty() && events.first().is_some_and(Value::is_array) {
        field_order = DEFAULT_EVENT_FIELDS.iter().map(|f| f.to_string()).collect();
    }

    let declared_format = common_fields
        .get("time_format")
        .and_then(Value::as_str)
        .and_then(TimeFormat::parse);
    let field_format = field_order
        .iter()
        .find_map(|field| TimeFormat::from_field_name(field));
    let time_format = field_format.or(declared_format).unwrap_or_default();

    let mut ctx = SchemaContext {
        time_unit,
        time_format,
        reference_time: 0.0,
        time_offset,
        field_order,
        common_fields,
    };

    let declared_reference = ctx
        .common_fields
        .get("reference_time")
        .and_then(parse_number);
    let reference_time = match declared_reference {
        Some(reference) => reference,
        None if time_format == TimeFormat::Absolute => events
            .first()
            .and_then(|raw| ctx.time_value(raw))
            .and_then(parse_number)
            .unwrap_or(0.0),
        None => 0.0,
    };
    ctx.reference_time = reference_time;

    ctx
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_str(value: Option<&Value>, field: &str) -> Result<String> {
    match value {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(DecodeError::MissingField(field.to_string())),
        Some(other) => Err(DecodeError::MalformedField {
            field: field.to_string(),
            reason: format!("expected string, found {}", value_kind(other)),
        }),
    }
}

fn data_map(value: Option<&Value>) -> Result<Map<String, Value>> {
    match value {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(normalize_data(map)),
        Some(other) => Err(DecodeError::MalformedField {
            field: "data".into(),
            reason: format!("expected object, found {}", value_kind(other)),
        }),
    }
}

fn trigger_value(value: Option<&Value>) -> Option<Value> {
    value.filter(|v| !v.is_null()).cloned()
}

fn decode_pre_spec(raw: &Value, ctx: &SchemaContext) -> Result<EventView> {
    let items = raw.as_array().ok_or(DecodeError::UnexpectedShape)?;

    // Arity alone decides whether a trigger is present.
    let (trigger, data) = match items.len() {
        4 => (None, &items[3]),
        5 => (trigger_value(Some(&items[3])), &items[4]),
        n => return Err(DecodeError::Arity(n)),
    };

    Ok(EventView {
        time: ctx.resolve_time(Some(&items[0]))?,
        category: required_str(Some(&items[1]), "category")?,
        name: required_str(Some(&items[2]), "name")?,
        trigger,
        data: data_map(Some(data))?,
    })
}

/// Look up a field of an array event, falling back to the common fields.
fn positional<'v>(items: &'v [Value], ctx: &'v SchemaContext, name: &str) -> Option<&'v Value> {
    match ctx.field_index(name) {
        Some(index) => items.get(index),
        None => ctx.common_fields.get(name),
    }
}

/// Split a combined `category:event` name.
fn split_name(name: &str) -> Option<(String, String)> {
    name.split_once(':')
        .map(|(category, event)| (category.to_string(), event.to_string()))
}

fn category_and_name(
    category: Option<&Value>,
    event: Option<&Value>,
    combined: Option<&Value>,
) -> Result<(String, String)> {
    if let Some(event) = event.filter(|v| !v.is_null()) {
        let name = required_str(Some(event), "event")?;
        return Ok((required_str(category, "category")?, name));
    }

    let combined = required_str(combined, "event")?;
    match split_name(&combined) {
        Some(parts) => Ok(parts),
        None => Ok((required_str(category, "category")?, combined)),
    }
}

fn decode_positional(items: &[Value], ctx: &SchemaContext) -> Result<EventView> {
    let time_index = ctx
        .time_field_index()
        .ok_or_else(|| DecodeError::MissingField("time".into()))?;
    let time = ctx.resolve_time(items.get(time_index))?;

    let event = positional(items, ctx, "event").or_else(|| positional(items, ctx, "event_type"));
    let (category, name) = category_and_name(
        positional(items, ctx, "category"),
        event,
        positional(items, ctx, "name"),
    )?;

    Ok(EventView {
        time,
        category,
        name,
        trigger: trigger_value(positional(items, ctx, "trigger")),
        data: data_map(positional(items, ctx, "data"))?,
    })
}

fn decode_named(map: &Map<String, Value>, ctx: &SchemaContext) -> Result<EventView> {
    let time_value = TIME_FIELDS.iter().find_map(|field| map.get(*field));
    let time = ctx.resolve_time(time_value)?;

    let category = map
        .get("category")
        .or_else(|| ctx.common_fields.get("category"));
    let event = map.get("event").or_else(|| map.get("event_type"));
    let (category, name) = category_and_name(category, event, map.get("name"))?;

    Ok(EventView {
        time,
        category,
        name,
        trigger: trigger_value(map.get("trigger")),
        data: data_map(map.get("data"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn pre_spec_context() -> SchemaContext {
        let events = vec![json!([1000, "transport", "packet_sent", {}])];
        EventParser::PreSpec.init(
            &block(json!({"fields": ["time", "category", "type", "trigger", "data"]})),
            &events,
        )
    }

    #[test]
    fn pre_spec_four_elements_has_no_trigger() {
        let ctx = pre_spec_context();
        let raw = json!([1010, "transport", "packet_sent", {"packet_number": "3"}]);
        let view = EventParser::PreSpec.decode(&raw, &ctx).unwrap();

        assert_eq!(view.time, 10.0);
        assert_eq!(view.category, "transport");
        assert_eq!(view.name, "packet_sent");
        assert_eq!(view.trigger, None);
        assert_eq!(view.data["packet_number"], json!(3));
    }

    #[test]
    fn pre_spec_five_elements_has_trigger() {
        let ctx = pre_spec_context();
        let raw = json!([1020, "recovery", "packet_lost", "pto_expired", {}]);
        let view = EventParser::PreSpec.decode(&raw, &ctx).unwrap();

        assert_eq!(view.time, 20.0);
        assert_eq!(view.trigger, Some(json!("pto_expired")));
        assert!(view.data.is_empty());
    }

    #[test]
    fn pre_spec_other_lengths_fail() {
        let ctx = pre_spec_context();

        for (raw, len) in [
            (json!([]), 0),
            (json!([1, "a", "b"]), 3),
            (json!([1, "a", "b", "t", {}, "extra"]), 6),
        ] {
            assert_eq!(
                EventParser::PreSpec.decode(&raw, &ctx),
                Err(DecodeError::Arity(len))
            );
        }
    }

    #[test]
    fn pre_spec_arity_ignores_element_values() {
        let ctx = pre_spec_context();
        // A string in position 3 of a 4-element event is still data, and fails as such.
        let raw = json!([1000, "transport", "packet_sent", "looks_like_trigger"]);

        assert!(matches!(
            EventParser::PreSpec.decode(&raw, &ctx),
            Err(DecodeError::MalformedField { field, .. }) if field == "data"
        ));
    }

    #[test]
    fn pre_spec_context_binds_fields_and_reference() {
        let ctx = pre_spec_context();

        assert_eq!(ctx.reference_time, 1000.0);
        assert_eq!(ctx.time_format, TimeFormat::Absolute);
        assert_eq!(ctx.field_order.len(), 5);
    }

    #[test]
    fn decoding_is_repeatable() {
        let ctx = pre_spec_context();
        let raw = json!([1500, "http", "frame_created", "app", {"stream_id": "0x4"}]);

        let first = EventParser::PreSpec.decode(&raw, &ctx).unwrap();
        let second = EventParser::PreSpec.decode(&raw, &ctx).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn draft_positional_uses_event_fields() {
        let trace = block(json!({
            "configuration": {"time_units": "us", "time_offset": "5"},
            "common_fields": {"reference_time": "1000", "protocol_type": "QUIC_HTTP3"},
            "event_fields": ["relative_time", "category", "event", "trigger", "data"]
        }));
        let ctx = EventParser::DraftObject.init(&trace, &[]);
        let raw = json!(["250", "transport", "packet_received", "line", {"packet_size": 1200}]);
        let view = EventParser::DraftObject.decode(&raw, &ctx).unwrap();

        assert_eq!(ctx.time_unit, TimeUnit::Microseconds);
        assert_eq!(ctx.reference_time, 1000.0);
        assert_eq!(view.time, 255.0);
        assert_eq!(view.category, "transport");
        assert_eq!(view.name, "packet_received");
        assert_eq!(view.trigger, Some(json!("line")));
        assert_eq!(view.data["packet_size"], json!(1200));
    }

    #[test]
    fn draft_absolute_time_subtracts_reference() {
        let trace = block(json!({
            "common_fields": {"reference_time": 1_600_000_000_000u64},
            "event_fields": ["time", "category", "event", "data"]
        }));
        let ctx = EventParser::DraftObject.init(&trace, &[]);
        let raw = json!([1_600_000_000_042u64, "transport", "packet_sent", {}]);

        assert_eq!(ctx.time_format, TimeFormat::Absolute);
        assert_eq!(EventParser::DraftObject.decode(&raw, &ctx).unwrap().time, 42.0);
    }

    #[test]
    fn draft_absolute_without_reference_zeroes_first_event() {
        let trace = block(json!({"event_fields": ["time", "category", "event", "data"]}));
        let events = vec![
            json!([500, "transport", "packet_sent", {}]),
            json!([512, "transport", "packet_sent", {}]),
        ];
        let ctx = EventParser::DraftObject.init(&trace, &events);

        let times: Vec<f64> = events
            .iter()
            .map(|raw| EventParser::DraftObject.decode(raw, &ctx).unwrap().time)
            .collect();
        assert_eq!(times, vec![0.0, 12.0]);
    }

    #[test]
    fn draft_positional_falls_back_to_common_fields() {
        let trace = block(json!({
            "common_fields": {"category": "recovery"},
            "event_fields": ["relative_time", "event", "data"]
        }));
        let ctx = EventParser::DraftObject.init(&trace, &[]);
        let raw = json!([3, "metrics_updated", {"smoothed_rtt": "25"}]);
        let view = EventParser::DraftObject.decode(&raw, &ctx).unwrap();

        assert_eq!(view.category, "recovery");
        assert_eq!(view.name, "metrics_updated");
        assert_eq!(view.data["smoothed_rtt"], json!(25));
    }

    #[test]
    fn draft_defaults_event_fields_for_array_events() {
        let events = vec![json!([1, "transport", "packet_sent", {}])];
        let ctx = EventParser::DraftObject.init(&Map::new(), &events);

        assert_eq!(ctx.field_order, DEFAULT_EVENT_FIELDS);
        assert!(EventParser::DraftObject.decode(&events[0], &ctx).is_ok());
    }

    #[test]
    fn draft_named_event_splits_combined_name() {
        let ctx = EventParser::DraftObject.init(&Map::new(), &[]);
        let raw = json!({"time": 1.5, "name": "transport:packet_sent", "data": {"header": {"dcid": 255}}});
        let view = EventParser::DraftObject.decode(&raw, &ctx).unwrap();

        assert_eq!(view.time, 1.5);
        assert_eq!(view.category, "transport");
        assert_eq!(view.name, "packet_sent");
        assert_eq!(view.data["header"]["dcid"], json!("ff"));
    }

    #[test]
    fn draft_named_event_with_separate_category() {
        let ctx = EventParser::DraftObject.init(&Map::new(), &[]);
        let raw = json!({"relative_time": 2, "category": "http", "event": "frame_parsed", "trigger": "x"});
        let view = EventParser::DraftObject.decode(&raw, &ctx).unwrap();

        assert_eq!(view.category, "http");
        assert_eq!(view.name, "frame_parsed");
        assert_eq!(view.trigger, Some(json!("x")));
    }

    #[test]
    fn unknown_vocabulary_passes_through() {
        let ctx = EventParser::DraftObject.init(&Map::new(), &[]);
        let raw = json!({"time": 0, "name": "vendor_x:custom_thing", "data": {"anything": [1, 2]}});
        let view = EventParser::DraftObject.decode(&raw, &ctx).unwrap();

        assert_eq!(view.category, "vendor_x");
        assert_eq!(view.name, "custom_thing");
        assert_eq!(view.data["anything"], json!([1, 2]));
    }

    #[test]
    fn draft_decode_failures() {
        let ctx = EventParser::DraftObject.init(&Map::new(), &[]);

        assert_eq!(
            EventParser::DraftObject.decode(&json!({"name": "a:b"}), &ctx),
            Err(DecodeError::MissingField("time".into()))
        );
        assert!(matches!(
            EventParser::DraftObject.decode(&json!({"time": "soon", "name": "a:b"}), &ctx),
            Err(DecodeError::MalformedField { field, .. }) if field == "time"
        ));
        assert_eq!(
            EventParser::DraftObject.decode(&json!({"time": 1, "name": "no_category"}), &ctx),
            Err(DecodeError::MissingField("category".into()))
        );
        assert_eq!(
            EventParser::DraftObject.decode(&json!("string"), &ctx),
            Err(DecodeError::UnexpectedShape)
        );
    }

    #[test]
    fn declared_time_format_applies_to_object_events() {
        let trace = block(json!({
            "common_fields": {"time_format": "absolute", "reference_time": 100}
        }));
        let ctx = EventParser::DraftObject.init(&trace, &[]);
        let view = EventParser::DraftObject
            .decode(&json!({"time": 130, "name": "a:b"}), &ctx)
            .unwrap();

        assert_eq!(view.time, 30.0);
    }

    #[test]
    fn time_unit_conversion() {
        assert_eq!(TimeUnit::parse("us"), Some(TimeUnit::Microseconds));
        assert_eq!(TimeUnit::parse("ms"), Some(TimeUnit::Milliseconds));
        assert_eq!(TimeUnit::parse("s"), None);
        assert_eq!(TimeUnit::Microseconds.to_millis(1500.0), 1.5);
    }
}
