//! JSON parsing for trace inputs.
//!
//! There are two entry points:
//!
//! - [`parse_qlog_text`] parses qlog text with standard JSON semantics (the
//!   last occurrence of a repeated key wins). It also understands the
//!   streaming qlog serializations, JSON-SEQ and newline-delimited JSON, and
//!   reassembles them into a single root.
//! - [`parse_json_with_deduplication`] is for producers that legitimately
//!   repeat object keys, such as `tshark -T json` dissections with repeated
//!   layer headers. Every value of a repeated key is kept.
//!
//! The deduplicating parser works in two steps: a recursive-descent pass
//! builds a [`JsonNode`] tree whose objects are ordered multimaps, then
//! [`fold_duplicates`] collapses that tree into a [`serde_json::Value`].

use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Maximum nesting depth accepted by the deduplicating parser.
pub const MAX_DEPTH: usize = 512;

/// RFC 7464 record separator used by JSON-SEQ qlog files.
const RECORD_SEPARATOR: char = '\u{1e}';

/// Errors that can occur while parsing JSON input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("JSON syntax error at line {line}, column {column} (byte {offset}): {message}")]
    Syntax {
        message: String,
        offset: usize,
        line: usize,
        column: usize,
    },

    #[error("input is empty")]
    Empty,

    #[error("record {index} of the JSON sequence is not an object")]
    InvalidRecord { index: usize },
}

impl ParseError {
    /// Byte offset of a syntax error, if this is one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            ParseError::Syntax { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

/// Result type for JSON parsing operations.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Input accepted by [`parse_qlog_text`].
#[derive(Debug, Clone)]
pub enum QlogInput<'a> {
    /// Raw JSON text.
    Text(&'a str),
    /// An already-parsed document, passed through unchanged.
    Parsed(Value),
}

impl<'a> From<&'a str> for QlogInput<'a> {
    fn from(text: &'a str) -> Self {
        QlogInput::Text(text)
    }
}

impl<'a> From<&'a String> for QlogInput<'a> {
    fn from(text: &'a String) -> Self {
        QlogInput::Text(text.as_str())
    }
}

impl From<Value> for QlogInput<'_> {
    fn from(value: Value) -> Self {
        QlogInput::Parsed(value)
    }
}

// ============================================================================
// Standard parsing
// ============================================================================

/// Parse qlog input.
///
/// Parsed values are returned as-is. Text is parsed with standard JSON
/// semantics. When the text holds a sequence of JSON records (JSON-SEQ or
/// NDJSON), the first record is treated as the file header and the rest as
/// events of its single trace.
pub fn parse_qlog_text<'a>(input: impl Into<QlogInput<'a>>) -> Result<Value> {
    let text = match input.into() {
        QlogInput::Parsed(value) => return Ok(value),
        QlogInput::Text(text) => strip_bom(text),
    };

    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let mut records = if text.trim_start().starts_with(RECORD_SEPARATOR) {
        parse_json_seq(text)?
    } else {
        parse_json_stream(text)?
    };

    match records.len() {
        0 => Err(ParseError::Empty),
        1 if !text.trim_start().starts_with(RECORD_SEPARATOR) => Ok(records.remove(0)),
        _ => assemble_sequence(records),
    }
}

fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}

/// Parse whitespace-separated JSON values (one value is the common case).
fn parse_json_stream(text: &str) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    for item in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
        records.push(item.map_err(|e| syntax_from_serde(text, &e))?);
    }
    Ok(records)
}

/// Parse RS-separated JSON-SEQ records.
fn parse_json_seq(text: &str) -> Result<Vec<Value>> {
    let mut records = Vec::new();
    let mut base = 0;
    for chunk in text.split(RECORD_SEPARATOR) {
        if !chunk.trim().is_empty() {
            let value: Value = serde_json::from_str(chunk).map_err(|e| {
                match syntax_from_serde(chunk, &e) {
                    ParseError::Syntax {
                        message, offset, ..
                    } => syntax_error(text, base + offset, message),
                    other => other,
                }
            })?;
            records.push(value);
        }
        base += chunk.len() + RECORD_SEPARATOR.len_utf8();
    }
    Ok(records)
}

/// Turn a header record plus event records into a single-trace qlog root.
fn assemble_sequence(records: Vec<Value>) -> Result<Value> {
    let mut records = records.into_iter();
    let Some(Value::Object(mut root)) = records.next() else {
        return Err(ParseError::InvalidRecord { index: 0 });
    };

    let mut trace = match root.remove("trace") {
        Some(Value::Object(trace)) => trace,
        _ => Map::new(),
    };

    let mut events = Vec::new();
    for (offset, record) in records.enumerate() {
        if !record.is_object() {
            return Err(ParseError::InvalidRecord { index: offset + 1 });
        }
        events.push(record);
    }
    trace.insert("events".to_string(), Value::Array(events));
    root.insert(
        "traces".to_string(),
        Value::Array(vec![Value::Object(trace)]),
    );
    Ok(Value::Object(root))
}

fn syntax_from_serde(text: &str, err: &serde_json::Error) -> ParseError {
    let offset = offset_of(text, err.line(), err.column());
    syntax_error(text, offset, err.to_string())
}

/// Byte offset of a 1-based line/column position.
fn offset_of(text: &str, line: usize, column: usize) -> usize {
    let line_start: usize = text
        .split_inclusive('\n')
        .take(line.saturating_sub(1))
        .map(str::len)
        .sum();
    (line_start + column.saturating_sub(1)).min(text.len())
}

fn syntax_error(text: &str, offset: usize, message: impl Into<String>) -> ParseError {
    let offset = offset.min(text.len());
    let before = &text.as_bytes()[..offset];
    let line = before.iter().filter(|&&b| b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |p| p + 1);
    let column = String::from_utf8_lossy(&before[line_start..]).chars().count() + 1;
    ParseError::Syntax {
        message: message.into(),
        offset,
        line,
        column,
    }
}

// ============================================================================
// Deduplicating parser
// ============================================================================

/// A JSON value whose objects keep every key occurrence in source order.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonNode {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<JsonNode>),
    Object(Vec<(String, JsonNode)>),
}

/// Parse JSON, folding repeated object keys into arrays.
///
/// Within one object literal, a key seen more than once maps to an array of
/// all its values in the order they appeared. The key keeps the position of
/// its first occurrence.
pub fn parse_json_with_deduplication(raw_text: &str) -> Result<Value> {
    parse_multimap(raw_text).map(fold_duplicates)
}

/// Parse JSON into a [`JsonNode`] tree without folding.
pub fn parse_multimap(raw_text: &str) -> Result<JsonNode> {
    let text = strip_bom(raw_text);
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    Parser::new(text).parse_document()
}

/// Collapse a multimap tree into a `Value`.
///
/// Keys that occur once keep their value. Keys that occur several times
/// become an array of every value, even when the first value was itself an
/// array.
pub fn fold_duplicates(node: JsonNode) -> Value {
    match node {
        JsonNode::Null => Value::Null,
        JsonNode::Bool(b) => Value::Bool(b),
        JsonNode::Number(n) => Value::Number(n),
        JsonNode::String(s) => Value::String(s),
        JsonNode::Array(items) => Value::Array(items.into_iter().map(fold_duplicates).collect()),
        JsonNode::Object(entries) => {
            let mut slots: Vec<(String, Vec<Value>)> = Vec::with_capacity(entries.len());
            let mut index: HashMap<String, usize> = HashMap::with_capacity(entries.len());

            for (key, child) in entries {
                let value = fold_duplicates(child);
                match index.get(&key) {
                    Some(&slot) => slots[slot].1.push(value),
                    None => {
                        index.insert(key.clone(), slots.len());
                        slots.push((key, vec![value]));
                    }
                }
            }

            let mut map = Map::with_capacity(slots.len());
            for (key, mut values) in slots {
                let value = if values.len() == 1 {
                    values.pop().unwrap_or(Value::Null)
                } else {
                    Value::Array(values)
                };
                map.insert(key, value);
            }
            Value::Object(map)
        }
    }
}

struct Parser<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn parse_document(mut self) -> Result<JsonNode> {
        self.skip_whitespace();
        let node = self.parse_value()?;
        self.skip_whitespace();
        if self.pos < self.bytes.len() {
            return Err(self.error("trailing characters after JSON value"));
        }
        Ok(node)
    }

    fn parse_value(&mut self) -> Result<JsonNode> {
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'{') => self.parse_object(),
            Some(b'[') => self.parse_array(),
            Some(b'"') => self.parse_string().map(JsonNode::String),
            Some(b't') => self.parse_literal("true", JsonNode::Bool(true)),
            Some(b'f') => self.parse_literal("false", JsonNode::Bool(false)),
            Some(b'n') => self.parse_literal("null", JsonNode::Null),
            Some(b'-' | b'0'..=b'9') => self.parse_number(),
            Some(_) => {
                let found = self.text[self.pos..].chars().next().unwrap_or('?');
                Err(self.error(format!("unexpected character '{}'", found)))
            }
        }
    }

    fn parse_object(&mut self) -> Result<JsonNode> {
        self.enter()?;
        self.pos += 1;
        let mut entries = Vec::new();

        self.skip_whitespace();
        if self.eat(b'}') {
            self.depth -= 1;
            return Ok(JsonNode::Object(entries));
        }

        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'"') {
                return Err(self.error("expected string key"));
            }
            let key = self.parse_string()?;

            self.skip_whitespace();
            if !self.eat(b':') {
                return Err(self.error("expected ':' after object key"));
            }

            self.skip_whitespace();
            let value = self.parse_value()?;
            entries.push((key, value));

            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => return Err(self.error("expected ',' or '}' in object")),
                None => return Err(self.error("unterminated object")),
            }
        }

        self.depth -= 1;
        Ok(JsonNode::Object(entries))
    }

    fn parse_array(&mut self) -> Result<JsonNode> {
        self.enter()?;
        self.pos += 1;
        let mut items = Vec::new();

        self.skip_whitespace();
        if self.eat(b']') {
            self.depth -= 1;
            return Ok(JsonNode::Array(items));
        }

        loop {
            self.skip_whitespace();
            items.push(self.parse_value()?);

            self.skip_whitespace();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => return Err(self.error("expected ',' or ']' in array")),
                None => return Err(self.error("unterminated array")),
            }
        }

        self.depth -= 1;
        Ok(JsonNode::Array(items))
    }

    fn parse_string(&mut self) -> Result<String> {
        let opening = self.pos;
        self.pos += 1;
        let mut out = String::new();
        let mut run_start = self.pos;

        loop {
            let Some(b) = self.peek() else {
                return Err(self.error_at(opening, "unterminated string"));
            };
            match b {
                b'"' => {
                    out.push_str(&self.text[run_start..self.pos]);
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    out.push_str(&self.text[run_start..self.pos]);
                    self.pos += 1;
                    let escape = self
                        .bump()
                        .ok_or_else(|| self.error("unterminated escape sequence"))?;
                    match escape {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{08}'),
                        b'f' => out.push('\u{0c}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => out.push(self.parse_unicode_escape()?),
                        _ => {
                            self.pos -= 1;
                            return Err(self.error("invalid escape sequence"));
                        }
                    }
                    run_start = self.pos;
                }
                0x00..=0x1f => return Err(self.error("control character in string")),
                _ => self.pos += 1,
            }
        }
    }

    fn parse_hex4(&mut self) -> Result<u32> {
        let end = self.pos + 4;
        if end > self.bytes.len() {
            return Err(self.error("truncated unicode escape"));
        }
        let mut value = 0u32;
        for &b in &self.bytes[self.pos..end] {
            let digit = char::from(b)
                .to_digit(16)
                .ok_or_else(|| self.error("invalid unicode escape"))?;
            value = value * 16 + digit;
        }
        self.pos = end;
        Ok(value)
    }

    fn parse_unicode_escape(&mut self) -> Result<char> {
        let first = self.parse_hex4()?;
        let code = match first {
            0xd800..=0xdbff => {
                if self.bytes.get(self.pos) != Some(&b'\\')
                    || self.bytes.get(self.pos + 1) != Some(&b'u')
                {
                    return Err(self.error("unpaired surrogate in unicode escape"));
                }
                self.pos += 2;
                let second = self.parse_hex4()?;
                if !(0xdc00..=0xdfff).contains(&second) {
                    return Err(self.error("invalid low surrogate in unicode escape"));
                }
                0x10000 + ((first - 0xd800) << 10) + (second - 0xdc00)
            }
            0xdc00..=0xdfff => return Err(self.error("unpaired surrogate in unicode escape")),
            other => other,
        };
        char::from_u32(code).ok_or_else(|| self.error("invalid unicode scalar value"))
    }

    fn parse_number(&mut self) -> Result<JsonNode> {
        let start = self.pos;
        self.eat(b'-');

        match self.peek() {
            Some(b'0') => self.pos += 1,
            Some(b'1'..=b'9') => self.skip_digits(),
            _ => return Err(self.error("invalid number")),
        }

        if self.eat(b'.') {
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.error("expected digit after decimal point"));
            }
            self.skip_digits();
        }

        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(b'0'..=b'9')) {
                return Err(self.error("expected digit in exponent"));
            }
            self.skip_digits();
        }

        let lexeme = &self.text[start..self.pos];
        serde_json::from_str::<Number>(lexeme)
            .map(JsonNode::Number)
            .map_err(|_| self.error_at(start, "number out of range"))
    }

    fn parse_literal(&mut self, literal: &str, node: JsonNode) -> Result<JsonNode> {
        if self.bytes[self.pos..].starts_with(literal.as_bytes()) {
            self.pos += literal.len();
            Ok(node)
        } else {
            Err(self.error(format!("expected '{}'", literal)))
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {} levels", MAX_DEPTH)));
        }
        self.depth += 1;
        Ok(())
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        self.error_at(self.pos, message)
    }

    fn error_at(&self, offset: usize, message: impl Into<String>) -> ParseError {
        syntax_error(self.text, offset, message)
    }
}
