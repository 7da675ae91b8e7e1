//! String-keyed wire messages and the byte/text adapter over the Bencode
//! codec.
//!
//! Decoded byte-strings become UTF-8 text except keys named by the incoming
//! message's `-unencoded` list, which stay raw so binary payloads survive
//! transport untouched. Messages are never mutated in place; middleware
//! derives enriched copies.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use thiserror::Error;

use crate::bencode::{self, Value as Wire};
use crate::runtime::Value as RuntimeValue;

/// One slot value inside a message.
#[derive(Clone, Debug, PartialEq)]
pub enum Data {
    Str(String),
    Int(i64),
    Bytes(Bytes),
    List(Vec<Data>),
    Map(BTreeMap<String, Data>),
    /// An unprinted runtime value, only meaningful in-process. The
    /// `pr-values` middleware renders these before they reach the wire;
    /// encoding one is a protocol error.
    Value(RuntimeValue),
}

impl From<&str> for Data {
    fn from(text: &str) -> Data {
        Data::Str(text.to_string())
    }
}

impl From<String> for Data {
    fn from(text: String) -> Data {
        Data::Str(text)
    }
}

impl From<i64> for Data {
    fn from(n: i64) -> Data {
        Data::Int(n)
    }
}

impl From<Bytes> for Data {
    fn from(bytes: Bytes) -> Data {
        Data::Bytes(bytes)
    }
}

impl From<Vec<Data>> for Data {
    fn from(items: Vec<Data>) -> Data {
        Data::List(items)
    }
}

impl From<RuntimeValue> for Data {
    fn from(value: RuntimeValue) -> Data {
        Data::Value(value)
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not a dictionary")]
    NotADictionary,
    #[error("message key is not UTF-8")]
    NonUtf8Key,
    #[error("field '{key}' is not UTF-8 and not listed in -unencoded")]
    NonUtf8Text { key: String },
    #[error("field '{key}' holds an unprinted value; is pr-values missing from the stack?")]
    UnprintedValue { key: String },
}

/// An immutable request/response map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    slots: BTreeMap<String, Data>,
}

impl Message {
    pub fn new() -> Message {
        Message::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Data>) -> Message {
        self.slots.insert(key.to_string(), value.into());
        self
    }

    pub fn with_status(self, tags: &[&str]) -> Message {
        let status = tags.iter().map(|tag| Data::from(*tag)).collect::<Vec<_>>();
        self.with("status", status)
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Data>) {
        self.slots.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        self.slots.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.slots.get(key) {
            Some(Data::Str(text)) => Some(text),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.slots.get(key) {
            Some(Data::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&Bytes> {
        match self.slots.get(key) {
            Some(Data::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn op(&self) -> Option<&str> {
        self.get_str("op")
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get_str("session")
    }

    /// Status tags carried by this message, empty when absent.
    pub fn status(&self) -> Vec<&str> {
        match self.slots.get("status") {
            Some(Data::List(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Data::Str(tag) => Some(tag.as_str()),
                    _ => None,
                })
                .collect(),
            Some(Data::Str(tag)) => vec![tag.as_str()],
            _ => Vec::new(),
        }
    }

    pub fn has_status(&self, tag: &str) -> bool {
        self.status().contains(&tag)
    }

    /// Start a response: a fresh message carrying the request's correlation
    /// id and session id.
    pub fn reply(&self) -> Message {
        let mut reply = Message::new();
        if let Some(id) = self.id() {
            reply.insert("id", id);
        }
        if let Some(session) = self.session_id() {
            reply.insert("session", session);
        }
        reply
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Data)> {
        self.slots.iter()
    }

    pub fn remove(&mut self, key: &str) -> Option<Data> {
        self.slots.remove(key)
    }
}

/// Keys the incoming message asks to keep as raw bytes.
fn unencoded_keys(entries: &BTreeMap<Bytes, Wire>) -> Result<BTreeSet<String>, MessageError> {
    let mut keys = BTreeSet::new();
    if let Some(Wire::List(items)) = entries.get(&Bytes::from_static(b"-unencoded")) {
        for item in items {
            if let Wire::Bytes(raw) = item {
                let key = std::str::from_utf8(raw).map_err(|_| MessageError::NonUtf8Key)?;
                keys.insert(key.to_string());
            }
        }
    }
    Ok(keys)
}

/// Convert one decoded wire value into a message, applying the text
/// convention.
pub fn from_wire(value: Wire) -> Result<Message, MessageError> {
    let Wire::Dict(entries) = value else {
        return Err(MessageError::NotADictionary);
    };
    let raw_keys = unencoded_keys(&entries)?;
    let mut slots = BTreeMap::new();
    for (raw_key, item) in entries {
        let key = std::str::from_utf8(&raw_key)
            .map_err(|_| MessageError::NonUtf8Key)?
            .to_string();
        let keep_raw = raw_keys.contains(&key);
        let data = adapt(item, &key, keep_raw, &raw_keys)?;
        slots.insert(key, data);
    }
    Ok(Message { slots })
}

fn adapt(
    value: Wire,
    key: &str,
    keep_raw: bool,
    raw_keys: &BTreeSet<String>,
) -> Result<Data, MessageError> {
    match value {
        Wire::Int(n) => Ok(Data::Int(n)),
        Wire::Bytes(bytes) => {
            if keep_raw {
                return Ok(Data::Bytes(bytes));
            }
            match std::str::from_utf8(&bytes) {
                Ok(text) => Ok(Data::Str(text.to_string())),
                Err(_) => Err(MessageError::NonUtf8Text {
                    key: key.to_string(),
                }),
            }
        }
        Wire::List(items) => items
            .into_iter()
            .map(|item| adapt(item, key, keep_raw, raw_keys))
            .collect::<Result<Vec<_>, _>>()
            .map(Data::List),
        Wire::Dict(entries) => {
            let mut map = BTreeMap::new();
            for (raw_key, item) in entries {
                let nested = std::str::from_utf8(&raw_key)
                    .map_err(|_| MessageError::NonUtf8Key)?
                    .to_string();
                let nested_raw = keep_raw || raw_keys.contains(&nested);
                let data = adapt(item, &nested, nested_raw, raw_keys)?;
                map.insert(nested, data);
            }
            Ok(Data::Map(map))
        }
    }
}

/// Convert a message back into a wire value. Raw bytes pass through
/// unchanged; text becomes byte-strings.
pub fn to_wire(msg: &Message) -> Result<Wire, MessageError> {
    let mut entries = BTreeMap::new();
    for (key, data) in msg.iter() {
        entries.insert(
            Bytes::copy_from_slice(key.as_bytes()),
            data_to_wire(data, key)?,
        );
    }
    Ok(Wire::Dict(entries))
}

fn data_to_wire(data: &Data, key: &str) -> Result<Wire, MessageError> {
    match data {
        Data::Str(text) => Ok(bencode::Value::text(text)),
        Data::Int(n) => Ok(Wire::Int(*n)),
        Data::Bytes(bytes) => Ok(Wire::Bytes(bytes.clone())),
        Data::List(items) => items
            .iter()
            .map(|item| data_to_wire(item, key))
            .collect::<Result<Vec<_>, _>>()
            .map(Wire::List),
        Data::Map(map) => {
            let mut entries = BTreeMap::new();
            for (nested, item) in map {
                entries.insert(
                    Bytes::copy_from_slice(nested.as_bytes()),
                    data_to_wire(item, nested)?,
                );
            }
            Ok(Wire::Dict(entries))
        }
        Data::Value(_) => Err(MessageError::UnprintedValue {
            key: key.to_string(),
        }),
    }
}
