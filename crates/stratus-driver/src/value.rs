//! Field values: the sum of all scalar and composite types a table row,
//! primary key, or query result can hold.
//!
//! Values cross the wire as JSON. Types JSON cannot express natively
//! (binary, timestamp, exact decimal, SQL NULL) use single-key tagged
//! objects; see [`FieldValue::to_wire_json`].

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bigdecimal::BigDecimal;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as Json;

use crate::error::{Error, arg_err};

const TAG_NULL: &str = "$sqlNull";
const TAG_BINARY: &str = "$binary";
const TAG_TIMESTAMP: &str = "$timestamp";
const TAG_DECIMAL: &str = "$decimal";

/// A single typed value.
///
/// `Uninitialized` is the state of an unwritten query register and never
/// appears in rows or on the wire. `Empty` is produced only by query
/// evaluation (a missing field stepped over by a path expression).
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FieldValue {
    #[default]
    Uninitialized,
    Null,
    JsonNull,
    Empty,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    Decimal(BigDecimal),
    String(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Array(Vec<FieldValue>),
    Map(MapValue),
}

impl FieldValue {
    /// Whether this is one of the "special" values: SQL NULL, JSON null,
    /// or EMPTY. Aggregates and grouping treat these uniformly.
    pub fn is_special(&self) -> bool {
        matches!(
            self,
            FieldValue::Null | FieldValue::JsonNull | FieldValue::Empty
        )
    }

    /// Whether this value is one of the four numeric types.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldValue::Integer(_)
                | FieldValue::Long(_)
                | FieldValue::Double(_)
                | FieldValue::Decimal(_)
        )
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            FieldValue::Integer(i) => Some(*i),
            FieldValue::Long(l) => i32::try_from(*l).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(i) => Some(*i as i64),
            FieldValue::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(i) => Some(*i as f64),
            FieldValue::Long(l) => Some(*l as f64),
            FieldValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match self {
            FieldValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// A stable hash used for duplicate elimination and grouping.
    ///
    /// Integer and Long values of equal magnitude hash identically, since
    /// cross-width numeric equality holds under query semantics.
    pub fn query_hash(&self) -> u64 {
        use std::hash::Hasher;
        let mut h = std::collections::hash_map::DefaultHasher::new();
        self.feed_hash(&mut h);
        h.finish()
    }

    fn feed_hash<H: std::hash::Hasher>(&self, h: &mut H) {
        use std::hash::Hash;
        match self {
            FieldValue::Uninitialized => 0u8.hash(h),
            FieldValue::Null => 1u8.hash(h),
            FieldValue::JsonNull => 2u8.hash(h),
            FieldValue::Empty => 3u8.hash(h),
            FieldValue::Boolean(b) => {
                4u8.hash(h);
                b.hash(h);
            }
            FieldValue::Integer(i) => {
                5u8.hash(h);
                (*i as i64).hash(h);
            }
            FieldValue::Long(l) => {
                5u8.hash(h);
                l.hash(h);
            }
            FieldValue::Double(d) => {
                6u8.hash(h);
                d.to_bits().hash(h);
            }
            FieldValue::Decimal(d) => {
                7u8.hash(h);
                d.normalized().to_string().hash(h);
            }
            FieldValue::String(s) => {
                8u8.hash(h);
                s.hash(h);
            }
            FieldValue::Timestamp(t) => {
                9u8.hash(h);
                t.timestamp_micros().hash(h);
            }
            FieldValue::Binary(b) => {
                10u8.hash(h);
                b.hash(h);
            }
            FieldValue::Array(a) => {
                11u8.hash(h);
                for v in a {
                    v.feed_hash(h);
                }
            }
            FieldValue::Map(m) => {
                12u8.hash(h);
                for (k, v) in m.iter() {
                    k.hash(h);
                    v.feed_hash(h);
                }
            }
        }
    }

    /// Approximate in-memory footprint in bytes, charged against the query
    /// memory budget for cached rows, duplicate fingerprints and group maps.
    pub fn memory_size(&self) -> u64 {
        let base = std::mem::size_of::<FieldValue>() as u64;
        match self {
            FieldValue::String(s) => base + s.capacity() as u64,
            FieldValue::Binary(b) => base + b.capacity() as u64,
            FieldValue::Decimal(d) => base + d.digits(),
            FieldValue::Array(a) => {
                base + a.iter().map(FieldValue::memory_size).sum::<u64>()
            }
            FieldValue::Map(m) => {
                base + m
                    .iter()
                    .map(|(k, v)| k.capacity() as u64 + 16 + v.memory_size())
                    .sum::<u64>()
            }
            _ => base,
        }
    }

    /// Encode for the wire. `Uninitialized` and `Empty` are driver-internal
    /// and refuse to serialize.
    pub(crate) fn to_wire_json(&self) -> Result<Json, Error> {
        Ok(match self {
            FieldValue::Uninitialized | FieldValue::Empty => {
                return arg_err!("cannot serialize internal value {self:?}");
            }
            FieldValue::Null => Json::Object({
                let mut m = serde_json::Map::new();
                m.insert(TAG_NULL.to_string(), Json::Bool(true));
                m
            }),
            FieldValue::JsonNull => Json::Null,
            FieldValue::Boolean(b) => Json::Bool(*b),
            FieldValue::Integer(i) => Json::from(*i),
            FieldValue::Long(l) => Json::from(*l),
            FieldValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            FieldValue::Decimal(d) => tagged(TAG_DECIMAL, d.normalized().to_string()),
            FieldValue::String(s) => Json::String(s.clone()),
            FieldValue::Timestamp(t) => tagged(
                TAG_TIMESTAMP,
                t.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            ),
            FieldValue::Binary(b) => tagged(TAG_BINARY, BASE64.encode(b)),
            FieldValue::Array(a) => {
                let mut out = Vec::with_capacity(a.len());
                for v in a {
                    out.push(v.to_wire_json()?);
                }
                Json::Array(out)
            }
            FieldValue::Map(m) => {
                let mut out = serde_json::Map::new();
                for (k, v) in m.iter() {
                    out.insert(k.clone(), v.to_wire_json()?);
                }
                Json::Object(out)
            }
        })
    }

    /// Decode a wire value.
    pub(crate) fn from_wire_json(j: &Json) -> Result<FieldValue, Error> {
        Ok(match j {
            Json::Null => FieldValue::JsonNull,
            Json::Bool(b) => FieldValue::Boolean(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if let Ok(small) = i32::try_from(i) {
                        FieldValue::Integer(small)
                    } else {
                        FieldValue::Long(i)
                    }
                } else if let Some(f) = n.as_f64() {
                    FieldValue::Double(f)
                } else {
                    // arbitrary_precision: integer wider than i64
                    match n.to_string().parse::<BigDecimal>() {
                        Ok(d) => FieldValue::Decimal(d),
                        Err(e) => {
                            return Err(Error::BadProtocol(format!(
                                "unreadable number {n}: {e}"
                            )));
                        }
                    }
                }
            }
            Json::String(s) => FieldValue::String(s.clone()),
            Json::Array(a) => {
                let mut out = Vec::with_capacity(a.len());
                for v in a {
                    out.push(FieldValue::from_wire_json(v)?);
                }
                FieldValue::Array(out)
            }
            Json::Object(o) => {
                if o.len() == 1 {
                    let (k, v) = o.iter().next().expect("len checked");
                    match (k.as_str(), v) {
                        (TAG_NULL, _) => return Ok(FieldValue::Null),
                        (TAG_BINARY, Json::String(s)) => {
                            let bytes = BASE64.decode(s).map_err(|e| {
                                Error::BadProtocol(format!("bad base64 binary: {e}"))
                            })?;
                            return Ok(FieldValue::Binary(bytes));
                        }
                        (TAG_TIMESTAMP, Json::String(s)) => {
                            let ts = DateTime::parse_from_rfc3339(s).map_err(|e| {
                                Error::BadProtocol(format!("bad timestamp: {e}"))
                            })?;
                            return Ok(FieldValue::Timestamp(ts.with_timezone(&Utc)));
                        }
                        (TAG_DECIMAL, Json::String(s)) => {
                            let d = s.parse::<BigDecimal>().map_err(|e| {
                                Error::BadProtocol(format!("bad decimal: {e}"))
                            })?;
                            return Ok(FieldValue::Decimal(d));
                        }
                        _ => {}
                    }
                }
                let mut m = MapValue::new();
                for (k, v) in o {
                    m.put(k.as_str(), FieldValue::from_wire_json(v)?);
                }
                FieldValue::Map(m)
            }
        })
    }
}

fn tagged(tag: &str, s: String) -> Json {
    let mut m = serde_json::Map::new();
    m.insert(tag.to_string(), Json::String(s));
    Json::Object(m)
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_wire_json() {
            Ok(j) => write!(f, "{j}"),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Long(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<BigDecimal> for FieldValue {
    fn from(v: BigDecimal) -> Self {
        FieldValue::Decimal(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl From<MapValue> for FieldValue {
    fn from(v: MapValue) -> Self {
        FieldValue::Map(v)
    }
}

/// An insertion-ordered map of field name to value.
///
/// Rows, primary keys and query records are all `MapValue`s. Order is
/// preserved so records compare and render positionally; `put` on an
/// existing key replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapValue {
    entries: Vec<(String, FieldValue)>,
}

impl MapValue {
    pub fn new() -> Self {
        MapValue {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace a field, preserving the original position on
    /// replacement.
    pub fn put(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    /// Builder-style [`MapValue::put`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.put(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Field at insertion position `i`.
    pub fn get_at(&self, i: usize) -> Option<(&str, &FieldValue)> {
        self.entries.get(i).map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Remove and return a field value, leaving the map without the entry.
    pub fn take(&mut self, name: &str) -> Option<FieldValue> {
        let idx = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn memory_size(&self) -> u64 {
        let base = std::mem::size_of::<FieldValue>() as u64;
        base + self
            .iter()
            .map(|(k, v)| k.capacity() as u64 + 16 + v.memory_size())
            .sum::<u64>()
    }

    pub(crate) fn to_wire_json(&self) -> Result<Json, Error> {
        let mut out = serde_json::Map::new();
        for (k, v) in self.iter() {
            out.insert(k.clone(), v.to_wire_json()?);
        }
        Ok(Json::Object(out))
    }

    pub(crate) fn from_wire_json(j: &Json) -> Result<MapValue, Error> {
        match FieldValue::from_wire_json(j)? {
            FieldValue::Map(m) => Ok(m),
            other => Err(Error::BadProtocol(format!(
                "expected a map value, got {other:?}"
            ))),
        }
    }
}

impl<const N: usize> From<[(&str, FieldValue); N]> for MapValue {
    fn from(pairs: [(&str, FieldValue); N]) -> Self {
        let mut m = MapValue::new();
        for (k, v) in pairs {
            m.put(k, v);
        }
        m
    }
}

/// An opaque row version returned by reads and writes, usable for
/// conditional puts and deletes.
#[derive(Clone, PartialEq, Eq)]
pub struct Version(pub(crate) Vec<u8>);

impl Version {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Version(bytes)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", BASE64.encode(&self.0))
    }
}
