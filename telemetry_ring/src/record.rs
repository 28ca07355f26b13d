//! Cell values, assembled objects and the framing vocabulary shared by
//! producers, stores and the assembler.

use crate::error::{Result, TelemetryError};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::fmt;

/// Key of the cell opening a framed record.
pub const START_KEY: &str = "#s";
/// Key of the cell closing a framed record.
pub const END_KEY: &str = "#e";

/// Longest text a single 64-bit value slot can hold.
pub const LABEL_CAPACITY: usize = 8;

pub fn is_sentinel(key: &str) -> bool {
    key == START_KEY || key == END_KEY
}

/// Short inline text stored in the 8 payload bytes of a cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label {
    len: u8,
    bytes: [u8; LABEL_CAPACITY],
}

impl Label {
    pub fn new(text: &str) -> Result<Self> {
        if text.len() > LABEL_CAPACITY {
            return Err(TelemetryError::ValueTooLong {
                len: text.len(),
                max: LABEL_CAPACITY,
            });
        }
        let mut bytes = [0u8; LABEL_CAPACITY];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self {
            len: text.len() as u8,
            bytes,
        })
    }

    /// Rebuilds a label from raw cell bytes. Invalid UTF-8 is replaced rather
    /// than trusted, the bytes may come from another process.
    pub(crate) fn from_raw(bytes: [u8; LABEL_CAPACITY], len: usize) -> Self {
        let len = len.min(LABEL_CAPACITY);
        match std::str::from_utf8(&bytes[..len]) {
            Ok(_) => Self {
                len: len as u8,
                bytes,
            },
            Err(e) => Self {
                len: e.valid_up_to() as u8,
                bytes,
            },
        }
    }

    pub(crate) fn raw(&self) -> ([u8; LABEL_CAPACITY], usize) {
        (self.bytes, self.len as usize)
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len as usize]).unwrap_or_default()
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// 64-bit cell payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(Label),
}

impl Value {
    pub fn text(text: &str) -> Result<Self> {
        Label::new(text).map(Value::Text)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int(v) => Some(v as f64),
            Value::Float(v) => Some(v),
            Value::Text(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(label) => Some(label.as_str()),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Int(0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(label) => write!(f, "{label}"),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident as $cast:ty),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v as $cast)
                }
            }
        )*
    };
}

value_from! {
    i64 => Int as i64,
    i32 => Int as i64,
    u32 => Int as i64,
    u16 => Int as i64,
    u8 => Int as i64,
    f64 => Float as f64,
    f32 => Float as f64,
}

impl From<Label> for Value {
    fn from(label: Label) -> Self {
        Value::Text(label)
    }
}

/// Fallible conversion used by the producer surface, text longer than a value
/// slot and integers outside `i64` are rejected instead of truncated.
pub trait IntoValue {
    fn into_value(self) -> Result<Value>;
}

impl IntoValue for Value {
    fn into_value(self) -> Result<Value> {
        Ok(self)
    }
}

impl IntoValue for &str {
    fn into_value(self) -> Result<Value> {
        Value::text(self)
    }
}

impl IntoValue for &String {
    fn into_value(self) -> Result<Value> {
        Value::text(self)
    }
}

impl IntoValue for u64 {
    fn into_value(self) -> Result<Value> {
        i64::try_from(self)
            .map(Value::Int)
            .map_err(|_| TelemetryError::ValueOutOfRange {
                value: self.to_string(),
            })
    }
}

impl IntoValue for usize {
    fn into_value(self) -> Result<Value> {
        (self as u64).into_value()
    }
}

impl IntoValue for u128 {
    fn into_value(self) -> Result<Value> {
        i64::try_from(self)
            .map(Value::Int)
            .map_err(|_| TelemetryError::ValueOutOfRange {
                value: self.to_string(),
            })
    }
}

macro_rules! into_value_infallible {
    ($($ty:ty),*) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Result<Value> {
                    Ok(Value::from(self))
                }
            }
        )*
    };
}

into_value_infallible!(i64, i32, u32, u16, u8, f64, f32);

/// Field name to value mapping in insertion order. Keys are unique, inserting
/// an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Object {
    fields: Vec<(String, Value)>,
}

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(key: impl Into<String>, value: Value) -> Self {
        Self {
            fields: vec![(key.into(), value)],
        }
    }

    /// Returns the previous value when `key` was already present.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.fields.iter().map(|(k, _)| k.as_str())
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut object = Object::new();
        for (k, v) in iter {
            object.insert(k, v);
        }
        object
    }
}

impl IntoIterator for Object {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl Serialize for Object {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// What a producer hands to a store in one reserve/write/commit cycle.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    /// A bare cell, no framing.
    Cell { key: &'a str, value: Value },
    /// A framed record; the shared store wraps it in sentinels.
    Object(&'a [(&'a str, Value)]),
}

impl Frame<'_> {
    pub fn fields(&self) -> usize {
        match self {
            Frame::Cell { .. } => 1,
            Frame::Object(fields) => fields.len(),
        }
    }

    pub fn to_object(&self) -> Object {
        match *self {
            Frame::Cell { key, value } => Object::singleton(key, value),
            Frame::Object(fields) => fields.iter().map(|&(k, v)| (k, v)).collect(),
        }
    }
}

/// What the consumer reads back for one published index.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Cell { key: String, value: Value },
    Object(Object),
}

/// Builds the field list for [`crate::Producer::push_object`], converting
/// each value through [`IntoValue`].
///
/// ```
/// use telemetry_ring::{fields, Value};
/// let f = fields! { "name" => "batch", "size" => 10 }.unwrap();
/// assert_eq!(f[1], ("size", Value::Int(10)));
/// ```
#[macro_export]
macro_rules! fields {
    ($($key:expr => $value:expr),* $(,)?) => {
        [$($crate::record::field($key, $value)),*]
            .into_iter()
            .collect::<$crate::Result<::std::vec::Vec<(&str, $crate::Value)>>>()
    };
}

#[doc(hidden)]
pub fn field<V: IntoValue>(key: &str, value: V) -> Result<(&str, Value)> {
    Ok((key, value.into_value()?))
}
