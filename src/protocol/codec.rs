//! Frame codecs
//!
//! Text frames are plain JSON. Binary frames hold a bincode-encoded
//! [`WireValue`], a self-describing tree that mirrors JSON but can also carry
//! raw bytes without base64 or number-array inflation.

use std::fmt;

use bincode::Options;
use bytes::Bytes;
use serde::de::{self, DeserializeSeed, Deserializer, EnumAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::message::RpcError;
use crate::constants::MAX_FRAME_SIZE;

/// Deepest array/object nesting a decoded frame may have
pub const MAX_NESTING: usize = 128;

/// Self-describing binary document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    Array(Vec<WireValue>),
    /// Ordered key/value pairs
    Object(Vec<(String, WireValue)>),
}

impl WireValue {
    pub fn object<const N: usize>(fields: [(&str, WireValue); N]) -> Self {
        WireValue::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }
}

const VARIANTS: &[&str] = &[
    "Null", "Bool", "Int", "UInt", "Float", "Text", "Bytes", "Array", "Object",
];

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Nested { depth: 0 }.deserialize(deserializer)
    }
}

/// Decodes one value `depth` containers below the frame root
#[derive(Clone, Copy)]
struct Nested {
    depth: usize,
}

impl Nested {
    fn child<E: de::Error>(self) -> Result<Self, E> {
        if self.depth >= MAX_NESTING {
            return Err(E::custom(format_args!(
                "nesting deeper than {MAX_NESTING} levels"
            )));
        }
        Ok(Self {
            depth: self.depth + 1,
        })
    }
}

impl<'de> DeserializeSeed<'de> for Nested {
    type Value = WireValue;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<WireValue, D::Error> {
        deserializer.deserialize_enum("WireValue", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for Nested {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a wire value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<WireValue, A::Error> {
        let (index, variant) = data.variant::<u32>()?;
        match index {
            0 => variant.unit_variant().map(|()| WireValue::Null),
            1 => variant.newtype_variant().map(WireValue::Bool),
            2 => variant.newtype_variant().map(WireValue::Int),
            3 => variant.newtype_variant().map(WireValue::UInt),
            4 => variant.newtype_variant().map(WireValue::Float),
            5 => variant.newtype_variant().map(WireValue::Text),
            6 => variant.newtype_variant().map(WireValue::Bytes),
            7 => variant
                .newtype_variant_seed(Items(self.child::<A::Error>()?))
                .map(WireValue::Array),
            8 => variant
                .newtype_variant_seed(Fields(self.child::<A::Error>()?))
                .map(WireValue::Object),
            other => Err(de::Error::invalid_value(
                de::Unexpected::Unsigned(other.into()),
                &"a variant index below 9",
            )),
        }
    }
}

/// Elements of an array
struct Items(Nested);

impl<'de> DeserializeSeed<'de> for Items {
    type Value = Vec<WireValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for Items {
    type Value = Vec<WireValue>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of wire values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Key/value pairs of an object
struct Fields(Nested);

impl<'de> DeserializeSeed<'de> for Fields {
    type Value = Vec<(String, WireValue)>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for Fields {
    type Value = Vec<(String, WireValue)>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a sequence of key/value pairs")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut fields = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(field) = seq.next_element_seed(Field(self.0))? {
            fields.push(field);
        }
        Ok(fields)
    }
}

struct Field(Nested);

impl<'de> DeserializeSeed<'de> for Field {
    type Value = (String, WireValue);

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_tuple(2, self)
    }
}

impl<'de> Visitor<'de> for Field {
    type Value = (String, WireValue);

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a key/value pair")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let key = seq
            .next_element::<String>()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let value = seq
            .next_element_seed(self.0)?
            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
        Ok((key, value))
    }
}

impl From<Value> for WireValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(b),
            Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    WireValue::UInt(u)
                } else if let Some(i) = n.as_i64() {
                    WireValue::Int(i)
                } else {
                    WireValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => WireValue::Text(s),
            Value::Array(items) => WireValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                WireValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<WireValue> for Value {
    fn from(value: WireValue) -> Self {
        match value {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::from(i),
            WireValue::UInt(u) => Value::from(u),
            WireValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            WireValue::Text(s) => Value::String(s),
            WireValue::Bytes(data) => Value::Array(data.iter().map(|b| Value::from(*b)).collect()),
            WireValue::Array(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            WireValue::Object(fields) => {
                Value::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect::<Map<_, _>>())
            }
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_SIZE)
}

pub fn decode_text(text: &str) -> Result<Value, RpcError> {
    serde_json::from_str(text).map_err(|_| RpcError::parse_error())
}

pub fn decode_binary(data: &[u8]) -> Result<Value, RpcError> {
    options()
        .deserialize::<WireValue>(data)
        .map(Value::from)
        .map_err(|_| RpcError::parse_error())
}

pub fn encode_text(value: &Value) -> String {
    value.to_string()
}

pub fn encode_binary(value: &WireValue) -> Result<Vec<u8>, bincode::Error> {
    options().serialize(value)
}
