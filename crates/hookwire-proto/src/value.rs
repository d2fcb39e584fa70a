//! Dynamic bus values and variants

use crate::{ProtocolError, Type};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single value in a message body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Boolean
    Bool(bool),
    /// Unsigned byte
    Byte(u8),
    /// Signed 32-bit integer
    I32(i32),
    /// Unsigned 32-bit integer
    U32(u32),
    /// Signed 64-bit integer
    I64(i64),
    /// Unsigned 64-bit integer
    U64(u64),
    /// Double precision float
    F64(f64),
    /// String or object path
    Str(String),
    /// Byte array (`ay`)
    Bytes(Bytes),
    /// Homogeneous array
    Array(Vec<Value>),
    /// Dictionary, entries kept in insertion order
    Dict(Vec<(Value, Value)>),
    /// Struct / tuple
    Struct(Vec<Value>),
    /// Self-describing tagged value
    Variant(Box<Variant>),
}

impl Value {
    /// Get as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i32
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as u32
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Get the bytes of an `ay` value, accepting both representations
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            Value::Bytes(b) => Some(b.clone()),
            Value::Array(items) => items
                .iter()
                .map(|v| match v {
                    Value::Byte(b) => Some(*b),
                    _ => None,
                })
                .collect::<Option<Vec<u8>>>()
                .map(Bytes::from),
            _ => None,
        }
    }

    /// Get array elements
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Get struct fields
    pub fn as_struct(&self) -> Option<&[Value]> {
        match self {
            Value::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Get dictionary entries
    pub fn as_dict(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Get the inner variant
    pub fn as_variant(&self) -> Option<&Variant> {
        match self {
            Value::Variant(v) => Some(v),
            _ => None,
        }
    }

    /// Decode into JSON, unwrapping variants recursively.
    ///
    /// Dictionaries whose keys are all strings become objects; any other
    /// dictionary becomes an array of `[key, value]` pairs.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as Json;

        match self {
            Value::Bool(b) => Json::Bool(*b),
            Value::Byte(n) => Json::from(*n),
            Value::I32(n) => Json::from(*n),
            Value::U32(n) => Json::from(*n),
            Value::I64(n) => Json::from(*n),
            Value::U64(n) => Json::from(*n),
            Value::F64(n) => serde_json::Number::from_f64(*n)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bytes(b) => Json::Array(b.iter().map(|n| Json::from(*n)).collect()),
            Value::Array(items) | Value::Struct(items) => {
                Json::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Dict(entries) => {
                if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                    let map = entries
                        .iter()
                        .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.to_json())))
                        .collect();
                    Json::Object(map)
                } else {
                    Json::Array(
                        entries
                            .iter()
                            .map(|(k, v)| Json::Array(vec![k.to_json(), v.to_json()]))
                            .collect(),
                    )
                }
            }
            Value::Variant(v) => v.value.to_json(),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    u8 => Byte,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
    String => Str,
    Bytes => Bytes,
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<Variant> for Value {
    fn from(v: Variant) -> Self {
        Value::Variant(Box::new(v))
    }
}

/// A (type signature, value) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    signature: String,
    value: Value,
}

impl Variant {
    /// Create a variant, checking the value against the signature
    pub fn new(signature: &str, value: Value) -> Result<Self, ProtocolError> {
        let ty = Type::parse(signature)?;
        if !ty.matches(&value) {
            return Err(ProtocolError::SignatureMismatch {
                expected: signature.to_string(),
            });
        }
        Ok(Self {
            signature: signature.to_string(),
            value,
        })
    }

    /// Signature of the contained value
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Contained value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Take the contained value
    pub fn into_value(self) -> Value {
        self.value
    }

    /// Decode into JSON
    pub fn to_json(&self) -> serde_json::Value {
        self.value.to_json()
    }

    fn basic(signature: &str, value: Value) -> Self {
        Self {
            signature: signature.to_string(),
            value,
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Self::basic("b", Value::Bool(v))
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Self::basic("i", Value::I32(v))
    }
}

impl From<u32> for Variant {
    fn from(v: u32) -> Self {
        Self::basic("u", Value::U32(v))
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Self::basic("x", Value::I64(v))
    }
}

impl From<u64> for Variant {
    fn from(v: u64) -> Self {
        Self::basic("t", Value::U64(v))
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Self::basic("d", Value::F64(v))
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Self::basic("s", Value::from(v))
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Self::basic("s", Value::Str(v))
    }
}

impl From<Vec<String>> for Variant {
    fn from(v: Vec<String>) -> Self {
        Self::basic("as", Value::Array(v.into_iter().map(Value::Str).collect()))
    }
}

impl From<VariantDict> for Variant {
    fn from(v: VariantDict) -> Self {
        Self::basic("a{sv}", v.into_value())
    }
}

/// An ordered `name -> variant` option map (`a{sv}`)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantDict {
    entries: Vec<(String, Variant)>,
}

impl VariantDict {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry; replacement keeps the original position
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Variant>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up an entry
    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Convert to the ordered list of `(name, variant)` dictionary entries
    pub fn into_value(self) -> Value {
        Value::Dict(
            self.entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), Value::Variant(Box::new(v))))
                .collect(),
        )
    }

    /// Parse an `a{sv}` value
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let entries = value
            .as_dict()
            .ok_or_else(|| ProtocolError::MalformedBody("expected a{sv} dictionary".to_string()))?;
        let mut dict = Self::new();
        for (k, v) in entries {
            match (k.as_str(), v.as_variant()) {
                (Some(k), Some(v)) => dict.entries.push((k.to_string(), v.clone())),
                _ => {
                    return Err(ProtocolError::MalformedBody(
                        "expected string key and variant value".to_string(),
                    ))
                }
            }
        }
        Ok(dict)
    }

    /// Decode into a JSON object, unwrapping variants recursively
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_system_parameters_decode() {
        let params = Value::Dict(vec![
            (Value::from("os"), Value::from(Variant::from("linux"))),
            (Value::from("arch"), Value::from(Variant::from("x64"))),
        ]);
        assert_eq!(params.to_json(), json!({"os": "linux", "arch": "x64"}));
    }

    #[test]
    fn test_nested_variant_decode() {
        let os = VariantDict::new()
            .with("id", "linux")
            .with("version", "6.1");
        let params = VariantDict::new()
            .with("os", os)
            .with("pointer-size", 8u32)
            .with("debuggable", true);
        assert_eq!(
            params.to_json(),
            json!({
                "os": {"id": "linux", "version": "6.1"},
                "pointer-size": 8,
                "debuggable": true,
            })
        );
    }

    #[test]
    fn test_variant_new_checks_signature() {
        assert!(Variant::new("u", Value::U32(1)).is_ok());
        assert!(matches!(
            Variant::new("s", Value::U32(1)),
            Err(ProtocolError::SignatureMismatch { .. })
        ));
        assert!(Variant::new("uu", Value::U32(1)).is_err());
    }

    #[test]
    fn test_variant_dict_insert_replaces_in_place() {
        let mut dict = VariantDict::new().with("a", 1u32).with("b", 2u32);
        dict.insert("a", 3u32);
        let keys: Vec<&str> = dict.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(dict.get("a").map(|v| v.value()), Some(&Value::U32(3)));
    }

    #[test]
    fn test_variant_dict_value_conversion() {
        let dict = VariantDict::new().with("realm", "native").with("persist-timeout", 5u32);
        let value = dict.clone().into_value();
        assert!(Type::parse("a{sv}").unwrap().matches(&value));
        assert_eq!(VariantDict::from_value(&value).unwrap(), dict);
    }

    #[test]
    fn test_variant_dict_from_malformed_value() {
        assert!(VariantDict::from_value(&Value::U32(1)).is_err());
        let bad = Value::Dict(vec![(Value::U32(1), Value::from(Variant::from(true)))]);
        assert!(VariantDict::from_value(&bad).is_err());
    }

    #[test]
    fn test_non_string_keys_decode_as_pairs() {
        let dict = Value::Dict(vec![(Value::U32(1), Value::from("one"))]);
        assert_eq!(dict.to_json(), json!([[1, "one"]]));
    }

    #[test]
    fn test_to_bytes_accepts_byte_arrays() {
        let arr = Value::Array(vec![Value::Byte(1), Value::Byte(2)]);
        assert_eq!(arr.to_bytes(), Some(Bytes::from_static(&[1, 2])));
        assert_eq!(Value::Array(vec![Value::U32(1)]).to_bytes(), None);
    }
}
