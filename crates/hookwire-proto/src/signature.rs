//! Type signatures
//!
//! A signature is the concatenation of zero or more complete types written
//! with the usual single-character codes: `b y i u x t d s o v`, arrays
//! `a<T>`, dictionaries `a{KV}` and structs `(...)`. The body of a message is
//! checked against its signature before it is encoded.

use crate::{ProtocolError, Value};
use std::fmt;

/// Maximum container nesting accepted by the parser
pub const MAX_DEPTH: usize = 32;

/// Structural type descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// `b`
    Bool,
    /// `y`
    Byte,
    /// `i`
    Int32,
    /// `u`
    Uint32,
    /// `x`
    Int64,
    /// `t`
    Uint64,
    /// `d`
    Double,
    /// `s`
    String,
    /// `o`
    ObjectPath,
    /// `v`
    Variant,
    /// `a<T>`
    Array(Box<Type>),
    /// `a{KV}`
    Dict(Box<Type>, Box<Type>),
    /// `(T...)`
    Struct(Vec<Type>),
}

impl Type {
    /// Parse a signature that must contain exactly one complete type
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut types = Signature::parse(text)?.types;
        if types.len() != 1 {
            return Err(invalid(text, "expected exactly one complete type"));
        }
        Ok(types.remove(0))
    }

    /// Whether this is a basic (non-container) type usable as a dictionary key
    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Dict(_, _) | Type::Struct(_)
        )
    }

    /// Check whether a value conforms to this type
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Type::Bool, Value::Bool(_))
            | (Type::Byte, Value::Byte(_))
            | (Type::Int32, Value::I32(_))
            | (Type::Uint32, Value::U32(_))
            | (Type::Int64, Value::I64(_))
            | (Type::Uint64, Value::U64(_))
            | (Type::Double, Value::F64(_))
            | (Type::String, Value::Str(_))
            | (Type::ObjectPath, Value::Str(_))
            | (Type::Variant, Value::Variant(_)) => true,
            (Type::Array(elem), Value::Bytes(_)) => **elem == Type::Byte,
            (Type::Array(elem), Value::Array(items)) => items.iter().all(|v| elem.matches(v)),
            (Type::Dict(key, val), Value::Dict(entries)) => entries
                .iter()
                .all(|(k, v)| key.matches(k) && val.matches(v)),
            (Type::Struct(fields), Value::Struct(values)) => {
                fields.len() == values.len()
                    && fields.iter().zip(values).all(|(t, v)| t.matches(v))
            }
            _ => false,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => f.write_str("b"),
            Type::Byte => f.write_str("y"),
            Type::Int32 => f.write_str("i"),
            Type::Uint32 => f.write_str("u"),
            Type::Int64 => f.write_str("x"),
            Type::Uint64 => f.write_str("t"),
            Type::Double => f.write_str("d"),
            Type::String => f.write_str("s"),
            Type::ObjectPath => f.write_str("o"),
            Type::Variant => f.write_str("v"),
            Type::Array(elem) => write!(f, "a{}", elem),
            Type::Dict(key, val) => write!(f, "a{{{}{}}}", key, val),
            Type::Struct(fields) => {
                f.write_str("(")?;
                for field in fields {
                    write!(f, "{}", field)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// A parsed signature: an ordered list of complete types
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    /// Original text
    text: String,
    /// Parsed types, one per body element
    types: Vec<Type>,
}

impl Signature {
    /// Parse a signature string
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut parser = Parser { text, pos: 0 };
        let mut types = Vec::new();
        while !parser.at_end() {
            types.push(parser.parse_type(0)?);
        }
        Ok(Self {
            text: text.to_string(),
            types,
        })
    }

    /// The empty signature
    pub fn empty() -> Self {
        Self::default()
    }

    /// Signature text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Parsed types
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    /// Check a message body against this signature
    pub fn check(&self, body: &[Value]) -> Result<(), ProtocolError> {
        let conforms = self.types.len() == body.len()
            && self.types.iter().zip(body).all(|(t, v)| t.matches(v));
        if conforms {
            Ok(())
        } else {
            Err(ProtocolError::SignatureMismatch {
                expected: self.text.clone(),
            })
        }
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn parse_type(&mut self, depth: usize) -> Result<Type, ProtocolError> {
        if depth > MAX_DEPTH {
            return Err(invalid(self.text, "nesting too deep"));
        }
        let c = self
            .bump()
            .ok_or_else(|| invalid(self.text, "unexpected end of signature"))?;
        let ty = match c {
            b'b' => Type::Bool,
            b'y' => Type::Byte,
            b'i' => Type::Int32,
            b'u' => Type::Uint32,
            b'x' => Type::Int64,
            b't' => Type::Uint64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'v' => Type::Variant,
            b'a' if self.peek() == Some(b'{') => {
                self.pos += 1;
                let key = self.parse_type(depth + 1)?;
                if !key.is_basic() {
                    return Err(invalid(self.text, "dictionary key must be a basic type"));
                }
                let val = self.parse_type(depth + 1)?;
                if self.bump() != Some(b'}') {
                    return Err(invalid(self.text, "unterminated dictionary entry"));
                }
                Type::Dict(Box::new(key), Box::new(val))
            }
            b'a' => Type::Array(Box::new(self.parse_type(depth + 1)?)),
            b'(' => {
                let mut fields = Vec::new();
                loop {
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            break;
                        }
                        Some(_) => fields.push(self.parse_type(depth + 1)?),
                        None => return Err(invalid(self.text, "unterminated struct")),
                    }
                }
                if fields.is_empty() {
                    return Err(invalid(self.text, "empty struct"));
                }
                Type::Struct(fields)
            }
            other => {
                return Err(invalid(
                    self.text,
                    &format!("unexpected character {:?}", other as char),
                ))
            }
        };
        Ok(ty)
    }
}

fn invalid(signature: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidSignature {
        signature: signature.to_string(),
        reason: reason.to_string(),
    }
}
