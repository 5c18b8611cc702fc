//! Policy values and their canonical string form.
//!
//! `I/<decimal>` for integers, `S/<text>` for strings. The tag ends at the
//! first `/`, so string text may itself contain slashes. The same form is used
//! on the wire and in storage.

use std::fmt;

use crate::rmi::{Pack, PayloadReader, PayloadWriter, ProtocolError, Unpack};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyValue {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Int,
    Str,
}

impl ValueType {
    fn tag(self) -> &'static str {
        match self {
            Self::Int => "I",
            Self::Str => "S",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Int => "integer",
            Self::Str => "string",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("missing type tag in {0:?}")]
    MissingTag(String),

    #[error("unknown type tag {tag:?} in {input:?}")]
    UnknownTag { tag: String, input: String },

    #[error("expected {expected} value, found {found}")]
    TypeMismatch {
        expected: ValueType,
        found: ValueType,
    },

    #[error("invalid integer {0:?}")]
    InvalidInteger(String),

    #[error("integer {value} out of range for {target}")]
    OutOfRange { value: i64, target: &'static str },
}

fn split_tag(input: &str) -> Result<(ValueType, &str), CodecError> {
    let (tag, body) = input
        .split_once('/')
        .ok_or_else(|| CodecError::MissingTag(input.to_string()))?;
    let kind = match tag {
        "I" => ValueType::Int,
        "S" => ValueType::Str,
        other => {
            return Err(CodecError::UnknownTag {
                tag: other.to_string(),
                input: input.to_string(),
            });
        }
    };
    Ok((kind, body))
}

impl PolicyValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Int(_) => ValueType::Int,
            Self::Str(_) => ValueType::Str,
        }
    }

    /// Canonical string form.
    pub fn dump(&self) -> String {
        match self {
            Self::Int(n) => format!("{}/{n}", ValueType::Int.tag()),
            Self::Str(s) => format!("{}/{s}", ValueType::Str.tag()),
        }
    }

    /// Parse a canonical string. Integers must be in canonical decimal form.
    pub fn parse(input: &str) -> Result<Self, CodecError> {
        let (kind, body) = split_tag(input)?;
        match kind {
            ValueType::Str => Ok(Self::Str(body.to_string())),
            ValueType::Int => {
                let n: i64 = body
                    .parse()
                    .map_err(|_| CodecError::InvalidInteger(body.to_string()))?;
                // Rejects "+7", "007" and "-0" so every value has one encoding.
                if n.to_string() != body {
                    return Err(CodecError::InvalidInteger(body.to_string()));
                }
                Ok(Self::Int(n))
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(s) => Some(s),
        }
    }
}

/// Plain value, without the type tag.
impl fmt::Display for PolicyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PolicyValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for PolicyValue {
    fn from(n: i32) -> Self {
        Self::Int(i64::from(n))
    }
}

impl From<String> for PolicyValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&str> for PolicyValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

/// Types with a canonical policy string form.
pub trait Stringify: Sized {
    const TYPE: ValueType;

    fn into_value(self) -> PolicyValue;

    fn from_value(value: PolicyValue) -> Result<Self, CodecError>;
}

impl Stringify for i64 {
    const TYPE: ValueType = ValueType::Int;

    fn into_value(self) -> PolicyValue {
        PolicyValue::Int(self)
    }

    fn from_value(value: PolicyValue) -> Result<Self, CodecError> {
        match value {
            PolicyValue::Int(n) => Ok(n),
            other => Err(CodecError::TypeMismatch {
                expected: Self::TYPE,
                found: other.value_type(),
            }),
        }
    }
}

impl Stringify for i32 {
    const TYPE: ValueType = ValueType::Int;

    fn into_value(self) -> PolicyValue {
        PolicyValue::Int(i64::from(self))
    }

    fn from_value(value: PolicyValue) -> Result<Self, CodecError> {
        let n = i64::from_value(value)?;
        i32::try_from(n).map_err(|_| CodecError::OutOfRange {
            value: n,
            target: "i32",
        })
    }
}

impl Stringify for String {
    const TYPE: ValueType = ValueType::Str;

    fn into_value(self) -> PolicyValue {
        PolicyValue::Str(self)
    }

    fn from_value(value: PolicyValue) -> Result<Self, CodecError> {
        match value {
            PolicyValue::Str(s) => Ok(s),
            other => Err(CodecError::TypeMismatch {
                expected: Self::TYPE,
                found: other.value_type(),
            }),
        }
    }
}

pub fn dump<T: Stringify>(value: T) -> String {
    value.into_value().dump()
}

pub fn restore<T: Stringify>(input: &str) -> Result<T, CodecError> {
    T::from_value(PolicyValue::parse(input)?)
}

/// The type an encoded value declares, without decoding its body.
pub fn get_type(input: &str) -> Result<ValueType, CodecError> {
    split_tag(input).map(|(kind, _)| kind)
}

impl Pack for PolicyValue {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.push(self.dump())
    }
}

impl Pack for &PolicyValue {
    fn pack(self, w: &mut PayloadWriter) -> Result<(), ProtocolError> {
        w.push(self.dump())
    }
}

impl Unpack for PolicyValue {
    fn unpack(r: &mut PayloadReader) -> Result<Self, ProtocolError> {
        let raw: String = r.read()?;
        PolicyValue::parse(&raw).map_err(|e| ProtocolError::InvalidValue(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_uses_type_tags() {
        assert_eq!(dump(10i64), "I/10");
        assert_eq!(dump(-3i32), "I/-3");
        assert_eq!(dump("allow".to_string()), "S/allow");
        assert_eq!(dump(String::new()), "S/");
    }

    #[test]
    fn restore_reads_back_values() {
        assert_eq!(restore::<i64>("I/10").unwrap(), 10);
        assert_eq!(restore::<i64>("I/-9223372036854775808").unwrap(), i64::MIN);
        assert_eq!(restore::<String>("S/a/b").unwrap(), "a/b");
        assert_eq!(restore::<String>("S/").unwrap(), "");
    }

    #[test]
    fn restore_rejects_tag_mismatch() {
        assert_eq!(
            restore::<i64>("S/10"),
            Err(CodecError::TypeMismatch {
                expected: ValueType::Int,
                found: ValueType::Str
            })
        );
        assert!(matches!(
            restore::<String>("I/1"),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn restore_rejects_malformed_input() {
        assert!(matches!(restore::<i64>("10"), Err(CodecError::MissingTag(_))));
        assert!(matches!(restore::<i64>("X/10"), Err(CodecError::UnknownTag { .. })));
        assert!(matches!(restore::<i64>("I/ten"), Err(CodecError::InvalidInteger(_))));
        assert!(matches!(restore::<i64>("I/"), Err(CodecError::InvalidInteger(_))));
        assert!(matches!(restore::<i64>("I/+7"), Err(CodecError::InvalidInteger(_))));
        assert!(matches!(restore::<i64>("I/007"), Err(CodecError::InvalidInteger(_))));
    }

    #[test]
    fn narrowing_checks_range() {
        assert_eq!(restore::<i32>("I/5").unwrap(), 5);
        assert!(matches!(
            restore::<i32>("I/4294967296"),
            Err(CodecError::OutOfRange { target: "i32", .. })
        ));
    }

    #[test]
    fn get_type_inspects_tag_only() {
        assert_eq!(get_type("I/10").unwrap(), ValueType::Int);
        assert_eq!(get_type("S/").unwrap(), ValueType::Str);
        assert_eq!(get_type("I/not-a-number").unwrap(), ValueType::Int);
        assert!(get_type("nothing").is_err());
    }

    #[test]
    fn display_omits_tag() {
        assert_eq!(PolicyValue::Int(10).to_string(), "10");
        assert_eq!(PolicyValue::from("deny").to_string(), "deny");
    }

    #[test]
    fn value_crosses_rmi_as_canonical_string() {
        let mut w = PayloadWriter::new();
        w.push(PolicyValue::Int(7)).unwrap();
        let (payload, fds) = w.into_parts();

        let mut raw = PayloadReader::new(payload.clone(), Vec::new());
        assert_eq!(raw.read::<String>().unwrap(), "I/7");

        let mut r = PayloadReader::new(payload, fds);
        assert_eq!(r.read::<PolicyValue>().unwrap(), PolicyValue::Int(7));
    }
}
