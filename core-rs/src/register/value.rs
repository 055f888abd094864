//! Register value union

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed value of a remote register
///
/// Mirrors the register value union of the bus: every numeric variant is an
/// array, a scalar is a one-element array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Value {
    Empty,
    String(String),
    Unstructured(Vec<u8>),
    Bit(Vec<bool>),
    Integer64(Vec<i64>),
    Integer32(Vec<i32>),
    Integer16(Vec<i16>),
    Integer8(Vec<i8>),
    Natural64(Vec<u64>),
    Natural32(Vec<u32>),
    Natural16(Vec<u16>),
    Natural8(Vec<u8>),
    Real64(Vec<f64>),
    Real32(Vec<f32>),
}

impl Value {
    pub fn natural16(v: u16) -> Self {
        Value::Natural16(vec![v])
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Single integral numeric value, whatever the register's numeric type
    ///
    /// Reals are accepted only when they carry no fractional part.
    pub fn as_integer(&self) -> Option<i64> {
        fn single<T: Copy>(v: &[T]) -> Option<T> {
            match v {
                [x] => Some(*x),
                _ => None,
            }
        }

        fn integral(x: f64) -> Option<i64> {
            if x.is_finite() && x.fract() == 0.0 && x >= i64::MIN as f64 && x <= i64::MAX as f64 {
                Some(x as i64)
            } else {
                None
            }
        }

        match self {
            Value::Integer64(v) => single(v),
            Value::Integer32(v) => single(v).map(i64::from),
            Value::Integer16(v) => single(v).map(i64::from),
            Value::Integer8(v) => single(v).map(i64::from),
            Value::Natural64(v) => single(v).and_then(|x| i64::try_from(x).ok()),
            Value::Natural32(v) => single(v).map(i64::from),
            Value::Natural16(v) => single(v).map(i64::from),
            Value::Natural8(v) => single(v).map(i64::from),
            Value::Real64(v) => single(v).and_then(integral),
            Value::Real32(v) => single(v).and_then(|x| integral(f64::from(x))),
            _ => None,
        }
    }

    /// True when both values carry the same variant
    pub fn same_kind(&self, other: &Value) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Empty => write!(f, "empty"),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Unstructured(v) => write!(f, "unstructured({} bytes)", v.len()),
            Value::Bit(v) => write!(f, "bit{:?}", v),
            Value::Integer64(v) => write!(f, "integer64{:?}", v),
            Value::Integer32(v) => write!(f, "integer32{:?}", v),
            Value::Integer16(v) => write!(f, "integer16{:?}", v),
            Value::Integer8(v) => write!(f, "integer8{:?}", v),
            Value::Natural64(v) => write!(f, "natural64{:?}", v),
            Value::Natural32(v) => write!(f, "natural32{:?}", v),
            Value::Natural16(v) => write!(f, "natural16{:?}", v),
            Value::Natural8(v) => write!(f, "natural8{:?}", v),
            Value::Real64(v) => write!(f, "real64{:?}", v),
            Value::Real32(v) => write!(f, "real32{:?}", v),
        }
    }
}
