//! Serializable values carried by state fields and RPC arguments.
//!
//! `StateValue` is a closed set of shapes so that any codec able to encode an
//! externally tagged enum can carry it faithfully. Maps are ordered, which
//! keeps the encoded bytes deterministic.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValueError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum StateValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Human-readable name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "integer",
            StateValue::Float(_) => "float",
            StateValue::Str(_) => "string",
            StateValue::List(_) => "list",
            StateValue::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Equality used for diffing. Floats compare by bit pattern, so a NaN
    /// field equals itself and is not resent every cycle.
    pub fn same_as(&self, other: &StateValue) -> bool {
        match (self, other) {
            (StateValue::Float(a), StateValue::Float(b)) => a.to_bits() == b.to_bits(),
            (StateValue::List(a), StateValue::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (StateValue::Map(a), StateValue::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
            }
            _ => self == other,
        }
    }
}

/// Conversion into the wire value.
pub trait IntoStateValue {
    fn into_state_value(self) -> StateValue;
}

/// Conversion out of the wire value.
pub trait FromStateValue: Sized {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError>;
}

impl IntoStateValue for StateValue {
    fn into_state_value(self) -> StateValue {
        self
    }
}

impl FromStateValue for StateValue {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        Ok(value.clone())
    }
}

impl IntoStateValue for bool {
    fn into_state_value(self) -> StateValue {
        StateValue::Bool(self)
    }
}

impl FromStateValue for bool {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Bool(b) => Ok(*b),
            other => Err(ValueError::new("bool", other.kind())),
        }
    }
}

impl IntoStateValue for i64 {
    fn into_state_value(self) -> StateValue {
        StateValue::Int(self)
    }
}

impl FromStateValue for i64 {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Int(i) => Ok(*i),
            other => Err(ValueError::new("integer", other.kind())),
        }
    }
}

macro_rules! narrow_integer {
    ($($ty:ty),*) => {
        $(
            impl IntoStateValue for $ty {
                fn into_state_value(self) -> StateValue {
                    StateValue::Int(self as i64)
                }
            }

            impl FromStateValue for $ty {
                fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
                    match value {
                        StateValue::Int(i) => <$ty>::try_from(*i)
                            .map_err(|_| ValueError::new(stringify!($ty), "out-of-range integer")),
                        other => Err(ValueError::new(stringify!($ty), other.kind())),
                    }
                }
            }
        )*
    };
}

narrow_integer!(i32, u32, u16, u8);

impl IntoStateValue for f64 {
    fn into_state_value(self) -> StateValue {
        StateValue::Float(self)
    }
}

impl FromStateValue for f64 {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Float(f) => Ok(*f),
            // Integral widths and positions arrive as integers from some clients.
            StateValue::Int(i) => Ok(*i as f64),
            other => Err(ValueError::new("float", other.kind())),
        }
    }
}

impl IntoStateValue for String {
    fn into_state_value(self) -> StateValue {
        StateValue::Str(self)
    }
}

impl IntoStateValue for &str {
    fn into_state_value(self) -> StateValue {
        StateValue::Str(self.to_string())
    }
}

impl FromStateValue for String {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Str(s) => Ok(s.clone()),
            other => Err(ValueError::new("string", other.kind())),
        }
    }
}

impl<T: IntoStateValue> IntoStateValue for Option<T> {
    fn into_state_value(self) -> StateValue {
        match self {
            Some(v) => v.into_state_value(),
            None => StateValue::Null,
        }
    }
}

impl<T: FromStateValue> FromStateValue for Option<T> {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Null => Ok(None),
            other => T::from_state_value(other).map(Some),
        }
    }
}

impl<T: IntoStateValue> IntoStateValue for Vec<T> {
    fn into_state_value(self) -> StateValue {
        StateValue::List(self.into_iter().map(IntoStateValue::into_state_value).collect())
    }
}

impl<T: FromStateValue> FromStateValue for Vec<T> {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::List(items) => items.iter().map(T::from_state_value).collect(),
            other => Err(ValueError::new("list", other.kind())),
        }
    }
}

impl<T: IntoStateValue> IntoStateValue for BTreeMap<String, T> {
    fn into_state_value(self) -> StateValue {
        StateValue::Map(
            self.into_iter()
                .map(|(k, v)| (k, v.into_state_value()))
                .collect(),
        )
    }
}

impl<T: FromStateValue> FromStateValue for BTreeMap<String, T> {
    fn from_state_value(value: &StateValue) -> Result<Self, ValueError> {
        match value {
            StateValue::Map(entries) => entries
                .iter()
                .map(|(k, v)| T::from_state_value(v).map(|v| (k.clone(), v)))
                .collect(),
            other => Err(ValueError::new("map", other.kind())),
        }
    }
}
