//! Values exchanged between processes.
//!
//! A `Value` is pure data: arrays and objects own their elements, so a
//! clone is a deep copy and two processes never alias mutable state. The
//! only shared payload is [`FunctionRef`], an immutable handle.

use std::collections::BTreeMap;
use std::fmt;

use crate::function::FunctionRef;

#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(FunctionRef),
}

impl Value {
    /// Copy this value for handoff to another process.
    ///
    /// Arrays and objects are copied recursively; function handles are shared.
    pub fn deep_copy(&self) -> Value {
        match self {
            Value::Array(items) => Value::Array(items.iter().map(Value::deep_copy).collect()),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.deep_copy()))
                    .collect(),
            ),
            Value::Function(function) => Value::Function(function.clone()),
            Value::Nil => Value::Nil,
            Value::Boolean(b) => Value::Boolean(*b),
            Value::Number(n) => Value::Number(*n),
            Value::String(s) => Value::String(s.clone()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Value::Object(fields)
    }
}

impl From<FunctionRef> for Value {
    fn from(function: FunctionRef) -> Self {
        Value::Function(function)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Function(function) => write!(f, "<fn {}>", function.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::NativeFunction;

    #[test]
    fn deep_copy_does_not_alias_nested_arrays() {
        let original = Value::Array(vec![Value::Array(vec![Value::from(1)])]);
        let mut copy = original.deep_copy();

        if let Value::Array(outer) = &mut copy {
            if let Value::Array(inner) = &mut outer[0] {
                inner.push(Value::from(2));
            }
        }

        assert_eq!(
            original,
            Value::Array(vec![Value::Array(vec![Value::from(1)])])
        );
        assert_ne!(original, copy);
    }

    #[test]
    fn deep_copy_of_object_is_independent() {
        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), Value::from(1));
        let original = Value::Object(fields);

        let mut copy = original.deep_copy();
        if let Value::Object(fields) = &mut copy {
            fields.insert("count".to_string(), Value::from(2));
        }

        assert_eq!(
            original.as_object().and_then(|o| o.get("count")),
            Some(&Value::from(1))
        );
    }

    #[test]
    fn function_handles_are_shared_on_copy() {
        let function = NativeFunction::new("noop", |_cx| async { Ok(Value::Nil) }).into_ref();
        let value = Value::Function(function.clone());
        let copy = value.deep_copy();
        assert_eq!(copy.as_function(), Some(&function));
    }

    #[test]
    fn display_formats_nested_values() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), Value::from(vec![Value::from(1), Value::Nil]));
        fields.insert("b".to_string(), Value::from(true));
        assert_eq!(Value::Object(fields).to_string(), "{a: [1, nil], b: true}");
        assert_eq!(Value::from("ping").to_string(), "ping");
    }

    #[test]
    fn accessors_match_variants() {
        assert_eq!(Value::from(3).as_number(), Some(3.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::from(false).as_bool(), Some(false));
        assert!(Value::Nil.is_nil());
        assert_eq!(Value::from(1).type_name(), "number");
        assert_eq!(Value::from(1).as_str(), None);
    }
}
