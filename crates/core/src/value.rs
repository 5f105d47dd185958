//! Value types for procedure parameters, results and partition data
//!
//! This module defines:
//! - Value: Scalar value stored in partitions and passed to procedures
//! - ParameterSet: Ordered procedure parameters
//!
//! Different variants are never equal: `Int(1) != Float(1.0)`.

use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Scalar value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    String(String),
}

// IEEE-754 float semantics, different types never equal
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
        }
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Float payload, if any
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric addition used by `Add` operations
    ///
    /// `Null` acts as zero of the other operand's type. Mixed Int/Float and
    /// non-numeric operands yield `None`; integer overflow yields `None`.
    pub fn checked_add(&self, delta: &Value) -> Option<Value> {
        match (self, delta) {
            (Value::Null, Value::Int(d)) => Some(Value::Int(*d)),
            (Value::Null, Value::Float(d)) => Some(Value::Float(*d)),
            (Value::Int(a), Value::Int(d)) => a.checked_add(*d).map(Value::Int),
            (Value::Float(a), Value::Float(d)) => Some(Value::Float(a + d)),
            _ => None,
        }
    }

    /// Map this value onto one of `partitions` partitions
    ///
    /// Integers map by euclidean remainder so that account `n` lives on
    /// partition `n % partitions`; other values are hashed. Floats and nulls
    /// map to partition 0.
    pub fn partition(&self, partitions: u32) -> PartitionId {
        if partitions == 0 {
            return PartitionId::new(0);
        }
        let raw = match self {
            Value::Int(v) => v.rem_euclid(partitions as i64) as u32,
            Value::String(s) => {
                let mut hasher = DefaultHasher::new();
                s.hash(&mut hasher);
                (hasher.finish() % partitions as u64) as u32
            }
            Value::Bool(b) => (*b as u32) % partitions,
            Value::Null | Value::Float(_) => 0,
        };
        PartitionId::new(raw)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// Ordered procedure parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet(Vec<Value>);

impl ParameterSet {
    /// Wrap a parameter vector
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Parameter at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no parameters
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All parameters as a slice
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }
}

impl From<Vec<Value>> for ParameterSet {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}
