//! Typed control ports of recall units.

use alloc::vec::Vec;
use arrayvec::ArrayString;

/// Value carried by a control port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PortValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
}

impl PortValue {
    /// Whether `other` has the same type as `self`.
    pub fn same_kind(&self, other: &PortValue) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> f64 {
        match *self {
            PortValue::Bool(b) => b as u8 as f64,
            PortValue::Int(v) => v as f64,
            PortValue::UInt(v) => v as f64,
            PortValue::Float(v) => v as f64,
            PortValue::Double(v) => v,
        }
    }
}

/// A named control port.
#[derive(Clone, Debug, PartialEq)]
pub struct Port {
    pub name: ArrayString<32>,
    pub value: PortValue,
    pub default: PortValue,
}

impl Port {
    pub fn new(name: &str, default: PortValue) -> Self {
        let mut port_name = ArrayString::new();
        let _ = port_name.try_push_str(name);
        Self {
            name: port_name,
            value: default,
            default,
        }
    }

    pub fn reset(&mut self) {
        self.value = self.default;
    }
}

/// Ordered set of ports owned by one recall unit.
///
/// Cloning deep-copies every port, so duplicated units mutate their
/// values independently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Ports {
    ports: Vec<Port>,
}

impl Ports {
    pub fn new(ports: Vec<Port>) -> Self {
        Self { ports }
    }

    pub fn get(&self, name: &str) -> Option<PortValue> {
        self.ports.iter().find(|p| p.name.as_str() == name).map(|p| p.value)
    }

    /// Set a port's value. Returns `false` if the port is missing or the
    /// value has a different type.
    pub fn set(&mut self, name: &str, value: PortValue) -> bool {
        match self.ports.iter_mut().find(|p| p.name.as_str() == name) {
            Some(port) if port.value.same_kind(&value) => {
                port.value = value;
                true
            }
            _ => false,
        }
    }

    /// Numeric value of a port, or `fallback` when it is missing.
    pub fn f32_or(&self, name: &str, fallback: f32) -> f32 {
        self.get(name).map_or(fallback, |v| v.as_f64() as f32)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter()
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
