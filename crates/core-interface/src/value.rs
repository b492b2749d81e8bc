//! Property values, instance snapshots and class schemas

use crate::path::{eq_fold, KeyValue, ObjectPath};
use serde::{Deserialize, Serialize};

/// A typed property value as returned by the remote service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    SInt(i64),
    UInt(u64),
    Real(f64),
    Str(String),
    /// DMTF datetime or interval text
    DateTime(String),
    Reference(ObjectPath),
    Array(Vec<Value>),
    Embedded(Box<Instance>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::DateTime(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::SInt(n) => Some(*n),
            Value::UInt(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::SInt(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_u64().and_then(|n| u32::try_from(n).ok())
    }

    pub fn as_u16(&self) -> Option<u16> {
        self.as_u64().and_then(|n| u16::try_from(n).ok())
    }

    pub fn as_reference(&self) -> Option<&ObjectPath> {
        match self {
            Value::Reference(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// String array; `None` if any element is not a string
    pub fn as_str_array(&self) -> Option<Vec<&str>> {
        self.as_array()?.iter().map(Value::as_str).collect()
    }

    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Value::Embedded(instance) => Some(instance),
            _ => None,
        }
    }

    /// Natural kind of this value; `None` for null and arrays
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null | Value::Array(_) => None,
            Value::Bool(_) => Some(ValueKind::Boolean),
            Value::SInt(_) | Value::UInt(_) => Some(ValueKind::Integer),
            Value::Real(_) => Some(ValueKind::Real),
            Value::Str(_) => Some(ValueKind::String),
            Value::DateTime(_) => Some(ValueKind::DateTime),
            Value::Reference(_) => Some(ValueKind::Reference),
            Value::Embedded(_) => Some(ValueKind::Instance),
        }
    }

    /// Whether the value can be stored in a property declared as `kind`
    pub fn conforms_to(&self, kind: ValueKind, is_array: bool) -> bool {
        match self {
            Value::Null => true,
            Value::Array(items) => is_array && items.iter().all(|v| v.conforms_to(kind, false)),
            _ if is_array => false,
            scalar => match kind {
                ValueKind::Boolean => matches!(scalar, Value::Bool(_)),
                ValueKind::Integer => matches!(scalar, Value::SInt(_) | Value::UInt(_)),
                ValueKind::Real => {
                    matches!(scalar, Value::Real(_) | Value::SInt(_) | Value::UInt(_))
                }
                ValueKind::String => matches!(scalar, Value::Str(_)),
                ValueKind::DateTime => matches!(scalar, Value::DateTime(_) | Value::Str(_)),
                ValueKind::Reference => matches!(scalar, Value::Reference(_) | Value::Str(_)),
                ValueKind::Instance => matches!(scalar, Value::Embedded(_)),
            },
        }
    }

    /// Convert to a key value, if the type can act as a key
    pub fn to_key_value(&self) -> Option<KeyValue> {
        match self {
            Value::Str(s) | Value::DateTime(s) => Some(KeyValue::Str(s.clone())),
            Value::SInt(n) => Some(KeyValue::Int(*n)),
            Value::UInt(n) => Some(
                i64::try_from(*n)
                    .map(KeyValue::Int)
                    .unwrap_or_else(|_| KeyValue::Str(n.to_string())),
            ),
            Value::Bool(b) => Some(KeyValue::Str(if *b { "True" } else { "False" }.to_string())),
            Value::Reference(path) => Some(KeyValue::Str(path.to_string())),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::SInt(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::SInt(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::UInt(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::UInt(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Value::UInt(n.into())
    }
}

impl From<ObjectPath> for Value {
    fn from(path: ObjectPath) -> Self {
        Value::Reference(path)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<KeyValue> for Value {
    fn from(key: KeyValue) -> Self {
        match key {
            KeyValue::Str(s) => Value::Str(s),
            KeyValue::Int(n) => Value::SInt(n),
        }
    }
}

/// Declared type of a schema property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Boolean,
    Integer,
    Real,
    String,
    DateTime,
    Reference,
    Instance,
}

/// One named property in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Value,
    #[serde(default)]
    pub is_key: bool,
}

/// Snapshot of a remote instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub server: String,
    pub namespace: String,
    pub class_name: String,
    pub properties: Vec<Property>,
}

impl Instance {
    pub fn new(
        server: impl Into<String>,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            namespace: namespace.into(),
            class_name: class_name.into(),
            properties: Vec::new(),
        }
    }

    /// Builder: add or replace a key property
    pub fn with_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(name.into(), value.into(), true);
        self
    }

    /// Builder: add or replace a non-key property
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(name.into(), value.into(), false);
        self
    }

    /// Set a property value, keeping the key flag of an existing property
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let is_key = self.property(&name).map(|p| p.is_key).unwrap_or(false);
        self.put(name, value.into(), is_key);
    }

    fn put(&mut self, name: String, value: Value, is_key: bool) {
        match self.properties.iter_mut().find(|p| eq_fold(&p.name, &name)) {
            Some(existing) => {
                existing.value = value;
                existing.is_key = is_key;
            }
            None => self.properties.push(Property {
                name,
                value,
                is_key,
            }),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| eq_fold(&p.name, name))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.property(name).map(|p| &p.value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn key_properties(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter().filter(|p| p.is_key)
    }

    /// Identity derived from the key properties
    pub fn path(&self) -> ObjectPath {
        ObjectPath::instance(
            &self.server,
            &self.namespace,
            &self.class_name,
            self.key_properties().filter_map(|p| {
                p.value
                    .to_key_value()
                    .map(|value| (p.name.clone(), value))
            }),
        )
    }
}

/// One declared property of a class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDecl {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub is_key: bool,
}

/// Class descriptor: which properties and methods exist remotely
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClassSchema {
    pub class_name: String,
    pub properties: Vec<PropertyDecl>,
    pub methods: Vec<String>,
}

impl ClassSchema {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Default::default()
        }
    }

    pub fn with_key(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.declare(name.into(), kind, false, true)
    }

    pub fn with_property(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.declare(name.into(), kind, false, false)
    }

    pub fn with_array(self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.declare(name.into(), kind, true, false)
    }

    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    fn declare(mut self, name: String, kind: ValueKind, is_array: bool, is_key: bool) -> Self {
        self.properties.retain(|p| !eq_fold(&p.name, &name));
        self.properties.push(PropertyDecl {
            name,
            kind,
            is_array,
            is_key,
        });
        self
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDecl> {
        self.properties.iter().find(|p| eq_fold(&p.name, name))
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.property(name).is_some()
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| eq_fold(m, name))
    }

    /// Schema inferred from a snapshot, for services that don't publish one.
    ///
    /// Null properties are declared as strings.
    pub fn infer_from(instance: &Instance) -> Self {
        let mut schema = ClassSchema::new(&instance.class_name);
        for p in &instance.properties {
            let (kind, is_array) = match &p.value {
                Value::Array(items) => (
                    items.first().and_then(Value::kind).unwrap_or(ValueKind::String),
                    true,
                ),
                other => (other.kind().unwrap_or(ValueKind::String), false),
            };
            schema = schema.declare(p.name.clone(), kind, is_array, p.is_key);
        }
        schema
    }
}

/// Result of a method invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MethodOutput {
    pub return_value: u32,
    pub out: Vec<(String, Value)>,
}

impl MethodOutput {
    pub fn new(return_value: u32) -> Self {
        Self {
            return_value,
            out: Vec::new(),
        }
    }

    pub fn with_out(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.out.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.out
            .iter()
            .find(|(n, _)| eq_fold(n, name))
            .map(|(_, v)| v)
    }
}
