//! Embedded instances
//!
//! Some method outputs carry whole instances as text. The blob format is a
//! self-describing JSON document:
//!
//! ```json
//! {"class": "Msvm_Error", "namespace": "root\\virtualization\\v2",
//!  "properties": [{"name": "Message", "value": {"type": "str", "value": "..."}}]}
//! ```
//!
//! Decoding against a [`ClassSchema`] rejects unknown properties and values
//! of the wrong kind.

use serde::{Deserialize, Serialize};
use virtmgmt_core_interface::{eq_fold, ClassSchema, Instance, Property, Value};

use crate::error::{Error, MemberKind, Result};

#[derive(Debug, Serialize, Deserialize)]
struct Blob {
    class: String,
    namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    server: String,
    properties: Vec<BlobProperty>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobProperty {
    name: String,
    value: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    key: bool,
}

/// Encode an instance as an embedded-instance blob
pub fn serialize(instance: &Instance) -> Result<String> {
    let blob = Blob {
        class: instance.class_name.clone(),
        namespace: instance.namespace.clone(),
        server: instance.server.clone(),
        properties: instance
            .properties
            .iter()
            .map(|p| BlobProperty {
                name: p.name.clone(),
                value: p.value.clone(),
                key: p.is_key,
            })
            .collect(),
    };
    serde_json::to_string(&blob).map_err(|e| {
        Error::invalid_value(&instance.class_name, e.to_string(), "serializable values")
    })
}

fn parse_blob(text: &str) -> Result<Blob> {
    serde_json::from_str(text).map_err(|e| Error::InvalidValue {
        name: "embedded instance".to_string(),
        value: e.to_string(),
        expected: "an embedded instance document".to_string(),
    })
}

fn into_instance(blob: Blob) -> Instance {
    Instance {
        server: blob.server,
        namespace: blob.namespace,
        class_name: blob.class,
        properties: blob
            .properties
            .into_iter()
            .map(|p| Property {
                name: p.name,
                value: p.value,
                is_key: p.key,
            })
            .collect(),
    }
}

/// Decode a blob, validating every property against `schema`.
///
/// Key flags come from the schema, not the blob.
pub fn deserialize(text: &str, schema: &ClassSchema) -> Result<Instance> {
    let blob = parse_blob(text)?;
    if !eq_fold(&blob.class, &schema.class_name) {
        return Err(Error::invalid_value(
            "__CLASS",
            &blob.class,
            format!("an instance of {}", schema.class_name),
        ));
    }

    let mut instance = into_instance(blob);
    for property in &mut instance.properties {
        let decl = schema.property(&property.name).ok_or_else(|| {
            Error::schema_mismatch(MemberKind::Property, &schema.class_name, &property.name)
        })?;
        if !property.value.conforms_to(decl.kind, decl.is_array) {
            return Err(Error::invalid_value(
                &property.name,
                &property.value,
                format!(
                    "{:?}{}",
                    decl.kind,
                    if decl.is_array { " array" } else { "" }
                ),
            ));
        }
        property.is_key = decl.is_key;
    }
    Ok(instance)
}

/// Decode a blob without a schema (used when the class cannot be fetched)
pub fn deserialize_untyped(text: &str) -> Result<Instance> {
    parse_blob(text).map(into_instance)
}

/// Types that can be built from an instance snapshot
pub trait FromInstance: Sized {
    /// Remote class this type represents
    const CLASS_NAME: &'static str;

    fn from_instance(instance: &Instance) -> Result<Self>;
}

/// A decoded embedded instance with typed access
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedInstance {
    instance: Instance,
}

impl EmbeddedInstance {
    pub fn new(namespace: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            instance: Instance::new("", namespace, class_name),
        }
    }

    /// Decode `text`, validating against `schema` when one is available
    pub fn parse(text: &str, schema: Option<&ClassSchema>) -> Result<Self> {
        let instance = match schema {
            Some(schema) => deserialize(text, schema)?,
            None => deserialize_untyped(text)?,
        };
        Ok(Self { instance })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn class_name(&self) -> &str {
        &self.instance.class_name
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.instance.set(name, value);
    }

    /// Property value; a missing property is a schema mismatch
    pub fn get(&self, name: &str) -> Result<&Value> {
        self.instance.get(name).ok_or_else(|| {
            Error::schema_mismatch(MemberKind::Property, &self.instance.class_name, name)
        })
    }

    pub fn try_get(&self, name: &str) -> Option<&Value> {
        self.instance.get(name)
    }

    pub fn to_blob(&self) -> Result<String> {
        serialize(&self.instance)
    }

    pub fn convert_to<T: FromInstance>(&self) -> Result<T> {
        if !eq_fold(&self.instance.class_name, T::CLASS_NAME) {
            return Err(Error::invalid_value(
                "__CLASS",
                &self.instance.class_name,
                format!("an instance of {}", T::CLASS_NAME),
            ));
        }
        T::from_instance(&self.instance)
    }
}

impl From<Instance> for EmbeddedInstance {
    fn from(instance: Instance) -> Self {
        Self { instance }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtmgmt_core_interface::ValueKind;

    fn error_schema() -> ClassSchema {
        ClassSchema::new("Msvm_Error")
            .with_property("Message", ValueKind::String)
            .with_property("MessageID", ValueKind::String)
            .with_property("PerceivedSeverity", ValueKind::Integer)
            .with_array("MessageArguments", ValueKind::String)
    }

    fn error_instance() -> Instance {
        Instance::new("HOST01", "root\\virtualization\\v2", "Msvm_Error")
            .with_property("Message", "Disk is full")
            .with_property("MessageID", "32768")
            .with_property("PerceivedSeverity", Value::UInt(6))
            .with_property(
                "MessageArguments",
                Value::Array(vec![Value::from("C:"), Value::from("vm1")]),
            )
    }

    #[test]
    fn test_serialize_then_validate() {
        let blob = serialize(&error_instance()).unwrap();
        assert!(blob.contains("\"class\":\"Msvm_Error\""));

        let decoded = deserialize(&blob, &error_schema()).unwrap();
        assert_eq!(decoded.get("Message"), Some(&Value::from("Disk is full")));
        assert_eq!(decoded.server, "HOST01");
    }

    #[test]
    fn test_unknown_property_is_schema_mismatch() {
        let instance = error_instance().with_property("Bogus", "x");
        let blob = serialize(&instance).unwrap();
        let err = deserialize(&blob, &error_schema()).unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaMismatch {
                kind: MemberKind::Property,
                ref member,
                ..
            } if member == "Bogus"
        ));
    }

    #[test]
    fn test_wrong_kind_is_invalid_value() {
        let instance = error_instance().with_property("PerceivedSeverity", "high");
        let blob = serialize(&instance).unwrap();
        assert!(matches!(
            deserialize(&blob, &error_schema()),
            Err(Error::InvalidValue { ref name, .. }) if name == "PerceivedSeverity"
        ));
    }

    #[test]
    fn test_wrong_class_rejected() {
        let blob = serialize(&Instance::new("", "root", "Msvm_Other")).unwrap();
        assert!(deserialize(&blob, &error_schema()).is_err());
        // without a schema anything well-formed decodes
        assert_eq!(
            deserialize_untyped(&blob).unwrap().class_name,
            "Msvm_Other"
        );
    }

    #[test]
    fn test_garbage_blob() {
        assert!(matches!(
            deserialize_untyped("<INSTANCE CLASSNAME=\"Msvm_Error\">"),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_embedded_instance_get() {
        let blob = serialize(&error_instance()).unwrap();
        let embedded = EmbeddedInstance::parse(&blob, Some(&error_schema())).unwrap();
        assert_eq!(embedded.get("message").unwrap().as_str(), Some("Disk is full"));
        assert!(matches!(
            embedded.get("ErrorSource"),
            Err(Error::SchemaMismatch { .. })
        ));
        assert!(embedded.try_get("ErrorSource").is_none());
    }

    struct Named {
        message: String,
    }

    impl FromInstance for Named {
        const CLASS_NAME: &'static str = "Msvm_Error";

        fn from_instance(instance: &Instance) -> Result<Self> {
            Ok(Named {
                message: instance
                    .get("Message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        }
    }

    #[test]
    fn test_convert_to_checks_class() {
        let embedded = EmbeddedInstance::from(error_instance());
        let named: Named = embedded.convert_to().unwrap();
        assert_eq!(named.message, "Disk is full");

        let other = EmbeddedInstance::new("root", "Msvm_Other");
        assert!(other.convert_to::<Named>().is_err());
    }
}
