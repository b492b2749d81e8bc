//! Object identity
//!
//! An [`ObjectPath`] addresses either a remote instance (server, namespace,
//! class and key values) or a remote class (no keys). Comparison follows the
//! management protocol's rules: names and string key values are matched
//! case-insensitively, numeric key values exactly, and the order in which keys
//! were supplied never matters.
//!
//! The string form is `\\server\namespace:Class.Key1="v1",Key2=v2`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Server name used when a path carries no `\\server\` prefix.
pub const LOCAL_SERVER: &str = ".";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path '{0}' refers to a class, not an instance")]
    ClassReference(String),

    #[error("Malformed object path '{path}': {reason}")]
    Malformed { path: String, reason: String },
}

/// Value of a key property
#[derive(Debug, Clone)]
pub enum KeyValue {
    Str(String),
    Int(i64),
}

impl KeyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KeyValue::Str(s) => Some(s),
            KeyValue::Int(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            KeyValue::Int(n) => Some(*n),
            KeyValue::Str(_) => None,
        }
    }

    /// Render the value the way it appears inside a query literal.
    pub fn to_query_literal(&self) -> String {
        match self {
            KeyValue::Int(n) => n.to_string(),
            KeyValue::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (KeyValue::Str(a), KeyValue::Str(b)) => eq_fold(a, b),
            (KeyValue::Int(a), KeyValue::Int(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for KeyValue {}

impl Hash for KeyValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            KeyValue::Str(s) => {
                0u8.hash(state);
                s.to_lowercase().hash(state);
            }
            KeyValue::Int(n) => {
                1u8.hash(state);
                n.hash(state);
            }
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(n) => write!(f, "{}", n),
            KeyValue::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    if c == '"' || c == '\\' {
                        f.write_str("\\")?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str("\"")
            }
        }
    }
}

impl From<&str> for KeyValue {
    fn from(s: &str) -> Self {
        KeyValue::Str(s.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(s: String) -> Self {
        KeyValue::Str(s)
    }
}

impl From<i64> for KeyValue {
    fn from(n: i64) -> Self {
        KeyValue::Int(n)
    }
}

impl From<i32> for KeyValue {
    fn from(n: i32) -> Self {
        KeyValue::Int(n.into())
    }
}

impl From<u32> for KeyValue {
    fn from(n: u32) -> Self {
        KeyValue::Int(n.into())
    }
}

impl From<u16> for KeyValue {
    fn from(n: u16) -> Self {
        KeyValue::Int(n.into())
    }
}

/// Identity of a remote instance or class
#[derive(Debug, Clone)]
pub struct ObjectPath {
    server: String,
    namespace: String,
    class_name: String,
    /// Sorted case-insensitively by key name
    keys: Vec<(String, KeyValue)>,
}

impl ObjectPath {
    /// Path to a class (no keys)
    pub fn class(
        server: impl Into<String>,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            namespace: normalize_namespace(namespace.into()),
            class_name: class_name.into(),
            keys: Vec::new(),
        }
    }

    /// Path to an instance. Later duplicates of a key name replace earlier ones.
    pub fn instance<I, K, V>(
        server: impl Into<String>,
        namespace: impl Into<String>,
        class_name: impl Into<String>,
        keys: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<KeyValue>,
    {
        let mut path = Self::class(server, namespace, class_name);
        for (name, value) in keys {
            path.insert_key(name.into(), value.into());
        }
        path
    }

    fn insert_key(&mut self, name: String, value: KeyValue) {
        let folded = name.to_lowercase();
        match self
            .keys
            .binary_search_by(|(existing, _)| existing.to_lowercase().cmp(&folded))
        {
            Ok(idx) => self.keys[idx] = (name, value),
            Err(idx) => self.keys.insert(idx, (name, value)),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn keys(&self) -> &[(String, KeyValue)] {
        &self.keys
    }

    /// Look up a key value by name (case-insensitive)
    pub fn key(&self, name: &str) -> Option<&KeyValue> {
        self.keys
            .iter()
            .find(|(k, _)| eq_fold(k, name))
            .map(|(_, v)| v)
    }

    /// True when this path denotes a class rather than an instance
    pub fn is_class(&self) -> bool {
        self.keys.is_empty()
    }

    /// Same class, without any keys
    pub fn class_path(&self) -> ObjectPath {
        Self::class(&self.server, &self.namespace, &self.class_name)
    }

    pub fn with_server(&self, server: impl Into<String>) -> ObjectPath {
        ObjectPath {
            server: server.into(),
            ..self.clone()
        }
    }

    /// `\\server\namespace`
    pub fn namespace_path(&self) -> String {
        format!("\\\\{}\\{}", self.server, self.namespace)
    }

    /// Relative instance id (`Class.Key="v"`) used on the wire.
    ///
    /// Fails for class references, which have no instance id.
    pub fn to_instance_id(&self) -> Result<String, PathError> {
        if self.is_class() {
            return Err(PathError::ClassReference(self.to_string()));
        }
        Ok(format!("{}.{}", self.class_name, self.format_keys()))
    }

    fn format_keys(&self) -> String {
        self.keys
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl PartialEq for ObjectPath {
    fn eq(&self, other: &Self) -> bool {
        eq_fold(&self.server, &other.server)
            && eq_fold(&self.namespace, &other.namespace)
            && eq_fold(&self.class_name, &other.class_name)
            && self.keys.len() == other.keys.len()
            && self
                .keys
                .iter()
                .zip(other.keys.iter())
                .all(|((an, av), (bn, bv))| eq_fold(an, bn) && av == bv)
    }
}

impl Eq for ObjectPath {}

impl Hash for ObjectPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.server.to_lowercase().hash(state);
        self.namespace.to_lowercase().hash(state);
        self.class_name.to_lowercase().hash(state);
        self.keys.len().hash(state);
        for (name, value) in &self.keys {
            name.to_lowercase().hash(state);
            value.hash(state);
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace_path(), self.class_name)?;
        if !self.keys.is_empty() {
            write!(f, ".{}", self.format_keys())?;
        }
        Ok(())
    }
}

impl FromStr for ObjectPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| PathError::Malformed {
            path: s.to_string(),
            reason: reason.to_string(),
        };

        let (server, rest) = match s.strip_prefix("\\\\") {
            Some(stripped) => {
                let idx = stripped
                    .find('\\')
                    .ok_or_else(|| malformed("missing namespace after server"))?;
                (&stripped[..idx], &stripped[idx + 1..])
            }
            None => (LOCAL_SERVER, s),
        };
        if server.is_empty() {
            return Err(malformed("empty server name"));
        }

        let colon = rest
            .find(':')
            .ok_or_else(|| malformed("missing ':' before class name"))?;
        let namespace = &rest[..colon];
        if namespace.is_empty() {
            return Err(malformed("empty namespace"));
        }

        let object = &rest[colon + 1..];
        let (class_name, key_text) = match object.find('.') {
            Some(dot) => (&object[..dot], Some(&object[dot + 1..])),
            None => (object, None),
        };
        if class_name.is_empty() {
            return Err(malformed("missing class name"));
        }

        let mut path = ObjectPath::class(server, namespace, class_name);
        if let Some(text) = key_text {
            for (name, value) in parse_keys(text).map_err(malformed)? {
                path.insert_key(name, value);
            }
        }
        Ok(path)
    }
}

fn parse_keys(text: &str) -> Result<Vec<(String, KeyValue)>, &'static str> {
    let mut keys = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err("key without value");
        }
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err("empty key name");
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => value.push(escaped),
                        None => return Err("dangling escape in key value"),
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            if !closed {
                return Err("unterminated string key value");
            }
            KeyValue::Str(value)
        } else {
            let mut raw = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                raw.push(c);
                chars.next();
            }
            let raw = raw.trim();
            match raw.parse::<i64>() {
                Ok(n) => KeyValue::Int(n),
                Err(_) => KeyValue::Str(raw.to_string()),
            }
        };
        keys.push((name, value));

        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(_) => return Err("expected ',' between keys"),
        }
    }

    Ok(keys)
}

impl Serialize for ObjectPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

fn normalize_namespace(namespace: String) -> String {
    if namespace.contains('/') {
        namespace.replace('/', "\\")
    } else {
        namespace
    }
}

/// Case-insensitive string comparison used for every identity component
pub fn eq_fold(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b) || a.to_lowercase() == b.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::collections::HashSet;

    fn hash_of(path: &ObjectPath) -> u64 {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        hasher.finish()
    }

    fn vm(server: &str, name: &str) -> ObjectPath {
        ObjectPath::instance(
            server,
            "root\\virtualization\\v2",
            "Msvm_ComputerSystem",
            [("CreationClassName", "Msvm_ComputerSystem"), ("Name", name)],
        )
    }

    #[test]
    fn test_equality_ignores_case() {
        let a = vm("HOST01", "ABC-123");
        let b = ObjectPath::instance(
            "host01",
            "ROOT\\Virtualization\\V2",
            "msvm_computersystem",
            [("name", "abc-123"), ("creationclassname", "MSVM_COMPUTERSYSTEM")],
        );
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn test_equality_is_transitive() {
        let a = vm("host", "Guest");
        let b = vm("HOST", "GUEST");
        let c = vm("Host", "guest");
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a, c);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = ObjectPath::instance("s", "ns", "Foo", [("A", 1i64), ("B", 2i64)]);
        let b = ObjectPath::instance("s", "ns", "Foo", [("B", 2i64), ("A", 1i64)]);
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_numeric_keys_compare_exactly() {
        let a = ObjectPath::instance("s", "ns", "Foo", [("Id", 10i64)]);
        let b = ObjectPath::instance("s", "ns", "Foo", [("Id", 10i64)]);
        let c = ObjectPath::instance("s", "ns", "Foo", [("Id", 11i64)]);
        let d = ObjectPath::instance("s", "ns", "Foo", [("Id", "10")]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_different_key_sets_are_not_equal() {
        let a = ObjectPath::instance("s", "ns", "Foo", [("Id", "A")]);
        let b = ObjectPath::instance("s", "ns", "Foo", [("Id", "A"), ("Extra", "B")]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_set_deduplicates() {
        let mut set = HashSet::new();
        set.insert(vm("host", "A"));
        set.insert(vm("HOST", "a"));
        set.insert(vm("host", "B"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_display_format() {
        let path = ObjectPath::instance(
            "server",
            "root\\virtualization\\v2",
            "Msvm_Foo",
            [("Name", KeyValue::from("a\"b\\c")), ("Index", KeyValue::from(7i64))],
        );
        assert_eq!(
            path.to_string(),
            "\\\\server\\root\\virtualization\\v2:Msvm_Foo.Index=7,Name=\"a\\\"b\\\\c\""
        );
    }

    #[test]
    fn test_parse_instance_path() {
        let path: ObjectPath = "\\\\srv\\root\\cimv2:Win32_Service.Name=\"vmms\",Pid=42"
            .parse()
            .unwrap();
        assert_eq!(path.server(), "srv");
        assert_eq!(path.namespace(), "root\\cimv2");
        assert_eq!(path.class_name(), "Win32_Service");
        assert_eq!(path.key("name").and_then(|v| v.as_str()), Some("vmms"));
        assert_eq!(path.key("PID").and_then(|v| v.as_i64()), Some(42));
        assert!(!path.is_class());
    }

    #[test]
    fn test_parse_escaped_string_key() {
        let path: ObjectPath = "\\\\srv\\ns:Foo.Id=\"say \\\"hi\\\" \\\\ bye\""
            .parse()
            .unwrap();
        assert_eq!(
            path.key("Id").and_then(|v| v.as_str()),
            Some("say \"hi\" \\ bye")
        );
    }

    #[test]
    fn test_display_parse_round_trip() {
        let original = ObjectPath::instance(
            "h",
            "root\\virtualization\\v2",
            "Msvm_ConcreteJob",
            [("InstanceID", KeyValue::from("{1F2E}\\\"x\""))],
        );
        let parsed: ObjectPath = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_parse_class_path() {
        let path: ObjectPath = "\\\\srv\\root\\virtualization\\v2:Msvm_ComputerSystem"
            .parse()
            .unwrap();
        assert!(path.is_class());
        assert!(matches!(
            path.to_instance_id(),
            Err(PathError::ClassReference(_))
        ));
    }

    #[test]
    fn test_parse_without_server_uses_local() {
        let path: ObjectPath = "root/cimv2:Foo.Id=1".parse().unwrap();
        assert_eq!(path.server(), LOCAL_SERVER);
        assert_eq!(path.namespace(), "root\\cimv2");
    }

    #[test]
    fn test_parse_tolerates_bare_string_value() {
        let path: ObjectPath = "\\\\s\\ns:Foo.Name=bare".parse().unwrap();
        assert_eq!(path.key("Name").and_then(|v| v.as_str()), Some("bare"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for text in [
            "\\\\srv",
            "\\\\srv\\ns",
            "\\\\srv\\ns:",
            "\\\\srv\\:Foo",
            "\\\\srv\\ns:Foo.Id",
            "\\\\srv\\ns:Foo.Id=\"open",
            "\\\\srv\\ns:Foo.Id=\"a\"x",
        ] {
            assert!(
                matches!(text.parse::<ObjectPath>(), Err(PathError::Malformed { .. })),
                "expected failure for {text}"
            );
        }
    }

    #[test]
    fn test_instance_id() {
        let path = ObjectPath::instance("s", "ns", "Foo", [("Id", "A")]);
        assert_eq!(path.to_instance_id().unwrap(), "Foo.Id=\"A\"");
    }

    #[test]
    fn test_duplicate_key_replaces() {
        let path = ObjectPath::instance("s", "ns", "Foo", [("Id", "A"), ("ID", "B")]);
        assert_eq!(path.keys().len(), 1);
        assert_eq!(path.key("id").and_then(|v| v.as_str()), Some("B"));
    }

    #[test]
    fn test_serde_as_string() {
        let path = ObjectPath::instance("s", "ns", "Foo", [("Id", 5i64)]);
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"\\\\\\\\s\\\\ns:Foo.Id=5\"");
        let back: ObjectPath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);
    }

    #[test]
    fn test_query_literal() {
        assert_eq!(KeyValue::from("it's").to_query_literal(), "'it\\'s'");
        assert_eq!(KeyValue::from(3i64).to_query_literal(), "3");
    }
}
