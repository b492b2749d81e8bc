//! The remote session contract
//!
//! A [`Session`] executes get/enumerate/query/invoke/modify/subscribe calls
//! against one management endpoint. The object model treats it as opaque: it
//! never sees wire bytes, only [`Instance`] snapshots and [`SessionError`]s.

use crate::path::ObjectPath;
use crate::value::{ClassSchema, Instance, MethodOutput, Value};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Transport-level result codes surfaced by session implementations
pub mod hresult {
    pub const E_ACCESSDENIED: u32 = 0x8007_0005;
    pub const E_OUTOFMEMORY: u32 = 0x8007_000E;
    pub const ERROR_DISK_FULL: u32 = 0x8007_0070;
    pub const WAIT_TIMEOUT: u32 = 0x8007_0102;
    pub const ERROR_TIMEOUT: u32 = 0x8007_05B4;
    pub const RPC_S_SERVER_UNAVAILABLE: u32 = 0x8007_06BA;
    pub const RPC_S_CALL_FAILED: u32 = 0x8007_06BE;
    pub const RPC_E_CALL_CANCELED: u32 = 0x8001_0002;
    pub const WSMAN_CREDSSP_NOT_ENABLED: u32 = 0x8033_81A2;
    pub const WSMAN_CANNOT_DELEGATE: u32 = 0x8033_81A3;
}

/// Status codes defined by the management protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeErrorCode {
    Ok,
    Failed,
    AccessDenied,
    InvalidNamespace,
    InvalidParameter,
    InvalidClass,
    NotFound,
    NotSupported,
    ClassHasChildren,
    ClassHasInstances,
    InvalidSuperclass,
    AlreadyExists,
    NoSuchProperty,
    TypeMismatch,
    QueryLanguageNotSupported,
    InvalidQuery,
    MethodNotAvailable,
    MethodNotFound,
    ServerLimitsExceeded,
    ServerIsShuttingDown,
    Other(u32),
}

impl NativeErrorCode {
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Failed,
            2 => Self::AccessDenied,
            3 => Self::InvalidNamespace,
            4 => Self::InvalidParameter,
            5 => Self::InvalidClass,
            6 => Self::NotFound,
            7 => Self::NotSupported,
            8 => Self::ClassHasChildren,
            9 => Self::ClassHasInstances,
            10 => Self::InvalidSuperclass,
            11 => Self::AlreadyExists,
            12 => Self::NoSuchProperty,
            13 => Self::TypeMismatch,
            14 => Self::QueryLanguageNotSupported,
            15 => Self::InvalidQuery,
            16 => Self::MethodNotAvailable,
            17 => Self::MethodNotFound,
            27 => Self::ServerLimitsExceeded,
            28 => Self::ServerIsShuttingDown,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::Failed => 1,
            Self::AccessDenied => 2,
            Self::InvalidNamespace => 3,
            Self::InvalidParameter => 4,
            Self::InvalidClass => 5,
            Self::NotFound => 6,
            Self::NotSupported => 7,
            Self::ClassHasChildren => 8,
            Self::ClassHasInstances => 9,
            Self::InvalidSuperclass => 10,
            Self::AlreadyExists => 11,
            Self::NoSuchProperty => 12,
            Self::TypeMismatch => 13,
            Self::QueryLanguageNotSupported => 14,
            Self::InvalidQuery => 15,
            Self::MethodNotAvailable => 16,
            Self::MethodNotFound => 17,
            Self::ServerLimitsExceeded => 27,
            Self::ServerIsShuttingDown => 28,
            Self::Other(code) => code,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The service answered with a protocol status code.
    ///
    /// `provider_code` carries the provider's own result code when the
    /// service attached extended error data (usually with `Failed`).
    #[error("Management call failed ({code:?}): {message}")]
    Native {
        code: NativeErrorCode,
        message: String,
        provider_code: Option<u32>,
    },

    #[error("Transport error 0x{hresult:08X}: {message}")]
    Transport { hresult: u32, message: String },

    #[error("Session closed")]
    Closed,

    #[error("Session error: {0}")]
    Other(String),
}

impl SessionError {
    pub fn native(code: NativeErrorCode, message: impl Into<String>) -> Self {
        SessionError::Native {
            code,
            message: message.into(),
            provider_code: None,
        }
    }

    pub fn provider(provider_code: u32, message: impl Into<String>) -> Self {
        SessionError::Native {
            code: NativeErrorCode::Failed,
            message: message.into(),
            provider_code: Some(provider_code),
        }
    }

    pub fn transport(hresult: u32, message: impl Into<String>) -> Self {
        SessionError::Transport {
            hresult,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::native(NativeErrorCode::NotFound, message)
    }

    pub fn native_code(&self) -> Option<NativeErrorCode> {
        match self {
            SessionError::Native { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Kind of instance lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

impl EventKind {
    /// Intrinsic event class carrying this notification
    pub fn event_class(self) -> &'static str {
        match self {
            EventKind::Created => "__InstanceCreationEvent",
            EventKind::Modified => "__InstanceModificationEvent",
            EventKind::Deleted => "__InstanceDeletionEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Created => write!(f, "created"),
            EventKind::Modified => write!(f, "modified"),
            EventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A delivered notification: the post-change snapshot and, for
/// modifications, the snapshot before the change
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub kind: EventKind,
    pub target: Instance,
    pub previous: Option<Instance>,
}

/// Notification stream returned by [`Session::subscribe`].
///
/// Dropping the stream cancels the remote subscription.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<InstanceEvent>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueryDialect {
    #[default]
    Wql,
}

impl QueryDialect {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryDialect::Wql => "WQL",
        }
    }
}

/// The universal interface to a management endpoint
///
/// Implementations must be `Send + Sync + 'static` so proxies, event pumps and
/// pollers can share one session across tasks.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Name of the server this session is connected to
    fn server_name(&self) -> &str;

    async fn get_instance(&self, path: &ObjectPath) -> Result<Instance>;

    async fn get_class(&self, namespace: &str, class_name: &str) -> Result<ClassSchema>;

    async fn enumerate_instances(&self, namespace: &str, class_name: &str)
        -> Result<Vec<Instance>>;

    async fn query(&self, namespace: &str, dialect: QueryDialect, text: &str)
        -> Result<Vec<Instance>>;

    async fn invoke_method(
        &self,
        path: &ObjectPath,
        method: &str,
        args: &[(String, Value)],
    ) -> Result<MethodOutput>;

    async fn modify_instance(&self, path: &ObjectPath, properties: &[(String, Value)])
        -> Result<()>;

    async fn subscribe(&self, namespace: &str, dialect: QueryDialect, text: &str)
        -> Result<EventStream>;
}

/// Who a connection is made as. Secrets stay with the connector.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Credential {
    #[default]
    Current,
    Explicit {
        user: String,
        domain: Option<String>,
    },
}

/// Opens sessions; host and credential resolution live behind this trait
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    async fn connect(&self, server: &str, credential: &Credential) -> Result<Arc<dyn Session>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_round_trip() {
        for code in [0u32, 1, 2, 3, 4, 5, 6, 7, 16, 17, 27, 28, 99] {
            assert_eq!(NativeErrorCode::from_code(code).code(), code);
        }
        assert_eq!(NativeErrorCode::from_code(6), NativeErrorCode::NotFound);
    }

    #[test]
    fn test_event_classes() {
        assert_eq!(EventKind::Modified.event_class(), "__InstanceModificationEvent");
        assert_eq!(EventKind::Deleted.to_string(), "deleted");
    }

    #[test]
    fn test_error_display() {
        let err = SessionError::transport(hresult::RPC_S_SERVER_UNAVAILABLE, "down");
        assert_eq!(err.to_string(), "Transport error 0x800706BA: down");
        assert_eq!(SessionError::not_found("x").native_code(), Some(NativeErrorCode::NotFound));
    }
}
