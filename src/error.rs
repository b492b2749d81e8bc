/*!
 * Error types for the object model
 *
 * Session failures are classified once, at the boundary, into the taxonomy
 * below. Everything above the proxy layer sees only `Error`.
 */

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::Level;
use virtmgmt_core_interface::{hresult, NativeErrorCode, PathError, SessionError};
use virtmgmt_core_resilience::ResilienceError;

/// Result type alias for object model operations
pub type Result<T> = std::result::Result<T, Error>;

/// Well-known return and error codes
pub mod codes {
    pub const SUCCESS: i64 = 0;
    pub const JOB_STARTED: i64 = 4096;
    pub const FAILED: i64 = 32768;
    pub const ACCESS_DENIED: i64 = 32769;
    pub const NOT_SUPPORTED: i64 = 32770;
    pub const STATUS_UNKNOWN: i64 = 32771;
    pub const TIMEOUT: i64 = 32772;
    pub const INVALID_PARAMETER: i64 = 32773;
    pub const SYSTEM_IN_USE: i64 = 32774;
    pub const INVALID_STATE: i64 = 32775;
    pub const INCORRECT_DATA_TYPE: i64 = 32776;
    pub const NOT_AVAILABLE: i64 = 32777;
    pub const OUT_OF_MEMORY: i64 = 32778;

    /// Client-side codes reported by tasks that never saw a server result
    pub const CLIENT_DISCONNECTED: i64 = -1;
    pub const CLIENT_AFFECTED_ELEMENT_MISSING: i64 = -2;
    pub const CLIENT_DELETED: i64 = -3;
    pub const CLIENT_NETWORK_TIMEOUT: i64 = -4;
}

/// Which kind of class member a schema mismatch refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Property,
    Method,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::Property => write!(f, "property"),
            MemberKind::Method => write!(f, "method"),
        }
    }
}

/// Why a server could not be reached or used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionIssue {
    AccessDenied,
    InvalidNamespace,
    InvalidClass,
    RpcServerUnavailable,
    ServerResolution,
    ConnectedWithDifferentCredentials,
    CredentialsNotSupportedOnLocalHost,
    CredSspNotEnabledOnClient,
    ClientCannotDelegateCredentials,
    Unknown,
}

impl fmt::Display for ConnectionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionIssue::AccessDenied => "access denied",
            ConnectionIssue::InvalidNamespace => "the management namespace is missing",
            ConnectionIssue::InvalidClass => "a required management class is missing",
            ConnectionIssue::RpcServerUnavailable => "the RPC server is unavailable",
            ConnectionIssue::ServerResolution => "the server name could not be resolved",
            ConnectionIssue::ConnectedWithDifferentCredentials => {
                "already connected with different credentials"
            }
            ConnectionIssue::CredentialsNotSupportedOnLocalHost => {
                "explicit credentials are not supported for the local host"
            }
            ConnectionIssue::CredSspNotEnabledOnClient => "CredSSP is not enabled on the client",
            ConnectionIssue::ClientCannotDelegateCredentials => {
                "the client cannot delegate credentials"
            }
            ConnectionIssue::Unknown => "unknown connection failure",
        };
        f.write_str(text)
    }
}

/// Why a call reached the server but failed there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerCallReason {
    RpcCallFailed,
    TimedOut,
    OutOfMemoryOrDiskSpace,
    UnknownProviderError,
    NotSupported,
    Unknown,
}

impl fmt::Display for ServerCallReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ServerCallReason::RpcCallFailed => "the remote procedure call failed",
            ServerCallReason::TimedOut => "the call timed out",
            ServerCallReason::OutOfMemoryOrDiskSpace => "the server is out of memory or disk space",
            ServerCallReason::UnknownProviderError => "the management provider reported an error",
            ServerCallReason::NotSupported => "the operation is not supported",
            ServerCallReason::Unknown => "unknown failure",
        };
        f.write_str(text)
    }
}

/// Management operation an `OperationFailed` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InvokeMethod,
    ModifyProperties,
    CancelTask,
    RunJob,
    GetErrors,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operation::InvokeMethod => "invoke method",
            Operation::ModifyProperties => "modify properties",
            Operation::CancelTask => "cancel task",
            Operation::RunJob => "run job",
            Operation::GetErrors => "get errors",
        };
        f.write_str(text)
    }
}

/// Coarse grouping for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Schema,
    NotFound,
    Connection,
    ServerCall,
    Operation,
    Cancellation,
    LocalValue,
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorCategory::Schema => "schema",
            ErrorCategory::NotFound => "not found",
            ErrorCategory::Connection => "connection",
            ErrorCategory::ServerCall => "server call",
            ErrorCategory::Operation => "operation",
            ErrorCategory::Cancellation => "cancellation",
            ErrorCategory::LocalValue => "local value",
            ErrorCategory::Configuration => "configuration",
        };
        f.write_str(text)
    }
}

/// Main error type for the object model
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The remote class has no such property or method. Never retried.
    #[error("Class '{class_name}' has no {kind} named '{member}'")]
    SchemaMismatch {
        kind: MemberKind,
        class_name: String,
        member: String,
    },

    #[error("Object '{target}' was not found on server '{server}'")]
    ObjectNotFound { server: String, target: String },

    /// `callback` is set when the failure surfaced while delivering an event
    #[error("Cannot connect to server '{server}': {issue}")]
    ConnectionIssue {
        server: String,
        issue: ConnectionIssue,
        callback: bool,
        message: String,
    },

    #[error("Call to server '{server}' failed: {reason}")]
    ServerCallFailed {
        server: String,
        reason: ServerCallReason,
        message: String,
    },

    #[error("The object was deleted on server '{server}'")]
    ServerObjectDeleted { server: String },

    #[error("{summary}")]
    OperationFailed {
        operation: Operation,
        error_code: i64,
        summary: String,
        description: Option<String>,
        canceled: bool,
    },

    #[error("{message}")]
    CancelTaskFailed { error_code: i64, message: String },

    /// Local cast or null fault on a returned value
    #[error("Invalid value for '{name}': expected {expected}, got {value}")]
    InvalidValue {
        name: String,
        value: String,
        expected: String,
    },

    #[error("Invalid object path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("No view is registered for class '{class_name}'{detail}")]
    UnmappedClass { class_name: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Session failure that was not tied to a server call
    #[error("Session error: {0}")]
    Session(SessionError),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    /// Classify a session failure against `server`.
    ///
    /// `callback` marks failures raised while delivering events.
    pub fn from_session(server: &str, err: SessionError, callback: bool) -> Error {
        let classified = match &err {
            SessionError::Transport { hresult, message } => {
                classify_hresult(server, *hresult, message, callback)
            }
            SessionError::Native {
                code,
                message,
                provider_code,
            } => classify_native(server, *code, message, *provider_code, callback),
            SessionError::Closed => Error::Session(err.clone()),
            SessionError::Other(message) => Error::ServerCallFailed {
                server: server.to_string(),
                reason: ServerCallReason::Unknown,
                message: message.clone(),
            },
        };

        let category = classified.category();
        let level = classified.log_level();
        if level == Level::DEBUG {
            tracing::debug!("Server '{}' reports object gone: {}", server, err);
        } else if level == Level::INFO {
            tracing::info!("Transient {} failure on '{}': {}", category, server, err);
        } else {
            tracing::error!("Classified failure on '{}' as {}: {}", server, category, err);
        }
        classified
    }

    /// Level a freshly classified failure is logged at
    pub(crate) fn log_level(&self) -> Level {
        if self.is_object_gone() {
            Level::DEBUG
        } else if self.is_transient() {
            Level::INFO
        } else {
            Level::ERROR
        }
    }

    pub fn schema_mismatch(
        kind: MemberKind,
        class_name: impl Into<String>,
        member: impl Into<String>,
    ) -> Error {
        Error::SchemaMismatch {
            kind,
            class_name: class_name.into(),
            member: member.into(),
        }
    }

    pub fn invalid_value(
        name: impl Into<String>,
        value: impl fmt::Debug,
        expected: impl Into<String>,
    ) -> Error {
        Error::InvalidValue {
            name: name.into(),
            value: format!("{:?}", value),
            expected: expected.into(),
        }
    }

    /// Build an `OperationFailed`, falling back to the mapper's text when the
    /// server supplied no summary
    pub fn operation_failed(
        operation: Operation,
        error_code: i64,
        summary: Option<String>,
        description: Option<String>,
        canceled: bool,
        mapper: &dyn ErrorCodeMapper,
    ) -> Error {
        let (summary, description) = match summary.filter(|s| !s.is_empty()) {
            Some(summary) => (summary, description),
            None => match description.filter(|d| !d.is_empty()) {
                Some(detail) => (detail, None),
                None => {
                    let fallback = format!("The operation '{}' failed.", operation);
                    (mapper.map_error(operation, error_code, &fallback), None)
                }
            },
        };
        Error::OperationFailed {
            operation,
            error_code,
            summary,
            description,
            canceled,
        }
    }

    pub fn cancel_task_failed(error_code: i64, mapper: &dyn ErrorCodeMapper) -> Error {
        Error::CancelTaskFailed {
            error_code,
            message: mapper.map_error(
                Operation::CancelTask,
                error_code,
                "The task could not be canceled.",
            ),
        }
    }

    /// Short, user-facing message
    pub fn summary(&self) -> String {
        self.to_string()
    }

    /// Longer detail when one exists
    pub fn description(&self) -> Option<String> {
        match self {
            Error::OperationFailed { description, .. } => description.clone(),
            Error::ConnectionIssue { message, .. } | Error::ServerCallFailed { message, .. } => {
                Some(message.clone()).filter(|m| !m.is_empty())
            }
            Error::Io(err) => Some(err.to_string()),
            _ => None,
        }
    }

    /// Domain error code (generic failure when none applies)
    pub fn error_code(&self) -> i64 {
        match self {
            Error::OperationFailed { error_code, .. } => *error_code,
            Error::CancelTaskFailed { error_code, .. } => *error_code,
            Error::ServerCallFailed {
                reason: ServerCallReason::NotSupported,
                ..
            } => codes::NOT_SUPPORTED,
            _ => codes::FAILED,
        }
    }

    /// Only transport-level unreachability is worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            Error::ConnectionIssue {
                issue: ConnectionIssue::RpcServerUnavailable,
                ..
            } => true,
            Error::ServerCallFailed {
                reason: ServerCallReason::RpcCallFailed,
                ..
            } => true,
            Error::Resilience(err) => err.is_transient(),
            _ => false,
        }
    }

    /// True when the remote object no longer exists
    pub fn is_object_gone(&self) -> bool {
        matches!(
            self,
            Error::ObjectNotFound { .. } | Error::ServerObjectDeleted { .. }
        )
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::SchemaMismatch { .. } => ErrorCategory::Schema,
            Error::ObjectNotFound { .. } | Error::ServerObjectDeleted { .. } => {
                ErrorCategory::NotFound
            }
            Error::ConnectionIssue { .. } => ErrorCategory::Connection,
            Error::ServerCallFailed { .. } | Error::Session(_) => ErrorCategory::ServerCall,
            Error::OperationFailed { .. } => ErrorCategory::Operation,
            Error::CancelTaskFailed { .. } => ErrorCategory::Cancellation,
            Error::InvalidValue { .. } | Error::InvalidPath(_) => ErrorCategory::LocalValue,
            Error::UnmappedClass { .. } | Error::Config(_) | Error::Io(_) => {
                ErrorCategory::Configuration
            }
            Error::Resilience(err) if err.is_transient() => ErrorCategory::Connection,
            Error::Resilience(_) => ErrorCategory::ServerCall,
        }
    }
}

fn connection_issue(server: &str, issue: ConnectionIssue, message: &str, callback: bool) -> Error {
    Error::ConnectionIssue {
        server: server.to_string(),
        issue,
        callback,
        message: message.to_string(),
    }
}

fn server_call(server: &str, reason: ServerCallReason, message: &str) -> Error {
    Error::ServerCallFailed {
        server: server.to_string(),
        reason,
        message: message.to_string(),
    }
}

fn classify_hresult(server: &str, code: u32, message: &str, callback: bool) -> Error {
    match code {
        hresult::RPC_S_SERVER_UNAVAILABLE => {
            connection_issue(server, ConnectionIssue::RpcServerUnavailable, message, callback)
        }
        hresult::RPC_E_CALL_CANCELED | hresult::RPC_S_CALL_FAILED => {
            server_call(server, ServerCallReason::RpcCallFailed, message)
        }
        hresult::WSMAN_CREDSSP_NOT_ENABLED => connection_issue(
            server,
            ConnectionIssue::CredSspNotEnabledOnClient,
            message,
            callback,
        ),
        hresult::WSMAN_CANNOT_DELEGATE => connection_issue(
            server,
            ConnectionIssue::ClientCannotDelegateCredentials,
            message,
            callback,
        ),
        hresult::E_ACCESSDENIED => {
            connection_issue(server, ConnectionIssue::AccessDenied, message, callback)
        }
        hresult::WAIT_TIMEOUT | hresult::ERROR_TIMEOUT => {
            server_call(server, ServerCallReason::TimedOut, message)
        }
        hresult::E_OUTOFMEMORY | hresult::ERROR_DISK_FULL => {
            server_call(server, ServerCallReason::OutOfMemoryOrDiskSpace, message)
        }
        _ => server_call(server, ServerCallReason::Unknown, message),
    }
}

fn classify_native(
    server: &str,
    code: NativeErrorCode,
    message: &str,
    provider_code: Option<u32>,
    callback: bool,
) -> Error {
    match code {
        NativeErrorCode::InvalidClass => {
            connection_issue(server, ConnectionIssue::InvalidClass, message, callback)
        }
        NativeErrorCode::InvalidNamespace => {
            connection_issue(server, ConnectionIssue::InvalidNamespace, message, callback)
        }
        NativeErrorCode::AccessDenied => {
            connection_issue(server, ConnectionIssue::AccessDenied, message, callback)
        }
        NativeErrorCode::NotFound => Error::ServerObjectDeleted {
            server: server.to_string(),
        },
        NativeErrorCode::NotSupported => {
            server_call(server, ServerCallReason::NotSupported, message)
        }
        NativeErrorCode::Failed if provider_code.is_some() => {
            server_call(server, ServerCallReason::UnknownProviderError, message)
        }
        _ => server_call(server, ServerCallReason::Unknown, message),
    }
}

/// Turns an operation's error code into a message
///
/// Implementations may special-case codes for one operation and defer to
/// [`DefaultErrorCodeMapper`] for the rest.
pub trait ErrorCodeMapper: Send + Sync {
    fn map_error(&self, operation: Operation, error_code: i64, operation_failed_msg: &str)
        -> String;
}

/// Knows the standard job return codes
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorCodeMapper;

impl DefaultErrorCodeMapper {
    pub fn describe(error_code: i64) -> Option<&'static str> {
        let text = match error_code {
            codes::FAILED => "The operation failed.",
            codes::ACCESS_DENIED => "Access was denied.",
            codes::NOT_SUPPORTED => "The operation is not supported.",
            codes::STATUS_UNKNOWN => "The status of the operation is unknown.",
            codes::TIMEOUT => "The operation timed out.",
            codes::INVALID_PARAMETER => "A parameter was invalid.",
            codes::SYSTEM_IN_USE => "The system is in use.",
            codes::INVALID_STATE => "The object is in an invalid state for this operation.",
            codes::INCORRECT_DATA_TYPE => "A value had an incorrect data type.",
            codes::NOT_AVAILABLE => "The system is not available.",
            codes::OUT_OF_MEMORY => "The server is out of memory.",
            codes::CLIENT_DISCONNECTED => "The connection to the server was lost.",
            codes::CLIENT_AFFECTED_ELEMENT_MISSING => {
                "The object affected by the operation could not be found."
            }
            codes::CLIENT_DELETED => "The job was deleted before it completed.",
            codes::CLIENT_NETWORK_TIMEOUT => {
                "The server was unreachable for too long while waiting for the job."
            }
            _ => return None,
        };
        Some(text)
    }

    /// Join the operation message and a detail line
    pub fn concatenate(operation_failed_msg: &str, detail: &str) -> String {
        if operation_failed_msg.is_empty() {
            detail.to_string()
        } else {
            format!("{} {}", operation_failed_msg, detail)
        }
    }
}

impl ErrorCodeMapper for DefaultErrorCodeMapper {
    fn map_error(
        &self,
        _operation: Operation,
        error_code: i64,
        operation_failed_msg: &str,
    ) -> String {
        match Self::describe(error_code) {
            Some(detail) => Self::concatenate(operation_failed_msg, detail),
            None => operation_failed_msg.to_string(),
        }
    }
}

/// Used when the server already provided a localized message
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerMessageMapper;

impl ErrorCodeMapper for ServerMessageMapper {
    fn map_error(&self, _operation: Operation, _error_code: i64, message: &str) -> String {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_unavailable_is_transient_connection_issue() {
        let err = Error::from_session(
            "HOST01",
            SessionError::transport(hresult::RPC_S_SERVER_UNAVAILABLE, "unavailable"),
            false,
        );
        assert!(matches!(
            err,
            Error::ConnectionIssue {
                issue: ConnectionIssue::RpcServerUnavailable,
                callback: false,
                ..
            }
        ));
        assert!(err.is_transient());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }

    #[test]
    fn test_rpc_call_failures_are_transient() {
        for code in [hresult::RPC_E_CALL_CANCELED, hresult::RPC_S_CALL_FAILED] {
            let err = Error::from_session("h", SessionError::transport(code, "x"), false);
            assert!(matches!(
                err,
                Error::ServerCallFailed {
                    reason: ServerCallReason::RpcCallFailed,
                    ..
                }
            ));
            assert!(err.is_transient());
        }
    }

    #[test]
    fn test_routine_failures_log_below_error() {
        let unavailable = Error::from_session(
            "h",
            SessionError::transport(hresult::RPC_S_SERVER_UNAVAILABLE, "x"),
            false,
        );
        let cancelled = Error::from_session(
            "h",
            SessionError::transport(hresult::RPC_E_CALL_CANCELED, "x"),
            false,
        );
        let gone = Error::from_session(
            "h",
            SessionError::native(NativeErrorCode::NotFound, "x"),
            false,
        );
        let denied = Error::from_session(
            "h",
            SessionError::native(NativeErrorCode::AccessDenied, "x"),
            false,
        );

        assert_eq!(unavailable.log_level(), Level::INFO);
        assert_eq!(cancelled.log_level(), Level::INFO);
        assert_eq!(gone.log_level(), Level::DEBUG);
        assert_eq!(denied.log_level(), Level::ERROR);
    }

    #[test]
    fn test_credential_hresults() {
        let err = Error::from_session(
            "h",
            SessionError::transport(hresult::WSMAN_CREDSSP_NOT_ENABLED, "x"),
            true,
        );
        assert!(matches!(
            err,
            Error::ConnectionIssue {
                issue: ConnectionIssue::CredSspNotEnabledOnClient,
                callback: true,
                ..
            }
        ));

        let err = Error::from_session(
            "h",
            SessionError::transport(hresult::WSMAN_CANNOT_DELEGATE, "x"),
            false,
        );
        assert!(matches!(
            err,
            Error::ConnectionIssue {
                issue: ConnectionIssue::ClientCannotDelegateCredentials,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_timeouts_and_resource_exhaustion() {
        let err =
            Error::from_session("h", SessionError::transport(hresult::WAIT_TIMEOUT, ""), false);
        assert!(matches!(
            err,
            Error::ServerCallFailed {
                reason: ServerCallReason::TimedOut,
                ..
            }
        ));
        let err = Error::from_session(
            "h",
            SessionError::transport(hresult::ERROR_DISK_FULL, ""),
            false,
        );
        assert!(matches!(
            err,
            Error::ServerCallFailed {
                reason: ServerCallReason::OutOfMemoryOrDiskSpace,
                ..
            }
        ));
    }

    #[test]
    fn test_native_codes() {
        let deleted = Error::from_session("h", SessionError::not_found("gone"), false);
        assert!(matches!(deleted, Error::ServerObjectDeleted { ref server } if server == "h"));
        assert!(deleted.is_object_gone());

        let denied = Error::from_session(
            "h",
            SessionError::native(NativeErrorCode::AccessDenied, "no"),
            false,
        );
        assert!(matches!(
            denied,
            Error::ConnectionIssue {
                issue: ConnectionIssue::AccessDenied,
                ..
            }
        ));

        let unsupported = Error::from_session(
            "h",
            SessionError::native(NativeErrorCode::NotSupported, "no"),
            false,
        );
        assert_eq!(unsupported.error_code(), codes::NOT_SUPPORTED);

        let provider = Error::from_session("h", SessionError::provider(0x8004_1001, "boom"), false);
        assert!(matches!(
            provider,
            Error::ServerCallFailed {
                reason: ServerCallReason::UnknownProviderError,
                ..
            }
        ));

        let other = Error::from_session(
            "h",
            SessionError::native(NativeErrorCode::InvalidQuery, "bad"),
            false,
        );
        assert!(matches!(
            other,
            Error::ServerCallFailed {
                reason: ServerCallReason::Unknown,
                ..
            }
        ));
        assert_eq!(other.error_code(), codes::FAILED);
    }

    #[test]
    fn test_closed_session_is_unclassified() {
        let err = Error::from_session("h", SessionError::Closed, false);
        assert!(matches!(err, Error::Session(SessionError::Closed)));
    }

    #[test]
    fn test_operation_failed_prefers_server_text() {
        let mapper = DefaultErrorCodeMapper;
        let err = Error::operation_failed(
            Operation::RunJob,
            32775,
            Some("The VM is running.".into()),
            Some("detail".into()),
            false,
            &mapper,
        );
        assert_eq!(err.summary(), "The VM is running.");
        assert_eq!(err.description().as_deref(), Some("detail"));
        assert_eq!(err.error_code(), 32775);

        // description promoted when summary is missing
        let err = Error::operation_failed(
            Operation::RunJob,
            32775,
            None,
            Some("only detail".into()),
            false,
            &mapper,
        );
        assert_eq!(err.summary(), "only detail");
        assert!(err.description().is_none());
    }

    #[test]
    fn test_operation_failed_falls_back_to_mapper() {
        let err = Error::operation_failed(
            Operation::InvokeMethod,
            codes::ACCESS_DENIED,
            None,
            None,
            false,
            &DefaultErrorCodeMapper,
        );
        assert_eq!(
            err.summary(),
            "The operation 'invoke method' failed. Access was denied."
        );
    }

    #[test]
    fn test_cancel_task_failed_message() {
        let err = Error::cancel_task_failed(codes::INVALID_STATE, &DefaultErrorCodeMapper);
        assert_eq!(err.error_code(), codes::INVALID_STATE);
        assert_eq!(err.category(), ErrorCategory::Cancellation);
        assert!(err.summary().contains("invalid state"));

        let err = Error::cancel_task_failed(12345, &ServerMessageMapper);
        assert_eq!(err.summary(), "The task could not be canceled.");
    }

    #[test]
    fn test_schema_mismatch_not_transient() {
        let err = Error::schema_mismatch(MemberKind::Method, "Msvm_ConcreteJob", "Frobnicate");
        assert_eq!(
            err.summary(),
            "Class 'Msvm_ConcreteJob' has no method named 'Frobnicate'"
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_resilience_errors_keep_transience() {
        let err: Error = ResilienceError::Transient("down".into()).into();
        assert!(err.is_transient());
        let err: Error = ResilienceError::PoolExhausted(2).into();
        assert!(!err.is_transient());
    }
}
