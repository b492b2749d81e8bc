//! Session plumbing shared by the object model
//!
//! The transport itself is behind [`Session`]; this module only adds the
//! in-memory implementation used by tests and demos.

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use virtmgmt_core_interface::{
    Credential, EventKind, EventStream, InstanceEvent, QueryDialect, Session, SessionConnector,
    SessionError,
};
