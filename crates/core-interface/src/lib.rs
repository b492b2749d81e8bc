//! virtmgmt Core Interface: Session abstraction and object identity
//!
//! This crate defines the [`Session`] trait, the opaque boundary between the
//! object model and whatever transport talks to the remote management
//! service, together with the value types that cross it.
//!
//! # Architecture
//!
//! 1. **Identity**: [`ObjectPath`] addresses an instance or a class
//! 2. **Values**: [`Value`], [`Instance`] snapshots and [`ClassSchema`] descriptors
//! 3. **Session**: get, enumerate, query, invoke, modify and subscribe
//!
//! # Example
//!
//! ```rust,no_run
//! use virtmgmt_core_interface::{ObjectPath, Session};
//!
//! async fn show_name<S: Session>(session: &S) -> virtmgmt_core_interface::Result<()> {
//!     let text = "\\\\host\\root\\virtualization\\v2:Msvm_ComputerSystem.Name=\"host\"";
//!     let path: ObjectPath = text
//!         .parse()
//!         .map_err(|e| virtmgmt_core_interface::SessionError::Other(format!("{e}")))?;
//!     let instance = session.get_instance(&path).await?;
//!     println!("{:?}", instance.get("ElementName"));
//!     Ok(())
//! }
//! ```

pub mod path;
pub mod session;
pub mod value;

pub use path::{eq_fold, KeyValue, ObjectPath, PathError, LOCAL_SERVER};
pub use session::{
    hresult, Credential, EventKind, EventStream, InstanceEvent, NativeErrorCode, QueryDialect,
    Result, Session, SessionConnector, SessionError,
};
pub use value::{ClassSchema, Instance, MethodOutput, Property, PropertyDecl, Value, ValueKind};
