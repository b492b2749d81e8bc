/*!
 * virtmgmt - client-side object model for remote virtualization management
 *
 * Layers, bottom up:
 * - Object identity, values and the `Session` seam (virtmgmt-core-interface)
 * - Caching proxies with property and association caches
 * - Event multiplexing: per-instance subscriptions and class-wide bulk monitors
 * - Typed views resolved from class names and properties
 * - Job tracking that survives missed events, deletion and network outages
 *
 * Version: 0.1.0
 */

pub mod cache;
pub mod config;
pub mod context;
pub mod datetime;
pub mod embedded;
pub mod error;
pub mod events;
pub mod job;
pub mod keys;
pub mod locator;
pub mod locks;
pub mod logging;
pub mod proxy;
pub mod query;
pub mod repository;
pub mod server;
pub mod session;
pub mod view;

// Re-export commonly used types
pub use config::ModelConfig;
pub use context::ServerContext;
pub use error::{Error, Result};
pub use job::{CompletedTask, NetworkTaskWait, Task, TaskStatus, VmTask};
pub use locator::ObjectLocator;
pub use proxy::Proxy;
pub use server::{Server, ServerPool};
pub use view::{View, ViewFactory, ViewKind};
pub use virtmgmt_core_interface::{Instance, ObjectPath, Value};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
