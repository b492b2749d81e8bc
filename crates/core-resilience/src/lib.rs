//! virtmgmt Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! Building blocks the object model uses to survive an unreliable management
//! endpoint:
//!
//! - **Reference counting**: first/last transitions for shared subscriptions
//! - **Connection pool**: one shared connection per key, explicit teardown
//! - **Outage tracker**: tolerate continuous unreachability up to a ceiling
//!
//! # Key Principles
//!
//! This crate has zero knowledge of the management protocol, sessions or
//! object identity. It provides generic patterns usable at any layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Object model                    │
//! └──────┬──────────────┬──────────────┬────┘
//!        │              │              │
//!        ▼              ▼              ▼
//!   RefCountMap    ConnectionPool   OutageTracker
//!   (subscribe     (server per      (network job
//!    once)          name+cred)       poller)
//! ```

pub mod connection_pool;
pub mod error;
pub mod outage;
pub mod ref_count;

// Re-export main types for convenience
pub use connection_pool::{ConnectionFactory, ConnectionPool, PoolConfig};
pub use error::ResilienceError;
pub use outage::{OutageConfig, OutageState, OutageTracker, Verdict};
pub use ref_count::{RefCountMap, Transition};
