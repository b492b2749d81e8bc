//! Per-proxy caches
//!
//! Both caches hold immutable snapshots behind `RwLock<Arc<_>>`. Writers
//! build a new snapshot and swap it in whole, so a reader holding an `Arc`
//! never sees a half-applied refresh.

pub mod association;
pub mod property;

pub use association::{
    associations, Association, AssociationCache, AssociationEntry, AssociationKind,
};
pub use property::{CacheState, PropertyCache, PropertySnapshot, PSEUDO_PROPERTIES};
