//! poolfs Store - Object store interface
//!
//! The namespace engine never touches storage directly. Everything it
//! persists goes through the [`ObjectStore`] trait: point I/O on named
//! objects, per-object attributes and key/value maps, an exclusive lease
//! lock and pool capacity queries.
//!
//! [`MemoryStore`] is an in-process implementation with per-pool fault
//! injection, used by tests and by the benchmark driver.

pub mod memory;
pub mod object;

pub use memory::MemoryStore;
pub use object::{ObjectStat, ObjectStore, PoolUsage};
