//! poolfs Common - Shared types and utilities
//!
//! This crate provides the path and identifier types, the error taxonomy
//! and the configuration surface shared by every poolfs component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Config, NamespaceConfig, PoolConfig};
pub use error::{Error, Result};
pub use types::*;
