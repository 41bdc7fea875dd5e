//! # berth-common
//!
//! Shared utilities and types for the Berth network control plane.
//!
//! This crate provides common functionality used across all Berth crates:
//! - Network and endpoint ID generation
//! - Random human-readable network names
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod names;
pub mod paths;

pub use error::{BerthError, BerthResult, ErrorKind};
pub use id::{generate_id, short_id};
pub use names::random_name;
pub use paths::BerthPaths;
