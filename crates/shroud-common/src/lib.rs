//! # shroud-common
//!
//! Shared types for the shroud network driver.
//!
//! This crate provides functionality used by both the driver core and
//! the plugin daemon:
//! - Network and endpoint IDs
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{ErrorKind, ShroudError, ShroudResult};
pub use id::{EndpointId, NetworkId};
pub use paths::ShroudPaths;
