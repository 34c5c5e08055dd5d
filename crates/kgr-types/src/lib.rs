//! Core types for the KGR messaging core.
//!
//! This crate defines the data shared by pipes, servers, the security layer
//! and the network transport. It contains no business logic.

pub mod config;
pub mod error;
pub mod path;
pub mod restriction;
pub mod value;

pub use error::{ErrorKind, KgrError, KgrResult};
pub use path::KgrPath;
pub use restriction::RestrictionPolicy;
pub use value::KgrValue;
