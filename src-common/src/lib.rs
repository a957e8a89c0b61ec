//! Livecap Common Library
//!
//! Shared types and log-path resolution used by the livecap recorder
//! service and its tooling.

pub mod logging;
pub mod types;

pub use types::*;
