//! # Conflux Testkit
//!
//! Test utilities for the Conflux sync engine.
//!
//! This crate provides:
//! - In-memory members with shared, inspectable record sets
//! - Failure-injecting and unresponsive members
//! - A recording event sink with wait helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conflux_testkit::prelude::*;
//!
//! #[test]
//! fn two_members_converge() {
//!     let (member, records) = MemoryMember::new();
//!     // ... register in a Group and synchronize
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
