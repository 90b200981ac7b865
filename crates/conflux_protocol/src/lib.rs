//! # Conflux Protocol
//!
//! Shared data types for the Conflux multi-way sync engine.
//!
//! This crate provides:
//! - Change records as reported by members ([`Change`], [`ChangeKind`])
//! - Comparison outcomes used for correlation and conflict detection
//!   ([`Cmp`])
//! - Status events surfaced to host applications ([`MemberStatus`],
//!   [`ChangeStatus`], [`MappingStatus`], [`EngineStatus`])
//! - Member identity ([`MemberId`])
//!
//! No I/O and no threads live here; the engine crate consumes these types
//! on its own actors.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod status;

pub use change::{Change, ChangeKind, Cmp, MemberId};
pub use status::{ChangeStatus, EngineStatus, MappingStatus, MemberStatus};
