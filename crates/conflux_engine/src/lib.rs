//! # Conflux Engine
//!
//! A multi-way synchronization engine. A [`Group`] of [`Member`]s each
//! report changed records; the engine correlates them into mappings,
//! detects conflicts, and propagates winning values back to every member.
//!
//! Concurrency model: one actor thread per member plus one engine thread.
//! Actors share nothing; all coordination happens through per-actor
//! message queues and the engine's reactive flag graph. Host applications
//! talk to the running engine only through the [`Engine`] handle and the
//! [`EventSink`] callbacks.
//!
//! ```no_run
//! use conflux_engine::{Engine, EngineConfig, Group};
//! # fn member_a() -> Box<dyn conflux_engine::Member> { unimplemented!() }
//! # fn member_b() -> Box<dyn conflux_engine::Member> { unimplemented!() }
//! # fn main() -> conflux_engine::EngineResult<()> {
//! let mut group = Group::new();
//! group.add_member("a", member_a());
//! group.add_member("b", member_b());
//!
//! let engine = Engine::new(group, EngineConfig::new())?;
//! engine.synchronize_and_block()?;
//! engine.finalize()
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod compare;
mod config;
mod decider;
mod engine;
mod error;
pub mod flag;
mod mapping;
mod member;
mod msg;
mod observer;
pub mod queue;
mod store;

pub use compare::{ChangeFormat, EqualityFormat};
pub use config::{EngineConfig, ErrorPolicy};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use mapping::{EntryId, MappingId};
pub use member::{ChangeSink, Group, Member, MemberHandle, MemberSlot};
pub use observer::{ConflictEntry, ConflictSnapshot, EventSink, NullSink};
pub use store::{MappingLink, MappingStore, MemoryMappingStore, StoreSnapshot};
