//! Entity store for Nymph.
//!
//! # Architecture
//!
//! - [`Driver`] is the backend seam: [`SqliteDriver`] runs compiled SQL,
//!   [`MemoryDriver`] scans and filters with the in-memory matcher
//! - [`Nymph`] is the context handle: reads, saves with optimistic
//!   concurrency, deletes, named transactions and reference resolution
//! - Every successful write and transaction boundary is published as a
//!   [`StoreEvent`] on the channels returned by [`Nymph::events`]

mod config;
mod driver;
mod error;
mod events;
mod memory;
mod nymph;
mod sqlite;

pub use config::{SqliteConfig, MEMORY_FILENAME, PLACEHOLDER_FILENAME};
pub use driver::{Driver, QueryOutput};
pub use error::{StoreError, StoreResult};
pub use events::{InstanceId, Mutation, MutationKind, StoreEvent};
pub use memory::MemoryDriver;
pub use nymph::Nymph;
pub use sqlite::SqliteDriver;
