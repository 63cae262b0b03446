//! Live query subscriptions for Nymph.
//!
//! A [`Publisher`] sits next to a [`nymph_store::Nymph`] context. Subscribers
//! connect, send [`ClientMessage`]s, and receive [`ServerMessage`]s on the
//! channel returned by [`Publisher::connect`]. Store events (from
//! [`Publisher::spawn`] or fed by hand through
//! [`Publisher::handle_store_event`]) keep every tracked query's cached
//! result in step with the store.

mod error;
mod protocol;
mod publisher;
mod registry;

pub use error::{PubSubError, PubSubResult};
pub use protocol::{
    ClientMessage, ConnectionId, Publication, PublishEvent, ServerMessage, Subscription,
};
pub use publisher::Publisher;
pub use registry::QueryKey;
