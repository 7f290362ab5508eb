//! `posefuse-middleware` – sensor and pose transport.
//!
//! Routes events between sensor drivers, the fusion engine and downstream
//! consumers without caring about the data's meaning.
//!
//! # Modules
//!
//! - [`bus`] – Named-topic publish/subscribe event bus built on Tokio
//!   broadcast channels, with drop-oldest semantics for slow subscribers.

pub mod bus;

pub use bus::{DEFAULT_CAPACITY, EventBus, TopicReceiver, topics};
