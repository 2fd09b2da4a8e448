//! Event bus for execution observers.
//!
//! Provides an `EventBus` that distributes `JobEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
