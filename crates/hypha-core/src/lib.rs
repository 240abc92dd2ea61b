//! Core types for the Hypha function runtime.
//!
//! This crate holds everything the other workspace members agree on: the
//! structured [`Event`](event::Event) envelope that functions consume and
//! produce, the shared error vocabulary, and the runtime configuration.

pub mod config;
pub mod error;
pub mod event;

pub use config::RuntimeConfig;
pub use error::{CoreError, Result};
pub use event::{Event, EventBuilder, EventData, ExtensionValue};
