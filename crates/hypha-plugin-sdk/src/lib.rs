//! SDK for Hypha function plugins.
//!
//! A plugin is an ordinary executable. Its `main` constructs a type
//! implementing [`Function`] and hands it to [`serve`], which performs the
//! host handshake on stdout, binds a local socket, and answers `execute`
//! calls until the host terminates the process:
//!
//! ```rust,ignore
//! use hypha_plugin_sdk::{serve, Function};
//! use hypha_core::Event;
//!
//! struct Uppercase;
//!
//! #[async_trait::async_trait]
//! impl Function for Uppercase {
//!     async fn execute(&self, event: Event) -> anyhow::Result<Vec<Event>> {
//!         // derive and return events
//!         Ok(vec![event])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     serve(Uppercase).await
//! }
//! ```
//!
//! The [`protocol`] module is shared with the host side and defines the
//! handshake line and the framed JSON call protocol.

pub mod protocol;
mod serve;

pub use serve::{serve, Function};
