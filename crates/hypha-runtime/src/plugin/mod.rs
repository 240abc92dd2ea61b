//! Plugin hosting: subprocess lifecycle and the in-process handle.
//!
//! The host writes a function binary to a scratch directory, spawns it,
//! validates the stdout handshake (protocol version, cookie echo,
//! transport endpoint), dials the plugin's unix socket, and exposes the
//! framed `execute` call. See `hypha-plugin-sdk::protocol` for the wire
//! contract.

mod handle;
mod host;
mod rpc;

pub use handle::PluginHandle;
pub use host::{PluginHost, PluginHostConfig};
