//! The host/plugin wire contract.
//!
//! On startup the plugin prints a single handshake line on stdout:
//!
//! ```text
//! 1|hypha-function|<cookie>|unix|/tmp/hypha-plugin-1234.sock|jsonrpc
//! ```
//!
//! The fields are the protocol major version, the application identifier,
//! an echo of the cookie the host passed through the environment, the
//! transport kind, the transport address, and the RPC protocol identifier.
//! The version is the only compatibility boundary: a mismatch terminates
//! the load instead of proceeding into undefined behavior.
//!
//! After the handshake the host dials the address and exchanges
//! 4-byte big-endian length-prefixed JSON frames: [`ExecuteRequest`] in,
//! [`ExecuteResponse`] out, multiplexed by `id` so one connection carries
//! concurrent calls.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use hypha_core::Event;

/// Protocol major version spoken by this SDK.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application identifier; rejects handshakes from unrelated plugin systems.
pub const APP_PROTOCOL: &str = "hypha-function";

/// Environment variable the host uses to pass the cookie.
pub const COOKIE_ENV: &str = "HYPHA_PLUGIN_COOKIE";

/// Cookie value known to both sides. This is not a security boundary; it
/// keeps arbitrary executables from being mistaken for plugins.
pub const COOKIE_VALUE: &str = "9f2c6c0e4a5d4d38b6a1d78c3e0b5a17";

/// Environment variable naming the directory the plugin should bind its
/// socket in. Falls back to the OS temp directory.
pub const SOCKET_DIR_ENV: &str = "HYPHA_PLUGIN_SOCKET_DIR";

/// Transport identifier for unix domain sockets, the only supported kind.
pub const TRANSPORT_UNIX: &str = "unix";

/// RPC protocol identifier for the framed JSON protocol.
pub const RPC_PROTOCOL: &str = "jsonrpc";

/// Upper bound on one framed message.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Handshake parse failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed handshake line: expected 6 fields, got {0}")]
    Malformed(usize),

    #[error("handshake protocol version is not a number: {0}")]
    BadVersion(String),

    #[error("unsupported handshake protocol version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("handshake is not from a hypha function plugin (app '{0}')")]
    WrongApplication(String),

    #[error("handshake cookie mismatch")]
    CookieMismatch,

    #[error("unsupported transport '{0}'")]
    UnsupportedTransport(String),

    #[error("unsupported rpc protocol '{0}'")]
    UnsupportedProtocol(String),
}

/// Parsed handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u32,
    pub cookie: String,
    pub transport: String,
    pub address: String,
    pub protocol: String,
}

impl Handshake {
    /// The line a plugin emits for its socket `address`.
    pub fn for_address(address: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            cookie: COOKIE_VALUE.to_string(),
            transport: TRANSPORT_UNIX.to_string(),
            address: address.into(),
            protocol: RPC_PROTOCOL.to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.version, APP_PROTOCOL, self.cookie, self.transport, self.address, self.protocol
        )
    }

    /// Parse and validate a handshake line against this side's expectations.
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let fields: Vec<&str> = line.trim_end().split('|').collect();
        if fields.len() != 6 {
            return Err(HandshakeError::Malformed(fields.len()));
        }
        let version: u32 = fields[0]
            .parse()
            .map_err(|_| HandshakeError::BadVersion(fields[0].to_string()))?;
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                found: version,
                expected: PROTOCOL_VERSION,
            });
        }
        if fields[1] != APP_PROTOCOL {
            return Err(HandshakeError::WrongApplication(fields[1].to_string()));
        }
        if fields[2] != COOKIE_VALUE {
            return Err(HandshakeError::CookieMismatch);
        }
        if fields[3] != TRANSPORT_UNIX {
            return Err(HandshakeError::UnsupportedTransport(fields[3].to_string()));
        }
        if fields[5] != RPC_PROTOCOL {
            return Err(HandshakeError::UnsupportedProtocol(fields[5].to_string()));
        }
        Ok(Self {
            version,
            cookie: fields[2].to_string(),
            transport: fields[3].to_string(),
            address: fields[4].to_string(),
            protocol: fields[5].to_string(),
        })
    }
}

/// One `execute` call from host to plugin.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub id: u64,
    pub event: Event,
}

/// The plugin's answer. `error` set means the call failed; `events` carries
/// the derived events otherwise (possibly empty).
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub id: u64,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Write one length-prefixed JSON message.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message of {} bytes exceeds frame limit", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one length-prefixed JSON message; `None` on clean EOF.
pub async fn read_message<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("oversized frame: {} bytes", len),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}
