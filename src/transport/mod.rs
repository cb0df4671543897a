//! Transport abstraction layer.
//!
//! Provides the [`ComModule`] trait for the pluggable transports the core
//! routes over ("com modules"), plus the event type modules feed into the
//! core's single event loop. A module owns its connections: it accepts or
//! dials them, pushes received byte chunks upward as [`ComEvent`]s, and
//! writes outbound bytes on demand. Framing and protocol live above this
//! layer.

pub mod tcp;
pub mod unix;

pub use tcp::TcpModule;
pub use unix::UnixModule;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Connection handle, unique within one module.
pub type ConnId = u64;

/// Default buffer size for transport reads (64 KB).
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Capacity of the core's transport-event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An event pushed by a transport module into the core's event loop.
#[derive(Debug, Clone)]
pub enum ComEvent {
    /// A peer connected to one of the module's listeners.
    Connected { module: String, conn: ConnId },
    /// Bytes arrived on a connection.
    Data {
        module: String,
        conn: ConnId,
        bytes: Bytes,
    },
    /// A connection closed (either side).
    Disconnected { module: String, conn: ConnId },
}

/// A pluggable transport ("com module").
///
/// Modules use `&self` with interior mutability so the core can hold them
/// behind `Arc` while its event loop and background tasks run. Outbound
/// connections are returned directly from [`connect`](Self::connect);
/// only inbound accepts surface as [`ComEvent::Connected`].
#[async_trait::async_trait]
pub trait ComModule: Send + Sync {
    /// Module name used in addresses, mappings, and logs.
    fn name(&self) -> &str;

    /// Whether the remote side is another core.
    ///
    /// Bridge transports run the HELLO/AUTH handshake; non-bridge
    /// transports speak to the outside world directly and skip it.
    fn is_bridge(&self) -> bool;

    /// Dials a remote address and returns the new connection handle.
    async fn connect(&self, address: &str) -> Result<ConnId>;

    /// Writes bytes on an open connection.
    async fn send(&self, conn: ConnId, bytes: &[u8]) -> Result<()>;

    /// Closes a connection.
    async fn close(&self, conn: ConnId) -> Result<()>;

    /// Starts accepting inbound connections on an address.
    ///
    /// Returns the bound address (useful when the caller asked for an
    /// ephemeral port).
    async fn listen(&self, address: &str) -> Result<String>;

    /// Stops all connections and listeners.
    async fn shutdown(&self);
}

/// Maps a "connection not found" into the shared transport error.
pub(crate) fn unknown_conn(module: &str, conn: ConnId) -> Error {
    Error::Transport(format!("{module}: unknown connection {conn}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_conn_names_the_module() {
        let err = unknown_conn("tcp", 7);
        assert!(err.to_string().contains("tcp"));
        assert!(err.to_string().contains('7'));
    }
}
