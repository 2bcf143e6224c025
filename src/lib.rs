//! SOE protocol v3: a reliable, ordered, session-oriented transport layered
//! over UDP. See `protocol` for the wire codec and per-session state
//! machine, `socket` for the address-demultiplexing socket owner, and
//! `config`/`logging` for the ambient stack around them.

pub mod config;
pub mod logging;
pub mod protocol;
pub mod socket;

pub use config::{load_server_options, ConfigError, ServerOptions};
pub use protocol::app::{ApplicationProtocol, EchoApplication, SessionHandle, SessionParameters};
pub use protocol::{DisconnectReason, Packet, ProtocolHandler, SessionState};
pub use socket::SocketHandler;
