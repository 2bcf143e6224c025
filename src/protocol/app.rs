//! Application callback surface (spec §6). Grounded on the teacher's
//! `GameServer`/`ChannelManager` split: `ChannelManager` owns channels and
//! dispatches into application logic, while the application itself stays
//! polymorphic. Here that split becomes [`ProtocolHandler`] (owning the
//! reliable channels) calling into an injected [`ApplicationProtocol`].

use crate::protocol::handler::{ConnectionMode, SessionState};
use crate::protocol::packet::{DisconnectReason, SessionId};
use std::net::SocketAddr;

/// Negotiated parameters an application wants for a session it accepts.
/// Returned from [`ApplicationProtocol::session_params`] in response to a
/// `SessionRequest`.
#[derive(Clone, Debug)]
pub struct SessionParameters {
    pub crc_length: u8,
    pub is_compression_enabled: bool,
    pub udp_length: u32,
    pub encryption_key: Option<Vec<u8>>,
    /// Whether encryption should be turned on as soon as the session opens.
    /// Invalid (and ignored) without `encryption_key` also set (spec §3/§6).
    pub is_encryption_enabled: bool,
}

/// A handle the application uses to talk back to one session: queue
/// outgoing application buffers, request termination, or inspect the
/// session's current lifecycle state (spec §6).
pub struct SessionHandle<'a> {
    pub(crate) session_id: SessionId,
    pub(crate) remote_addr: SocketAddr,
    pub(crate) mode: ConnectionMode,
    pub(crate) state: SessionState,
    pub(crate) terminated_by_remote: bool,
    pub(crate) outgoing: &'a mut Vec<Vec<u8>>,
    pub(crate) disconnect_requested: &'a mut Option<DisconnectReason>,
}

impl<'a> SessionHandle<'a> {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The reason the session terminated, if it has.
    pub fn termination_reason(&self) -> Option<DisconnectReason> {
        match self.state {
            SessionState::Terminated { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Whether termination (if any) was initiated by the remote peer's own
    /// `Disconnect` rather than by this side (spec §4.6).
    pub fn terminated_by_remote(&self) -> bool {
        self.terminated_by_remote
    }

    /// Queues an application buffer for reliable, ordered delivery.
    pub fn enqueue_data(&mut self, data: Vec<u8>) -> bool {
        self.outgoing.push(data);
        true
    }

    /// Requests that the session be torn down with the given reason.
    pub fn terminate_session(&mut self, reason: DisconnectReason) {
        *self.disconnect_requested = Some(reason);
    }
}

/// The trait an embedding binary implements to react to session lifecycle
/// events and delivered application data. One instance is constructed per
/// accepted session (mirrors the teacher's per-channel game logic).
pub trait ApplicationProtocol: Send {
    /// Negotiated parameters this application wants for new sessions.
    fn session_params(&self) -> SessionParameters;

    /// Called once a session finishes negotiation and enters `Running`.
    fn on_session_opened(&mut self, handle: &mut SessionHandle) {
        let _ = handle;
    }

    /// Called once per fully reassembled, demuxed application buffer.
    fn handle_app_data(&mut self, handle: &mut SessionHandle, data: &[u8]);

    /// Called once a session is torn down, for any reason.
    fn on_session_closed(&mut self, handle: &mut SessionHandle, reason: DisconnectReason) {
        let _ = (handle, reason);
    }
}

/// A trivial echo application: returns every delivered buffer to its sender
/// unchanged. Used by the binary entry point and by integration tests,
/// mirroring the teacher's dependency-injection sample apps referenced in
/// spec's own Non-goals.
pub struct EchoApplication {
    params: SessionParameters,
}

impl EchoApplication {
    pub fn new(params: SessionParameters) -> Self {
        EchoApplication { params }
    }
}

impl ApplicationProtocol for EchoApplication {
    fn session_params(&self) -> SessionParameters {
        self.params.clone()
    }

    fn handle_app_data(&mut self, handle: &mut SessionHandle, data: &[u8]) {
        handle.enqueue_data(data.to_vec());
    }
}
