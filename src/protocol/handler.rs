//! `ProtocolHandler` (spec §4.6): per-session `Negotiating` → `Running` →
//! `Terminated` state machine, contextual/contextless dispatch, heartbeat,
//! inactivity timeout. Grounded on `Channel::process_packet`/
//! `process_session_request` in both of the teacher's `Channel` revisions,
//! restructured around an explicit state enum (the teacher only tracks a
//! `connected: bool` flag plus an `Option<Session>`).

use crate::logging::{current_session_addr, current_session_id};
use crate::protocol::app::{ApplicationProtocol, SessionHandle};
use crate::protocol::cipher::Rc4KeyState;
use crate::protocol::crc::CrcSeed;
use crate::protocol::deserialize::{deserialize_packet, CodecParams, DeserializeError};
use crate::protocol::packet::{BufferSize, DisconnectReason, Packet, SessionId, SOE_PROTOCOL_VERSION};
use crate::protocol::reliable::input::{InputChannelParams, ReliableDataInputChannel};
use crate::protocol::reliable::output::{OutputChannelParams, ReliableDataOutputChannel};
use crate::protocol::reliable::ApplicationParameters;
use crate::protocol::serialize::{serialize_packets, SerializeParams};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Negotiating,
    Running,
    Terminated { reason: DisconnectReason, by_remote: bool },
}

/// Which side of a session this handler plays. Heartbeat origination is
/// client-only; a server echoes a received `Heartbeat` back instead (spec
/// §4.6). Every session this crate accepts is server-mode, since it only
/// ever creates one in response to an inbound `SessionRequest`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionMode {
    Client,
    Server,
}

pub struct HandlerParams {
    pub session_id: SessionId,
    pub remote_addr: SocketAddr,
    pub mode: ConnectionMode,
    pub own_udp_length: BufferSize,
    pub heartbeat_after: Duration,
    pub inactivity_timeout: Duration,
    pub window_size: u16,
    pub max_queued_outgoing: usize,
    pub max_queued_incoming: u16,
    pub acknowledge_all_data: bool,
    pub max_acknowledge_delay: Duration,
    pub default_ack_wait: Duration,
}

/// Once a session is established and torn down enough times, further resends
/// of the same `Disconnect` stop being worth the effort.
const UNACKNOWLEDGED_TIMEOUT_MULTIPLIER: u32 = 8;

pub struct ProtocolHandler<A: ApplicationProtocol> {
    state: SessionState,
    terminated_by_remote: bool,
    session_id: SessionId,
    remote_addr: SocketAddr,
    mode: ConnectionMode,
    own_udp_length: BufferSize,
    buffer_size: BufferSize,
    codec_params: Option<CodecParams>,
    crc_seed: CrcSeed,
    input: Option<ReliableDataInputChannel>,
    output: Option<ReliableDataOutputChannel>,
    app_params: ApplicationParameters,
    application: A,
    last_receive: Instant,
    last_heartbeat_sent: Instant,
    heartbeat_after: Duration,
    inactivity_timeout: Duration,
    window_size: u16,
    max_queued_outgoing: usize,
    max_queued_incoming: u16,
    acknowledge_all_data: bool,
    max_acknowledge_delay: Duration,
    default_ack_wait: Duration,
}

impl<A: ApplicationProtocol> ProtocolHandler<A> {
    pub fn new(params: HandlerParams, application: A, crc_seed: CrcSeed, now: Instant) -> Self {
        ProtocolHandler {
            state: SessionState::Negotiating,
            terminated_by_remote: false,
            session_id: params.session_id,
            remote_addr: params.remote_addr,
            mode: params.mode,
            own_udp_length: params.own_udp_length,
            buffer_size: params.own_udp_length,
            codec_params: None,
            crc_seed,
            input: None,
            output: None,
            app_params: ApplicationParameters::default(),
            application,
            last_receive: now,
            last_heartbeat_sent: now,
            heartbeat_after: params.heartbeat_after,
            inactivity_timeout: params.inactivity_timeout,
            window_size: params.window_size,
            max_queued_outgoing: params.max_queued_outgoing,
            max_queued_incoming: params.max_queued_incoming,
            acknowledge_all_data: params.acknowledge_all_data,
            max_acknowledge_delay: params.max_acknowledge_delay,
            default_ack_wait: params.default_ack_wait,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = addr;
    }

    pub fn crc_seed(&self) -> CrcSeed {
        self.crc_seed
    }

    /// Transitions into `Terminated`, firing `on_session_closed` exactly
    /// once and, when `notify_peer` is set, queuing a `Disconnect` for the
    /// peer (spec §7's disposition table). If no codec params have been
    /// negotiated yet, `finish_send` silently drops that `Disconnect` rather
    /// than failing to serialize it — "notify if possible, else silently".
    fn terminate(&mut self, reason: DisconnectReason, notify_peer: bool, to_send: &mut Vec<Packet>) {
        if matches!(self.state, SessionState::Terminated { .. }) {
            return;
        }
        self.state = SessionState::Terminated { reason, by_remote: self.terminated_by_remote };

        if notify_peer {
            to_send.push(Packet::Disconnect { session_id: self.session_id, reason });
        }

        let mut outgoing = Vec::new();
        let mut disconnect_requested = None;
        let mut handle = SessionHandle {
            session_id: self.session_id,
            remote_addr: self.remote_addr,
            mode: self.mode,
            state: self.state,
            terminated_by_remote: self.terminated_by_remote,
            outgoing: &mut outgoing,
            disconnect_requested: &mut disconnect_requested,
        };
        self.application.on_session_closed(&mut handle, reason);
    }

    fn negotiate(&mut self, protocol_version: u32, udp_length: BufferSize, to_send: &mut Vec<Packet>) {
        if protocol_version != SOE_PROTOCOL_VERSION {
            self.terminate(DisconnectReason::ProtocolMismatch, true, to_send);
            return;
        }

        let session_params = self.application.session_params();
        self.buffer_size = self.own_udp_length.min(udp_length).min(session_params.udp_length);

        let codec_params = CodecParams {
            crc_seed: self.crc_seed,
            crc_length: session_params.crc_length,
            is_compression_enabled: session_params.is_compression_enabled,
        };
        self.codec_params = Some(codec_params);

        if let Some(key) = &session_params.encryption_key {
            self.app_params.inbound_cipher = Some(Rc4KeyState::new(key));
            self.app_params.outbound_cipher = Some(Rc4KeyState::new(key));
        }
        self.app_params.set_encryption_enabled(session_params.is_encryption_enabled);

        self.input = Some(ReliableDataInputChannel::new(
            InputChannelParams {
                window_size: self.max_queued_incoming,
                acknowledge_all_data: self.acknowledge_all_data,
                max_acknowledge_delay: self.max_acknowledge_delay,
            },
            Instant::now(),
        ));
        self.output = Some(ReliableDataOutputChannel::new(OutputChannelParams {
            buffer_size: self.buffer_size,
            codec_params,
            window_size: self.window_size,
            max_queued_outgoing: self.max_queued_outgoing,
            default_ack_wait: self.default_ack_wait,
        }));

        self.state = SessionState::Running;

        to_send.push(Packet::SessionResponse {
            session_id: self.session_id,
            crc_seed: codec_params.crc_seed,
            crc_length: codec_params.crc_length,
            is_compression_enabled: codec_params.is_compression_enabled,
            unknown1: false,
            udp_length: self.buffer_size,
            protocol_version: SOE_PROTOCOL_VERSION,
        });

        let mut outgoing = Vec::new();
        let mut disconnect_requested = None;
        {
            let mut handle = SessionHandle {
                session_id: self.session_id,
                remote_addr: self.remote_addr,
                mode: self.mode,
                state: self.state,
                terminated_by_remote: self.terminated_by_remote,
                outgoing: &mut outgoing,
                disconnect_requested: &mut disconnect_requested,
            };
            self.application.on_session_opened(&mut handle);
        }
        for buf in outgoing {
            self.output.as_mut().expect("just initialized").enqueue_data(buf);
        }
        if let Some(reason) = disconnect_requested {
            self.terminate(reason, true, to_send);
        }
    }

    fn dispatch_one(&mut self, packet: Packet, to_send: &mut Vec<Packet>) {
        match packet {
            Packet::SessionRequest { protocol_version, udp_length, .. } => {
                if self.state == SessionState::Negotiating {
                    self.negotiate(protocol_version, udp_length, to_send);
                }
            }
            Packet::Heartbeat => {
                // A server echoes a received heartbeat back; origination is
                // client-mode-only and handled in `tick` (spec §4.6).
                if self.mode == ConnectionMode::Server {
                    to_send.push(Packet::Heartbeat);
                }
            }
            Packet::NetStatusRequest { .. } | Packet::NetStatusResponse { .. } => {
                // Parsed for completeness; this crate doesn't act on net-status
                // content (spec §9 / SPEC_FULL §B).
            }
            Packet::Disconnect { reason, .. } => {
                self.terminated_by_remote = true;
                self.terminate(reason, false, to_send);
            }
            Packet::UnknownSender => {
                self.terminate(DisconnectReason::UnreachableConnection, false, to_send);
            }
            Packet::ReliableData { .. } | Packet::ReliableDataFragment { .. } => {
                let Some(input) = self.input.as_mut() else { return };
                match input.feed(packet, &mut self.app_params) {
                    Ok(outcome) => {
                        for ack in outcome.acks {
                            to_send.push(ack);
                        }
                        for buf in outcome.delivered {
                            let mut outgoing = Vec::new();
                            let mut disconnect_requested = None;
                            {
                                let mut handle = SessionHandle {
                                    session_id: self.session_id,
                                    remote_addr: self.remote_addr,
                                    mode: self.mode,
                                    state: self.state,
                                    terminated_by_remote: self.terminated_by_remote,
                                    outgoing: &mut outgoing,
                                    disconnect_requested: &mut disconnect_requested,
                                };
                                self.application.handle_app_data(&mut handle, &buf);
                            }
                            if let Some(output) = self.output.as_mut() {
                                for out_buf in outgoing {
                                    output.enqueue_data(out_buf);
                                }
                            }
                            if let Some(reason) = disconnect_requested {
                                self.terminate(reason, true, to_send);
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        self.terminate(DisconnectReason::CorruptPacket, true, to_send);
                    }
                }
            }
            Packet::Acknowledge(sequence) => {
                if let Some(output) = self.output.as_mut() {
                    output.on_acknowledge(sequence, Instant::now());
                }
            }
            Packet::AcknowledgeAll(sequence) => {
                if let Some(output) = self.output.as_mut() {
                    output.on_acknowledge_all(sequence, Instant::now());
                }
            }
            Packet::SessionResponse { .. } | Packet::RemapConnection { .. } => {
                // Server-to-client / socket-layer packets; nothing for the
                // per-session handler to do with these on receipt.
            }
        }
    }

    /// Feeds one raw datagram in. Returns serialized response datagrams.
    pub fn handle_raw(&mut self, raw: &[u8]) -> Vec<Vec<u8>> {
        self.last_receive = Instant::now();

        let packets = match deserialize_packet(raw, self.codec_params) {
            Ok(packets) => packets,
            Err(DeserializeError::CrcMismatch { .. }) | Err(DeserializeError::Decompress(_)) => {
                let reason = if self.state == SessionState::Negotiating {
                    DisconnectReason::ConnectError
                } else {
                    DisconnectReason::CorruptPacket
                };
                let mut to_send = Vec::new();
                self.terminate(reason, true, &mut to_send);
                return self.finish_send(to_send);
            }
            Err(_) => return Vec::new(),
        };

        let mut to_send = Vec::new();
        for packet in packets {
            self.dispatch_one(packet, &mut to_send);
            if matches!(self.state, SessionState::Terminated { .. }) {
                break;
            }
        }

        self.finish_send(to_send)
    }

    /// Periodic housekeeping: heartbeat, inactivity timeout, reliable channel
    /// ticks. Returns serialized datagrams to send this tick.
    pub fn tick(&mut self, now: Instant) -> Vec<Vec<u8>> {
        if matches!(self.state, SessionState::Terminated { .. }) {
            return Vec::new();
        }

        if now.duration_since(self.last_receive) > self.inactivity_timeout {
            let mut to_send = Vec::new();
            self.terminate(DisconnectReason::Timeout, false, &mut to_send);
            return self.finish_send(to_send);
        }

        let mut to_send = Vec::new();

        if self.state == SessionState::Running {
            if let Some(output) = self.output.as_ref() {
                if let Some(age) = output.oldest_unacknowledged_age(now) {
                    if age > self.default_ack_wait * UNACKNOWLEDGED_TIMEOUT_MULTIPLIER {
                        self.terminate(DisconnectReason::UnacknowledgedTimeout, true, &mut to_send);
                        return self.finish_send(to_send);
                    }
                }
            }

            if self.mode == ConnectionMode::Client && now.duration_since(self.last_heartbeat_sent) > self.heartbeat_after {
                to_send.push(Packet::Heartbeat);
                self.last_heartbeat_sent = now;
            }

            if let Some(input) = self.input.as_mut() {
                to_send.extend(input.tick(now));
            }
            if let Some(output) = self.output.as_mut() {
                to_send.extend(output.tick(now, &mut self.app_params));
            }
        }

        self.finish_send(to_send)
    }

    /// Queues an application-originated buffer for the next `tick`'s send.
    pub fn enqueue_app_data(&mut self, data: Vec<u8>) -> bool {
        self.output.as_mut().map(|output| output.enqueue_data(data)).unwrap_or(false)
    }

    /// Terminates the session immediately (e.g. server shutdown), notifying
    /// the peer and firing `on_session_closed`. Returns datagrams to send.
    pub fn force_terminate(&mut self, reason: DisconnectReason) -> Vec<Vec<u8>> {
        let mut to_send = Vec::new();
        self.terminate(reason, true, &mut to_send);
        self.finish_send(to_send)
    }

    fn finish_send(&self, packets: Vec<Packet>) -> Vec<Vec<u8>> {
        if packets.is_empty() {
            return Vec::new();
        }
        let params = SerializeParams {
            buffer_size: self.buffer_size,
            codec_params: self.codec_params,
        };
        serialize_packets(&packets, &params).unwrap_or_default()
    }
}

/// Log line helper used by the socket layer: shows the session and remote
/// address this handler is currently tagged with, for use inside `info!`.
pub fn session_log_tag() -> Option<(String, String)> {
    Some((current_session_id()?, current_session_addr()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::app::{EchoApplication, SessionParameters};
    use std::net::{IpAddr, Ipv4Addr};

    fn handler() -> ProtocolHandler<EchoApplication> {
        let app = EchoApplication::new(SessionParameters {
            crc_length: 2,
            is_compression_enabled: false,
            udp_length: 512,
            encryption_key: None,
            is_encryption_enabled: false,
        });
        ProtocolHandler::new(
            HandlerParams {
                session_id: 1,
                remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000),
                mode: ConnectionMode::Server,
                own_udp_length: 512,
                heartbeat_after: Duration::from_secs(5),
                inactivity_timeout: Duration::from_secs(30),
                window_size: 8,
                max_queued_outgoing: 64,
                max_queued_incoming: 32,
                acknowledge_all_data: true,
                max_acknowledge_delay: Duration::ZERO,
                default_ack_wait: Duration::from_millis(200),
            },
            app,
            9999,
            Instant::now(),
        )
    }

    #[test]
    fn negotiation_moves_to_running_and_replies() {
        let mut h = handler();
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let raw = serialize_packets(
            &[Packet::SessionRequest {
                protocol_version: SOE_PROTOCOL_VERSION,
                session_id: 1,
                udp_length: 512,
                application_protocol: "EchoProtocol".to_string(),
            }],
            &params,
        )
        .unwrap();

        let response = h.handle_raw(&raw[0]);
        assert_eq!(h.state(), SessionState::Running);
        assert_eq!(response.len(), 1);
    }

    #[test]
    fn mismatched_protocol_version_terminates_and_drops_unsendable_notification() {
        let mut h = handler();
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let raw = serialize_packets(
            &[Packet::SessionRequest {
                protocol_version: SOE_PROTOCOL_VERSION + 1,
                session_id: 1,
                udp_length: 512,
                application_protocol: "EchoProtocol".to_string(),
            }],
            &params,
        )
        .unwrap();

        let response = h.handle_raw(&raw[0]);
        assert_eq!(
            h.state(),
            SessionState::Terminated { reason: DisconnectReason::ProtocolMismatch, by_remote: false }
        );
        // No codec params were ever negotiated, so the attempted Disconnect
        // notification has nothing to serialize against and is dropped.
        assert!(response.is_empty());
    }

    #[test]
    fn disconnect_packet_terminates_the_session_without_echoing_one_back() {
        let mut h = handler();
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let negotiate = serialize_packets(
            &[Packet::SessionRequest {
                protocol_version: SOE_PROTOCOL_VERSION,
                session_id: 1,
                udp_length: 512,
                application_protocol: "EchoProtocol".to_string(),
            }],
            &params,
        )
        .unwrap();
        h.handle_raw(&negotiate[0]);

        let codec_params = h.codec_params.unwrap();
        let disconnect_params = SerializeParams { buffer_size: 512, codec_params: Some(codec_params) };
        let raw = serialize_packets(
            &[Packet::Disconnect { session_id: 1, reason: DisconnectReason::Application }],
            &disconnect_params,
        )
        .unwrap();

        let response = h.handle_raw(&raw[0]);
        assert_eq!(
            h.state(),
            SessionState::Terminated { reason: DisconnectReason::Application, by_remote: true }
        );
        assert!(response.is_empty());
    }

    #[test]
    fn server_mode_echoes_a_received_heartbeat() {
        let mut h = handler();
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let negotiate = serialize_packets(
            &[Packet::SessionRequest {
                protocol_version: SOE_PROTOCOL_VERSION,
                session_id: 1,
                udp_length: 512,
                application_protocol: "EchoProtocol".to_string(),
            }],
            &params,
        )
        .unwrap();
        h.handle_raw(&negotiate[0]);

        let codec_params = h.codec_params.unwrap();
        let heartbeat_params = SerializeParams { buffer_size: 512, codec_params: Some(codec_params) };
        let raw = serialize_packets(&[Packet::Heartbeat], &heartbeat_params).unwrap();

        let response = h.handle_raw(&raw[0]);
        assert_eq!(response.len(), 1);
        let parsed = deserialize_packet(&response[0], Some(codec_params)).unwrap();
        assert_eq!(parsed, vec![Packet::Heartbeat]);
    }

    #[test]
    fn server_mode_never_originates_a_heartbeat_on_tick() {
        let mut h = handler();
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let negotiate = serialize_packets(
            &[Packet::SessionRequest {
                protocol_version: SOE_PROTOCOL_VERSION,
                session_id: 1,
                udp_length: 512,
                application_protocol: "EchoProtocol".to_string(),
            }],
            &params,
        )
        .unwrap();
        h.handle_raw(&negotiate[0]);

        let response = h.tick(Instant::now() + Duration::from_secs(10));
        assert!(response.is_empty());
    }
}
