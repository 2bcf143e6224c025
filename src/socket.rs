//! UDP socket ownership and session demultiplexing (spec §7). Grounded on
//! the teacher's `ChannelManager`/`receive_once`/`send_packet` (loosely: one
//! [`ProtocolHandler`] per remote address, looked up by a map, fed from a
//! single receive loop) but collapsed to the single cooperative tick loop
//! this crate's Non-goals call for, with an optional background receive
//! thread feeding a bounded `crossbeam_channel` the way the teacher's
//! `receive_once` feeds its process threads.

use crate::config::ServerOptions;
use crate::protocol::app::ApplicationProtocol;
use crate::protocol::buffer_pool::{BufferPool, PooledSpan};
use crate::protocol::deserialize::deserialize_packet;
use crate::protocol::handler::{ConnectionMode, HandlerParams, ProtocolHandler};
use crate::protocol::packet::{DisconnectReason, Packet, ProtocolOpCode, SessionId};
use crate::{debug, info, logging};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::random;
use std::collections::BTreeMap;
use std::io::Error;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One inbound datagram, tagged with the address it arrived from. Carries
/// its bytes in a pool-rented span rather than an owned `Vec`, so the
/// background receive thread and `tick` share the same backpressure.
struct Inbound {
    src: SocketAddr,
    data: PooledSpan,
}

/// Owns the socket and the address-to-session map, and drives every
/// session's [`ProtocolHandler`] from a single thread. Applications are
/// constructed fresh per accepted session via `new_application`.
pub struct SocketHandler<A: ApplicationProtocol, F: FnMut() -> A> {
    socket: Arc<UdpSocket>,
    options: ServerOptions,
    pool: Arc<BufferPool>,
    sessions: BTreeMap<SocketAddr, ProtocolHandler<A>>,
    next_session_id: SessionId,
    new_application: F,
    receive_rx: Option<Receiver<Inbound>>,
    ever_had_session: bool,
}

impl<A: ApplicationProtocol, F: FnMut() -> A> SocketHandler<A, F> {
    pub fn bind(options: ServerOptions, new_application: F) -> Result<Self, Error> {
        let socket = UdpSocket::bind(SocketAddr::new(options.bind_ip, options.port))?;
        socket.set_nonblocking(true)?;
        let pool = BufferPool::new(options.udp_length as usize, options.packet_pool_size);

        Ok(SocketHandler {
            socket: Arc::new(socket),
            options,
            pool,
            sessions: BTreeMap::new(),
            next_session_id: 1,
            new_application,
            receive_rx: None,
            ever_had_session: false,
        })
    }

    /// Spawns a dedicated thread blocking on `recv_from` and forwarding
    /// datagrams through a bounded channel (sized from `max_queued_raw_packets`),
    /// so `tick` never blocks on the socket itself. Optional: without calling
    /// this, `tick` polls the socket directly (fine for a single-threaded
    /// embedding).
    pub fn spawn_receive_thread(&mut self) {
        let (tx, rx) = bounded::<Inbound>(self.options.max_queued_raw_packets);
        let socket = Arc::clone(&self.socket);
        let pool = Arc::clone(&self.pool);

        std::thread::spawn(move || receive_loop(socket, pool, tx));
        self.receive_rx = Some(rx);
    }

    fn accept(&mut self, addr: SocketAddr) -> &mut ProtocolHandler<A> {
        let session_id = self.next_session_id;
        self.next_session_id = self.next_session_id.wrapping_add(1);

        let crc_seed = random();
        let application = (self.new_application)();
        let params = HandlerParams {
            session_id,
            remote_addr: addr,
            mode: ConnectionMode::Server,
            own_udp_length: self.options.udp_length,
            heartbeat_after: Duration::from_millis(self.options.heartbeat_after_millis),
            inactivity_timeout: Duration::from_millis(self.options.inactivity_timeout_millis),
            window_size: self.options.data_ack_window,
            max_queued_outgoing: self.options.max_queued_outgoing_reliable_data_packets,
            max_queued_incoming: self.options.max_queued_incoming_reliable_data_packets,
            acknowledge_all_data: self.options.acknowledge_all_data,
            max_acknowledge_delay: Duration::from_millis(self.options.max_acknowledge_delay_millis),
            default_ack_wait: Duration::from_millis(self.options.ack_wait_millis),
        };

        info!("Creating session {} for {}", session_id, addr);
        self.ever_had_session = true;
        self.sessions
            .entry(addr)
            .or_insert_with(|| ProtocolHandler::new(params, application, crc_seed, Instant::now()))
    }

    /// Matches a `RemapConnection` against an existing session by session id
    /// and crc seed, requiring the source IP to stay the same (spec §4.6/§4.7).
    /// Re-keys the session map under the new address on success.
    fn remap(&mut self, new_addr: SocketAddr, data: &[u8]) {
        if !self.options.allow_port_remaps {
            return;
        }
        let Ok(packets) = deserialize_packet(data, None) else { return };
        let Some(Packet::RemapConnection { session_id, crc_seed }) = packets.into_iter().next() else {
            return;
        };

        let matched = self.sessions.iter().find_map(|(addr, handler)| {
            if handler.session_id() == session_id && handler.crc_seed() == crc_seed && addr.ip() == new_addr.ip() {
                Some(*addr)
            } else {
                None
            }
        });
        let Some(old_addr) = matched else { return };
        if old_addr == new_addr {
            return;
        }

        if let Some(mut handler) = self.sessions.remove(&old_addr) {
            handler.set_remote_addr(new_addr);
            info!("Remapped session {} from {} to {}", session_id, old_addr, new_addr);
            self.sessions.insert(new_addr, handler);
        }
    }

    fn deliver(&mut self, src: SocketAddr, data: &[u8]) {
        if !self.sessions.contains_key(&src) {
            match peek_op_code(data) {
                Some(ProtocolOpCode::SessionRequest) => {
                    self.accept(src);
                }
                Some(ProtocolOpCode::RemapConnection) => {
                    self.remap(src, data);
                    return;
                }
                // Any other unmatched datagram (stray traffic, a retransmit
                // for an already-torn-down session) is dropped rather than
                // spawning a phantom session (spec §4.7).
                _ => return,
            }
        }

        let Some(handler) = self.sessions.get_mut(&src) else { return };
        let session_id = handler.session_id();
        let outgoing = logging::with_session_tag(session_id, src, || handler.handle_raw(data));

        for packet in outgoing {
            send_to(&self.socket, &src, &packet);
        }
    }

    /// Drains any datagrams received since the last call (either directly
    /// from the socket, or from the background receive thread if spawned),
    /// dispatches them into the matching session, ticks every live session,
    /// and drops sessions that have terminated. Should be called in a loop
    /// by the embedding binary.
    pub fn tick(&mut self, poll_timeout: Duration) {
        match self.receive_rx.take() {
            Some(rx) => {
                if let Ok(inbound) = rx.recv_timeout(poll_timeout) {
                    self.deliver(inbound.src, inbound.data.as_slice());
                    while let Ok(inbound) = rx.try_recv() {
                        self.deliver(inbound.src, inbound.data.as_slice());
                    }
                }
                self.receive_rx = Some(rx);
            }
            None => match self.pool.rent() {
                Some(mut span) => {
                    if let Ok((len, src)) = self.socket.recv_from(span.full_capacity_mut()) {
                        span.set_len(len);
                        self.deliver(src, span.as_slice());
                    }
                }
                None => {
                    // Pool exhausted: drain and drop the datagram rather than
                    // growing unbounded memory (spec §5).
                    let mut scratch = vec![0u8; self.options.udp_length as usize];
                    if let Ok((_, src)) = self.socket.recv_from(&mut scratch) {
                        debug!("Dropping datagram from {}: buffer pool exhausted", src);
                    }
                }
            },
        }

        let now = Instant::now();
        let mut terminated = Vec::new();

        for (addr, handler) in self.sessions.iter_mut() {
            let session_id = handler.session_id();
            let outgoing = logging::with_session_tag(session_id, *addr, || handler.tick(now));
            for packet in outgoing {
                send_to(&self.socket, addr, &packet);
            }

            if matches!(handler.state(), crate::protocol::SessionState::Terminated { .. }) {
                terminated.push(*addr);
            }
        }

        for addr in terminated {
            if let Some(handler) = self.sessions.remove(&addr) {
                if let crate::protocol::SessionState::Terminated { reason, .. } = handler.state() {
                    info!("Session {} for {} terminated: {:?}", handler.session_id(), addr, reason);
                }
            }
        }
    }

    /// A session's application may only be reached while a datagram for it
    /// is in flight; this exposes live session ids for diagnostics.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.values().map(|h| h.session_id()).collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the embedding binary should stop ticking: only meaningful
    /// when `stop_on_last_session_terminated` is set, and only once at
    /// least one session has ever been accepted (spec §7).
    pub fn should_stop(&self) -> bool {
        self.options.stop_on_last_session_terminated && self.ever_had_session && self.sessions.is_empty()
    }

    pub fn disconnect_all(&mut self, reason: DisconnectReason) {
        let addrs: Vec<SocketAddr> = self.sessions.keys().copied().collect();
        for addr in addrs {
            if let Some(mut handler) = self.sessions.remove(&addr) {
                for packet in handler.force_terminate(reason) {
                    send_to(&self.socket, &addr, &packet);
                }
            }
        }
    }
}

/// Reads the first two bytes of a datagram as an opcode, without touching
/// any session state. Safe to call before a session exists: contextless
/// opcodes never depend on negotiated CRC/compression parameters.
fn peek_op_code(data: &[u8]) -> Option<ProtocolOpCode> {
    let bytes: [u8; 2] = data.get(0..2)?.try_into().ok()?;
    ProtocolOpCode::from_u16(u16::from_be_bytes(bytes))
}

fn receive_loop(socket: Arc<UdpSocket>, pool: Arc<BufferPool>, tx: Sender<Inbound>) {
    socket.set_nonblocking(false).ok();

    loop {
        match pool.rent() {
            Some(mut span) => match socket.recv_from(span.full_capacity_mut()) {
                Ok((len, src)) => {
                    span.set_len(len);
                    if tx.send(Inbound { src, data: span }).is_err() {
                        return;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(_) => return,
            },
            None => {
                let mut scratch = vec![0u8; pool.span_size()];
                match socket.recv_from(&mut scratch) {
                    Ok((_, src)) => debug!("Dropping datagram from {}: buffer pool exhausted", src),
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => return,
                }
            }
        }
    }
}

fn send_to(socket: &UdpSocket, addr: &SocketAddr, data: &[u8]) {
    if let Err(err) = socket.send_to(data, addr) {
        info!("Unable to send packet to {}: {}", addr, err);
    }
}

/// Never actually blocks forever: `recv_timeout` bounds the wait so `tick`
/// keeps heartbeats and retransmits flowing even with no traffic.
#[allow(dead_code)]
fn poll_once(rx: &Receiver<Inbound>, timeout: Duration) -> Option<Inbound> {
    match rx.recv_timeout(timeout) {
        Ok(inbound) => Some(inbound),
        Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
    }
}
