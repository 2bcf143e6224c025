//! Integration tests exercising the negotiation/disconnect scenarios and the
//! end-to-end output→input fuzz property from spec §8, driving the public
//! crate surface the way an embedding binary would (raw datagrams in and
//! out of a `ProtocolHandler`, rather than reaching into private fields).

use soe_protocol::protocol::app::{EchoApplication, SessionParameters};
use soe_protocol::protocol::deserialize::{deserialize_packet, CodecParams};
use soe_protocol::protocol::handler::{ConnectionMode, HandlerParams, ProtocolHandler};
use soe_protocol::protocol::packet::{DisconnectReason, Packet, SOE_PROTOCOL_VERSION};
use soe_protocol::protocol::reliable::input::{InputChannelParams, ReliableDataInputChannel};
use soe_protocol::protocol::reliable::output::{OutputChannelParams, ReliableDataOutputChannel};
use soe_protocol::protocol::reliable::ApplicationParameters;
use soe_protocol::protocol::serialize::{serialize_packets, SerializeParams};
use soe_protocol::protocol::SessionState;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn remote() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9000)
}

fn handler_params() -> HandlerParams {
    HandlerParams {
        session_id: 42,
        remote_addr: remote(),
        mode: ConnectionMode::Server,
        own_udp_length: 512,
        heartbeat_after: Duration::from_secs(25),
        inactivity_timeout: Duration::from_secs(30),
        window_size: 32,
        max_queued_outgoing: 64,
        max_queued_incoming: 64,
        acknowledge_all_data: true,
        max_acknowledge_delay: Duration::ZERO,
        default_ack_wait: Duration::from_millis(200),
    }
}

fn echo_app() -> EchoApplication {
    EchoApplication::new(SessionParameters {
        crc_length: 2,
        is_compression_enabled: false,
        udp_length: 512,
        encryption_key: None,
        is_encryption_enabled: false,
    })
}

#[test]
fn negotiation_round_trip_reaches_running_and_fires_on_session_opened() {
    let mut handler = ProtocolHandler::new(handler_params(), echo_app(), 5, Instant::now());
    assert_eq!(handler.state(), SessionState::Negotiating);

    let request = Packet::SessionRequest {
        protocol_version: SOE_PROTOCOL_VERSION,
        session_id: 1234,
        udp_length: 512,
        application_protocol: "TestProtocol".to_string(),
    };
    let raw = serialize_packets(&[request], &SerializeParams { buffer_size: 512, codec_params: None })
        .unwrap();
    assert_eq!(raw.len(), 1);

    let responses = handler.handle_raw(&raw[0]);
    assert_eq!(handler.state(), SessionState::Running);
    assert_eq!(responses.len(), 1);

    let parsed = deserialize_packet(&responses[0], None).unwrap();
    assert_eq!(parsed.len(), 1);
    match &parsed[0] {
        Packet::SessionResponse { session_id, protocol_version, .. } => {
            assert_eq!(*session_id, 42);
            assert_eq!(*protocol_version, SOE_PROTOCOL_VERSION);
        }
        other => panic!("expected a SessionResponse, got {other:?}"),
    }
}

#[test]
fn mismatched_protocol_version_terminates_the_session() {
    let mut handler = ProtocolHandler::new(handler_params(), echo_app(), 5, Instant::now());
    let request = Packet::SessionRequest {
        protocol_version: SOE_PROTOCOL_VERSION + 1,
        session_id: 1234,
        udp_length: 512,
        application_protocol: "TestProtocol".to_string(),
    };
    let raw = serialize_packets(&[request], &SerializeParams { buffer_size: 512, codec_params: None })
        .unwrap();

    let responses = handler.handle_raw(&raw[0]);
    // No codec params were ever negotiated, so the attempted Disconnect
    // notification has nothing to serialize against and is dropped.
    assert!(responses.is_empty());
    assert_eq!(
        handler.state(),
        SessionState::Terminated { reason: DisconnectReason::ProtocolMismatch, by_remote: false }
    );
}

#[test]
fn disconnect_during_running_terminates_with_application_reason() {
    let mut handler = ProtocolHandler::new(handler_params(), echo_app(), 5, Instant::now());
    let request = Packet::SessionRequest {
        protocol_version: SOE_PROTOCOL_VERSION,
        session_id: 1,
        udp_length: 512,
        application_protocol: "TestProtocol".to_string(),
    };
    let raw = serialize_packets(&[request], &SerializeParams { buffer_size: 512, codec_params: None })
        .unwrap();
    handler.handle_raw(&raw[0]);
    assert_eq!(handler.state(), SessionState::Running);

    let codec_params = CodecParams { crc_seed: 5, crc_length: 2, is_compression_enabled: false };
    let disconnect = Packet::Disconnect { session_id: 42, reason: DisconnectReason::Application };
    let raw_disconnect = serialize_packets(
        &[disconnect],
        &SerializeParams { buffer_size: 512, codec_params: Some(codec_params) },
    )
    .unwrap();

    handler.handle_raw(&raw_disconnect[0]);
    assert_eq!(
        handler.state(),
        SessionState::Terminated { reason: DisconnectReason::Application, by_remote: true }
    );
}

/// spec §8 property #11: enqueueing 256 buffers of increasing size on the
/// output channel and piping every emitted contextual packet into the input
/// channel (acknowledging as we go) reproduces the originals, in order.
#[test]
fn end_to_end_fuzz_reproduces_every_buffer_in_order() {
    let codec_params = CodecParams { crc_seed: 7, crc_length: 2, is_compression_enabled: false };
    let mut output = ReliableDataOutputChannel::new(OutputChannelParams {
        buffer_size: 512,
        codec_params: codec_params.clone(),
        window_size: 64,
        max_queued_outgoing: 512,
        default_ack_wait: Duration::from_millis(200),
    });
    let mut input = ReliableDataInputChannel::new(
        InputChannelParams { window_size: 64, acknowledge_all_data: true, max_acknowledge_delay: Duration::ZERO },
        Instant::now(),
    );

    let buffers: Vec<Vec<u8>> = (0..256u32).map(|i| vec![(i % 251) as u8; (i as usize) * 16]).collect();
    for buf in &buffers {
        assert!(output.enqueue_data(buf.clone()));
    }

    let mut out_app = ApplicationParameters::default();
    let mut in_app = ApplicationParameters::default();
    let mut delivered = Vec::new();
    let mut now = Instant::now();

    for _ in 0..100_000 {
        let to_send = output.tick(now, &mut out_app);
        let done = to_send.is_empty() && !output.has_unacknowledged();

        for packet in to_send {
            let sequence = packet.sequence_number();
            let outcome = input.feed(packet, &mut in_app).expect("well-formed reliable packet");
            delivered.extend(outcome.delivered);
            if let Some(sequence) = sequence {
                output.on_acknowledge(sequence, now);
            }
        }

        for ack in input.tick(now) {
            if let Packet::AcknowledgeAll(sequence) = ack {
                output.on_acknowledge_all(sequence, now);
            }
        }

        if done {
            break;
        }
        now += Duration::from_millis(1);
    }

    assert_eq!(delivered, buffers);
}

#[test]
fn multi_packet_bundle_yields_two_application_buffers() {
    let data = vec![0x00, 0x19, 1, 0x02, 1, 0x04];
    let packet = Packet::ReliableData { sequence: 0, data };
    let mut input = ReliableDataInputChannel::new(
        InputChannelParams { window_size: 32, acknowledge_all_data: true, max_acknowledge_delay: Duration::ZERO },
        Instant::now(),
    );
    let mut app = ApplicationParameters::default();

    let outcome = input.feed(packet, &mut app).unwrap();
    assert_eq!(outcome.delivered, vec![vec![0x02], vec![0x04]]);
}
