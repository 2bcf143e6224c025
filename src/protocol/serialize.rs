//! Packet serialization (spec §4.1): per-opcode field encoding, contextual
//! framing (compression + CRC trailer), opportunistic MultiPacket grouping.

use crate::protocol::crc::{compute_crc, CrcSeed, CrcSize};
use crate::protocol::deserialize::CodecParams;
use crate::protocol::packet::{BufferSize, Packet, ProtocolOpCode};
use crate::protocol::varint::write_multi_packet_length;
use byteorder::{BigEndian, WriteBytesExt};
use miniz_oxide::deflate::compress_to_vec_zlib;
use std::collections::VecDeque;
use std::io::{Error, Write};
use std::mem::size_of;

const ZLIB_COMPRESSION_LENGTH_THRESHOLD: usize = 100;
const ZLIB_COMPRESSION_LEVEL: u8 = 2;

#[non_exhaustive]
#[derive(Debug)]
pub enum SerializeError {
    Io(Error),
    MissingCodecParams,
    BufferTooSmall(usize),
}

impl From<Error> for SerializeError {
    fn from(value: Error) -> Self {
        SerializeError::Io(value)
    }
}

fn variable_length_int_size(length: usize) -> usize {
    if length < 0xFF {
        size_of::<u8>()
    } else if length < 0xFFFF {
        size_of::<u16>() + 1
    } else {
        size_of::<u32>() + 3
    }
}

fn serialize_session_request(
    protocol_version: u32,
    session_id: u32,
    udp_length: u32,
    application_protocol: &str,
) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u32::<BigEndian>(protocol_version)?;
    buffer.write_u32::<BigEndian>(session_id)?;
    buffer.write_u32::<BigEndian>(udp_length)?;
    buffer.write_all(application_protocol.as_bytes())?;
    buffer.write_u8(0)?;
    Ok(buffer)
}

fn serialize_session_response(
    session_id: u32,
    crc_seed: CrcSeed,
    crc_length: CrcSize,
    is_compression_enabled: bool,
    unknown1: bool,
    udp_length: u32,
    protocol_version: u32,
) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u32::<BigEndian>(session_id)?;
    buffer.write_u32::<BigEndian>(crc_seed)?;
    buffer.write_u8(crc_length)?;
    buffer.write_u8(is_compression_enabled as u8)?;
    buffer.write_u8(unknown1 as u8)?;
    buffer.write_u32::<BigEndian>(udp_length)?;
    buffer.write_u32::<BigEndian>(protocol_version)?;
    Ok(buffer)
}

fn serialize_disconnect(session_id: u32, reason: crate::protocol::packet::DisconnectReason) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u32::<BigEndian>(session_id)?;
    buffer.write_u16::<BigEndian>(reason.as_u16())?;
    Ok(buffer)
}

fn serialize_net_status_request(
    client_tick_count: u16,
    last_client_update: u32,
    average_update: u32,
    shortest_update: u32,
    longest_update: u32,
    last_server_update: u32,
    packets_sent: u64,
    packets_received: u64,
    unknown: u16,
) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u16::<BigEndian>(client_tick_count)?;
    buffer.write_u32::<BigEndian>(last_client_update)?;
    buffer.write_u32::<BigEndian>(average_update)?;
    buffer.write_u32::<BigEndian>(shortest_update)?;
    buffer.write_u32::<BigEndian>(longest_update)?;
    buffer.write_u32::<BigEndian>(last_server_update)?;
    buffer.write_u64::<BigEndian>(packets_sent)?;
    buffer.write_u64::<BigEndian>(packets_received)?;
    buffer.write_u16::<BigEndian>(unknown)?;
    Ok(buffer)
}

fn serialize_net_status_response(
    client_tick_count: u16,
    server_tick_count: u32,
    client_packets_sent: u64,
    client_packets_received: u64,
    server_packets_sent: u64,
    server_packets_received: u64,
    unknown: u16,
) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u16::<BigEndian>(client_tick_count)?;
    buffer.write_u32::<BigEndian>(server_tick_count)?;
    buffer.write_u64::<BigEndian>(client_packets_sent)?;
    buffer.write_u64::<BigEndian>(client_packets_received)?;
    buffer.write_u64::<BigEndian>(server_packets_sent)?;
    buffer.write_u64::<BigEndian>(server_packets_received)?;
    buffer.write_u16::<BigEndian>(unknown)?;
    Ok(buffer)
}

fn serialize_reliable_data(sequence: u16, data: &[u8]) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u16::<BigEndian>(sequence)?;
    buffer.write_all(data)?;
    Ok(buffer)
}

fn serialize_sequence_only(sequence: u16) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u16::<BigEndian>(sequence)?;
    Ok(buffer)
}

fn serialize_remap_connection(session_id: u32, crc_seed: CrcSeed) -> Result<Vec<u8>, SerializeError> {
    let mut buffer = Vec::new();
    buffer.write_u32::<BigEndian>(session_id)?;
    buffer.write_u32::<BigEndian>(crc_seed)?;
    Ok(buffer)
}

/// Encodes just the fields of `packet` (no opcode, no framing).
fn serialize_packet_body(packet: &Packet) -> Result<Vec<u8>, SerializeError> {
    match packet {
        Packet::SessionRequest { protocol_version, session_id, udp_length, application_protocol } => {
            serialize_session_request(*protocol_version, *session_id, *udp_length, application_protocol)
        }
        Packet::SessionResponse {
            session_id,
            crc_seed,
            crc_length,
            is_compression_enabled,
            unknown1,
            udp_length,
            protocol_version,
        } => serialize_session_response(
            *session_id,
            *crc_seed,
            *crc_length,
            *is_compression_enabled,
            *unknown1,
            *udp_length,
            *protocol_version,
        ),
        Packet::Disconnect { session_id, reason } => serialize_disconnect(*session_id, *reason),
        Packet::Heartbeat => Ok(Vec::new()),
        Packet::NetStatusRequest {
            client_tick_count,
            last_client_update,
            average_update,
            shortest_update,
            longest_update,
            last_server_update,
            packets_sent,
            packets_received,
            unknown,
        } => serialize_net_status_request(
            *client_tick_count,
            *last_client_update,
            *average_update,
            *shortest_update,
            *longest_update,
            *last_server_update,
            *packets_sent,
            *packets_received,
            *unknown,
        ),
        Packet::NetStatusResponse {
            client_tick_count,
            server_tick_count,
            client_packets_sent,
            client_packets_received,
            server_packets_sent,
            server_packets_received,
            unknown,
        } => serialize_net_status_response(
            *client_tick_count,
            *server_tick_count,
            *client_packets_sent,
            *client_packets_received,
            *server_packets_sent,
            *server_packets_received,
            *unknown,
        ),
        Packet::ReliableData { sequence, data } => serialize_reliable_data(*sequence, data),
        Packet::ReliableDataFragment { sequence, data } => serialize_reliable_data(*sequence, data),
        Packet::Acknowledge(sequence) => serialize_sequence_only(*sequence),
        Packet::AcknowledgeAll(sequence) => serialize_sequence_only(*sequence),
        Packet::UnknownSender => Ok(Vec::new()),
        Packet::RemapConnection { session_id, crc_seed } => serialize_remap_connection(*session_id, *crc_seed),
    }
}

fn header_size(codec_params: &CodecParams) -> u32 {
    if codec_params.is_compression_enabled { 3 } else { 2 }
}

fn footer_size(codec_params: &CodecParams) -> u32 {
    codec_params.crc_length as u32
}

fn add_contextless_packets(buffers: &mut Vec<Vec<u8>>, packets: Vec<&Packet>, buffer_size: BufferSize) -> Result<(), SerializeError> {
    let mut serialized = Vec::new();
    for packet in packets {
        let mut buffer = Vec::new();
        buffer.write_u16::<BigEndian>(packet.op_code().as_u16())?;
        buffer.append(&mut serialize_packet_body(packet)?);
        serialized.push(buffer);
    }

    let max_len = serialized.iter().map(Vec::len).max().unwrap_or(0);
    if max_len > buffer_size as usize {
        return Err(SerializeError::BufferTooSmall(max_len));
    }

    buffers.append(&mut serialized);
    Ok(())
}

type PacketGroup = Vec<(ProtocolOpCode, Vec<u8>)>;

fn group_contextual_packets(
    packets: Vec<&Packet>,
    buffer_size: BufferSize,
    codec_params: &CodecParams,
) -> Result<Vec<PacketGroup>, SerializeError> {
    let mut groups = Vec::new();
    let wrapper_size = header_size(codec_params) + footer_size(codec_params);
    let data_max_size = buffer_size.saturating_sub(wrapper_size);

    let mut queue = VecDeque::new();
    for packet in packets {
        queue.push_back((packet.op_code(), serialize_packet_body(packet)?));
    }

    let mut space_left = data_max_size;
    let mut group: PacketGroup = Vec::new();

    while let Some((op_code, body)) = queue.pop_front() {
        let mut total_len = body.len();

        if !group.is_empty() {
            total_len += size_of::<u16>();
            total_len += variable_length_int_size(total_len);
        }
        if group.len() == 1 {
            total_len += size_of::<u16>();
            total_len += variable_length_int_size(group[0].1.len() + size_of::<u16>());
        }

        // The multi-packet sub-length prefix used here only ever encodes values
        // at least 2 (opcode bytes), so the wire dialect's leading-byte range
        // never needs to represent zero here.
        let can_be_sub_packet = body.len() <= u8::MAX as usize - size_of::<u16>();

        if total_len <= space_left as usize && can_be_sub_packet {
            space_left -= total_len as BufferSize;
            group.push((op_code, body));
        } else if body.len() > data_max_size as usize {
            return Err(SerializeError::BufferTooSmall(body.len()));
        } else {
            groups.push(std::mem::take(&mut group));
            space_left = data_max_size;

            if can_be_sub_packet {
                queue.push_front((op_code, body));
            } else {
                groups.push(vec![(op_code, body)]);
            }
        }
    }

    groups.push(group);
    Ok(groups)
}

fn write_header(buffer: &mut Vec<u8>, op_code: ProtocolOpCode, codec_params: &CodecParams, compressed: bool) -> Result<(), SerializeError> {
    buffer.write_u16::<BigEndian>(op_code.as_u16())?;
    if codec_params.is_compression_enabled {
        buffer.write_u8(compressed as u8)?;
    }
    Ok(())
}

fn try_compress(data: &mut Vec<u8>, codec_params: &CodecParams) -> bool {
    if codec_params.is_compression_enabled && data.len() > ZLIB_COMPRESSION_LENGTH_THRESHOLD {
        let compressed = compress_to_vec_zlib(data, ZLIB_COMPRESSION_LEVEL);
        if compressed.len() < data.len() {
            *data = compressed;
            return true;
        }
    }
    false
}

fn add_contextual_packets(
    buffers: &mut Vec<Vec<u8>>,
    packets: Vec<&Packet>,
    buffer_size: BufferSize,
    codec_params: &CodecParams,
) -> Result<(), SerializeError> {
    let groups = group_contextual_packets(packets, buffer_size, codec_params)?;

    for mut group in groups {
        if group.is_empty() {
            continue;
        }

        let mut buffer = Vec::new();
        if group.len() == 1 {
            let (op_code, mut data) = group.pop().unwrap();
            let compressed = try_compress(&mut data, codec_params);
            write_header(&mut buffer, op_code, codec_params, compressed)?;
            buffer.write_all(&data)?;
        } else {
            let mut all_data = Vec::new();
            for (op_code, data) in group {
                write_multi_packet_length(&mut all_data, data.len() as u32 + size_of::<u16>() as u32);
                all_data.write_u16::<BigEndian>(op_code.as_u16())?;
                all_data.write_all(&data)?;
            }

            let compressed = try_compress(&mut all_data, codec_params);
            write_header(&mut buffer, ProtocolOpCode::MultiPacket, codec_params, compressed)?;
            buffer.write_all(&all_data)?;
        }

        let crc = compute_crc(&buffer, codec_params.crc_seed, codec_params.crc_length);
        buffer.write_uint::<BigEndian>(crc as u64, codec_params.crc_length as usize)?;
        buffers.push(buffer);
    }

    Ok(())
}

/// Maximum payload a single non-fragment `ReliableData`/`ReliableDataFragment`
/// packet can carry under this session's framing overhead.
pub fn max_fragment_data_size(buffer_size: BufferSize, codec_params: &CodecParams) -> u32 {
    buffer_size - header_size(codec_params) - size_of::<u16>() as u32 - footer_size(codec_params)
}

pub struct SerializeParams {
    pub buffer_size: BufferSize,
    pub codec_params: Option<CodecParams>,
}

/// Serializes a batch of packets into wire-ready buffers, grouping contextual
/// packets into MultiPacket bundles where they fit.
pub fn serialize_packets(packets: &[Packet], params: &SerializeParams) -> Result<Vec<Vec<u8>>, SerializeError> {
    let (contextual, contextless): (Vec<&Packet>, Vec<&Packet>) =
        packets.iter().partition(|packet| packet.op_code().is_contextual());

    let mut buffers = Vec::new();
    add_contextless_packets(&mut buffers, contextless, params.buffer_size)?;

    if let Some(codec_params) = &params.codec_params {
        add_contextual_packets(&mut buffers, contextual, params.buffer_size, codec_params)?;
    } else if !contextual.is_empty() {
        return Err(SerializeError::MissingCodecParams);
    }

    Ok(buffers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::DisconnectReason;

    fn codec_params() -> CodecParams {
        CodecParams {
            crc_seed: 42,
            crc_length: 2,
            is_compression_enabled: false,
        }
    }

    #[test]
    fn small_contextual_packets_bundle_into_one_multi_packet() {
        let packets = vec![
            Packet::Disconnect { session_id: 1, reason: DisconnectReason::Application },
            Packet::Heartbeat,
        ];
        let params = SerializeParams { buffer_size: 512, codec_params: Some(codec_params()) };
        let buffers = serialize_packets(&packets, &params).unwrap();
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0][0..2], ProtocolOpCode::MultiPacket.as_u16().to_be_bytes());
    }

    #[test]
    fn oversized_packet_set_spills_into_multiple_buffers() {
        let mut packets = Vec::new();
        for seq in 0..100u16 {
            packets.push(Packet::ReliableData { sequence: seq, data: vec![0xAB; 40] });
        }
        let params = SerializeParams { buffer_size: 128, codec_params: Some(codec_params()) };
        let buffers = serialize_packets(&packets, &params).unwrap();
        assert!(buffers.len() > 1);
    }

    #[test]
    fn contextless_packet_has_no_crc_trailer() {
        let packets = vec![Packet::SessionRequest {
            protocol_version: 3,
            session_id: 1,
            udp_length: 512,
            application_protocol: "EchoProtocol".to_string(),
        }];
        let params = SerializeParams { buffer_size: 512, codec_params: None };
        let buffers = serialize_packets(&packets, &params).unwrap();
        assert_eq!(buffers.len(), 1);
        // 2 (opcode) + 4 + 4 + 4 + len("EchoProtocol") + 1 (nul)
        assert_eq!(buffers[0].len(), 2 + 4 + 4 + 4 + "EchoProtocol".len() + 1);
    }
}
