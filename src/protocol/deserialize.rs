//! Packet deserialization (spec §4.1): framing, CRC validation, decompression,
//! then per-opcode field decoding. MultiPacket contents are flattened inline.

use crate::protocol::crc::{compute_crc, CrcSeed, CrcSize};
use crate::protocol::packet::{DisconnectReason, Packet, ProtocolOpCode};
use crate::protocol::varint::read_multi_packet_length;
use byteorder::{BigEndian, ReadBytesExt};
use miniz_oxide::inflate::{decompress_to_vec_zlib, DecompressError};
use std::io::{Cursor, Error, Read};
use std::mem::size_of;

#[non_exhaustive]
#[derive(Debug)]
pub enum DeserializeError {
    Io(Error),
    Decompress(DecompressError),
    UnknownOpCode(u16),
    CrcMismatch { expected: u32, actual: u32, seed: CrcSeed, size: CrcSize },
    TooShort,
    BadSubPacketLength,
}

impl From<Error> for DeserializeError {
    fn from(value: Error) -> Self {
        DeserializeError::Io(value)
    }
}

impl From<DecompressError> for DeserializeError {
    fn from(value: DecompressError) -> Self {
        DeserializeError::Decompress(value)
    }
}

/// Parameters a session carries over from negotiation, needed to make sense
/// of any contextual packet's framing.
#[derive(Clone, Copy, Debug)]
pub struct CodecParams {
    pub crc_seed: CrcSeed,
    pub crc_length: CrcSize,
    pub is_compression_enabled: bool,
}

fn check_op_code(op_code: u16) -> Result<ProtocolOpCode, DeserializeError> {
    ProtocolOpCode::from_u16(op_code).ok_or(DeserializeError::UnknownOpCode(op_code))
}

fn deserialize_session_request(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    let protocol_version = cursor.read_u32::<BigEndian>()?;
    let session_id = cursor.read_u32::<BigEndian>()?;
    let udp_length = cursor.read_u32::<BigEndian>()?;
    let mut application_protocol = String::new();
    cursor.read_to_string(&mut application_protocol)?;
    // Trailing NUL terminator, if present, isn't part of the protocol name.
    if application_protocol.ends_with('\0') {
        application_protocol.pop();
    }

    Ok(vec![Packet::SessionRequest {
        protocol_version,
        session_id,
        udp_length,
        application_protocol,
    }])
}

fn deserialize_session_response(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    let session_id = cursor.read_u32::<BigEndian>()?;
    let crc_seed = cursor.read_u32::<BigEndian>()?;
    let crc_length = cursor.read_u8()?;
    let is_compression_enabled = cursor.read_u8()? != 0;
    let unknown1 = cursor.read_u8()? != 0;
    let udp_length = cursor.read_u32::<BigEndian>()?;
    let protocol_version = cursor.read_u32::<BigEndian>()?;

    Ok(vec![Packet::SessionResponse {
        session_id,
        crc_seed,
        crc_length,
        is_compression_enabled,
        unknown1,
        udp_length,
        protocol_version,
    }])
}

fn deserialize_multi_packet(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut offset = 0;
    let mut packets = Vec::new();

    while offset < data.len() {
        let mut length_cursor = Cursor::new(&data[offset..]);
        let packet_length = read_multi_packet_length(&mut length_cursor)?;
        offset += length_cursor.position() as usize;

        if packet_length as usize > data.len().saturating_sub(offset) {
            return Err(DeserializeError::BadSubPacketLength);
        }
        if (packet_length as usize) < size_of::<u16>() {
            return Err(DeserializeError::BadSubPacketLength);
        }

        let mut sub_cursor = Cursor::new(&data[offset..]);
        let op_code = check_op_code(sub_cursor.read_u16::<BigEndian>()?)?;
        offset += size_of::<u16>();
        let remaining_length = packet_length as usize - size_of::<u16>();

        let mut new_packets = deserialize_packet_data(&data[offset..offset + remaining_length], op_code)?;
        packets.append(&mut new_packets);
        offset += remaining_length;
    }

    Ok(packets)
}

fn deserialize_disconnect(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    let session_id = cursor.read_u32::<BigEndian>()?;
    let reason = DisconnectReason::from_u16(cursor.read_u16::<BigEndian>()?);
    Ok(vec![Packet::Disconnect { session_id, reason }])
}

fn deserialize_net_status_request(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    Ok(vec![Packet::NetStatusRequest {
        client_tick_count: cursor.read_u16::<BigEndian>()?,
        last_client_update: cursor.read_u32::<BigEndian>()?,
        average_update: cursor.read_u32::<BigEndian>()?,
        shortest_update: cursor.read_u32::<BigEndian>()?,
        longest_update: cursor.read_u32::<BigEndian>()?,
        last_server_update: cursor.read_u32::<BigEndian>()?,
        packets_sent: cursor.read_u64::<BigEndian>()?,
        packets_received: cursor.read_u64::<BigEndian>()?,
        unknown: cursor.read_u16::<BigEndian>()?,
    }])
}

fn deserialize_net_status_response(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    Ok(vec![Packet::NetStatusResponse {
        client_tick_count: cursor.read_u16::<BigEndian>()?,
        server_tick_count: cursor.read_u32::<BigEndian>()?,
        client_packets_sent: cursor.read_u64::<BigEndian>()?,
        client_packets_received: cursor.read_u64::<BigEndian>()?,
        server_packets_sent: cursor.read_u64::<BigEndian>()?,
        server_packets_received: cursor.read_u64::<BigEndian>()?,
        unknown: cursor.read_u16::<BigEndian>()?,
    }])
}

fn deserialize_reliable_data(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    if data.len() < size_of::<u16>() {
        return Err(DeserializeError::TooShort);
    }
    let mut cursor = Cursor::new(data);
    let sequence = cursor.read_u16::<BigEndian>()?;
    Ok(vec![Packet::ReliableData {
        sequence,
        data: data[size_of::<u16>()..].to_vec(),
    }])
}

fn deserialize_reliable_data_fragment(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    if data.len() < size_of::<u16>() {
        return Err(DeserializeError::TooShort);
    }
    let mut cursor = Cursor::new(data);
    let sequence = cursor.read_u16::<BigEndian>()?;
    Ok(vec![Packet::ReliableDataFragment {
        sequence,
        data: data[size_of::<u16>()..].to_vec(),
    }])
}

fn deserialize_acknowledge(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    Ok(vec![Packet::Acknowledge(cursor.read_u16::<BigEndian>()?)])
}

fn deserialize_acknowledge_all(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    Ok(vec![Packet::AcknowledgeAll(cursor.read_u16::<BigEndian>()?)])
}

fn deserialize_remap_connection(data: &[u8]) -> Result<Vec<Packet>, DeserializeError> {
    let mut cursor = Cursor::new(data);
    let session_id = cursor.read_u32::<BigEndian>()?;
    let crc_seed = cursor.read_u32::<BigEndian>()?;
    Ok(vec![Packet::RemapConnection { session_id, crc_seed }])
}

fn deserialize_packet_data(data: &[u8], op_code: ProtocolOpCode) -> Result<Vec<Packet>, DeserializeError> {
    match op_code {
        ProtocolOpCode::SessionRequest => deserialize_session_request(data),
        ProtocolOpCode::SessionResponse => deserialize_session_response(data),
        ProtocolOpCode::MultiPacket => deserialize_multi_packet(data),
        ProtocolOpCode::Disconnect => deserialize_disconnect(data),
        ProtocolOpCode::Heartbeat => Ok(vec![Packet::Heartbeat]),
        ProtocolOpCode::NetStatusRequest => deserialize_net_status_request(data),
        ProtocolOpCode::NetStatusResponse => deserialize_net_status_response(data),
        ProtocolOpCode::ReliableData => deserialize_reliable_data(data),
        ProtocolOpCode::ReliableDataFragment => deserialize_reliable_data_fragment(data),
        ProtocolOpCode::Acknowledge => deserialize_acknowledge(data),
        ProtocolOpCode::AcknowledgeAll => deserialize_acknowledge_all(data),
        ProtocolOpCode::UnknownSender => Ok(vec![Packet::UnknownSender]),
        ProtocolOpCode::RemapConnection => deserialize_remap_connection(data),
    }
}

/// Top-level entry point: validates framing (CRC, decompresses) for
/// contextual packets, then decodes fields. Contextless packets skip framing
/// entirely and are decoded directly after the opcode.
pub fn deserialize_packet(data: &[u8], codec_params: Option<CodecParams>) -> Result<Vec<Packet>, DeserializeError> {
    if data.len() < size_of::<u16>() {
        return Err(DeserializeError::TooShort);
    }
    let mut cursor = Cursor::new(data);
    let op_code = check_op_code(cursor.read_u16::<BigEndian>()?)?;

    let packet_data = if op_code.is_contextual() {
        let params = codec_params.unwrap_or(CodecParams {
            crc_seed: 0,
            crc_length: 0,
            is_compression_enabled: false,
        });

        let compressed = params.is_compression_enabled && {
            if data.len() < size_of::<u16>() + 1 {
                return Err(DeserializeError::TooShort);
            }
            cursor.read_u8()? != 0
        };

        let data_offset = size_of::<u16>() + if params.is_compression_enabled { 1 } else { 0 };
        let crc_offset = data.len().checked_sub(params.crc_length as usize).unwrap_or(data_offset);
        if crc_offset < data_offset {
            return Err(DeserializeError::TooShort);
        }

        let mut crc_cursor = Cursor::new(data);
        crc_cursor.set_position(crc_offset as u64);
        let expected = crc_cursor.read_uint::<BigEndian>(params.crc_length as usize)? as u32;

        let mut body = data[data_offset..crc_offset].to_vec();
        if compressed {
            body = decompress_to_vec_zlib(&body)?;
        }

        let actual = compute_crc(&data[..crc_offset], params.crc_seed, params.crc_length);
        if actual != expected {
            return Err(DeserializeError::CrcMismatch {
                expected,
                actual,
                seed: params.crc_seed,
                size: params.crc_length,
            });
        }

        body
    } else {
        data[size_of::<u16>()..].to_vec()
    };

    deserialize_packet_data(&packet_data, op_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::serialize::{serialize_packets, SerializeParams};

    fn codec_params() -> CodecParams {
        CodecParams {
            crc_seed: 42,
            crc_length: 2,
            is_compression_enabled: false,
        }
    }

    #[test]
    fn heartbeat_round_trips() {
        let params = SerializeParams {
            buffer_size: 512,
            codec_params: Some(codec_params()),
        };
        let buffers = serialize_packets(&[Packet::Heartbeat], &params).unwrap();
        assert_eq!(buffers.len(), 1);
        let decoded = deserialize_packet(&buffers[0], Some(codec_params())).unwrap();
        assert_eq!(decoded, vec![Packet::Heartbeat]);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let params = SerializeParams {
            buffer_size: 512,
            codec_params: Some(codec_params()),
        };
        let mut buffers = serialize_packets(&[Packet::Heartbeat], &params).unwrap();
        let last = buffers[0].len() - 1;
        buffers[0][last] ^= 0xFF;
        let result = deserialize_packet(&buffers[0], Some(codec_params()));
        assert!(matches!(result, Err(DeserializeError::CrcMismatch { .. })));
    }

    #[test]
    fn session_request_is_contextless_and_needs_no_codec_params() {
        let packet = Packet::SessionRequest {
            protocol_version: 3,
            session_id: 7,
            udp_length: 512,
            application_protocol: "EchoProtocol".to_string(),
        };
        let params = SerializeParams {
            buffer_size: 512,
            codec_params: None,
        };
        let buffers = serialize_packets(&[packet.clone()], &params).unwrap();
        let decoded = deserialize_packet(&buffers[0], None).unwrap();
        assert_eq!(decoded, vec![packet]);
    }
}
