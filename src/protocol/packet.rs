//! Wire packet shapes (spec §4.1).

pub type SequenceNumber = u16;
pub type SessionId = u32;
pub type SoeProtocolVersion = u32;
pub type BufferSize = u32;

pub const SOE_PROTOCOL_VERSION: SoeProtocolVersion = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ProtocolOpCode {
    SessionRequest,
    SessionResponse,
    MultiPacket,
    Disconnect,
    Heartbeat,
    NetStatusRequest,
    NetStatusResponse,
    ReliableData,
    ReliableDataFragment,
    Acknowledge,
    AcknowledgeAll,
    UnknownSender,
    RemapConnection,
}

impl ProtocolOpCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ProtocolOpCode::SessionRequest => 0x01,
            ProtocolOpCode::SessionResponse => 0x02,
            ProtocolOpCode::MultiPacket => 0x03,
            ProtocolOpCode::Disconnect => 0x05,
            ProtocolOpCode::Heartbeat => 0x06,
            ProtocolOpCode::NetStatusRequest => 0x07,
            ProtocolOpCode::NetStatusResponse => 0x08,
            ProtocolOpCode::ReliableData => 0x09,
            ProtocolOpCode::ReliableDataFragment => 0x0D,
            ProtocolOpCode::Acknowledge => 0x11,
            ProtocolOpCode::AcknowledgeAll => 0x15,
            ProtocolOpCode::UnknownSender => 0x1D,
            ProtocolOpCode::RemapConnection => 0x1E,
        }
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x01 => ProtocolOpCode::SessionRequest,
            0x02 => ProtocolOpCode::SessionResponse,
            0x03 => ProtocolOpCode::MultiPacket,
            0x05 => ProtocolOpCode::Disconnect,
            0x06 => ProtocolOpCode::Heartbeat,
            0x07 => ProtocolOpCode::NetStatusRequest,
            0x08 => ProtocolOpCode::NetStatusResponse,
            0x09 => ProtocolOpCode::ReliableData,
            0x0D => ProtocolOpCode::ReliableDataFragment,
            0x11 => ProtocolOpCode::Acknowledge,
            0x15 => ProtocolOpCode::AcknowledgeAll,
            0x1D => ProtocolOpCode::UnknownSender,
            0x1E => ProtocolOpCode::RemapConnection,
            _ => return None,
        })
    }

    /// Contextless packets carry no CRC, ignore the compression flag, and are
    /// never folded into a MultiPacket.
    pub fn is_contextual(self) -> bool {
        !matches!(
            self,
            ProtocolOpCode::SessionRequest
                | ProtocolOpCode::SessionResponse
                | ProtocolOpCode::UnknownSender
                | ProtocolOpCode::RemapConnection
        )
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum DisconnectReason {
    Unknown = 0,
    IcmpError = 1,
    Timeout = 2,
    OtherSideTerminated = 3,
    ManagerDeleted = 4,
    ConnectFail = 5,
    Application = 6,
    UnreachableConnection = 7,
    UnacknowledgedTimeout = 8,
    NewConnectionAttempt = 9,
    ConnectionRefused = 10,
    ConnectError = 11,
    ConnectingToSelf = 12,
    ReliableOverflow = 13,
    ApplicationReleased = 14,
    CorruptPacket = 15,
    ProtocolMismatch = 16,
}

impl DisconnectReason {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => DisconnectReason::IcmpError,
            2 => DisconnectReason::Timeout,
            3 => DisconnectReason::OtherSideTerminated,
            4 => DisconnectReason::ManagerDeleted,
            5 => DisconnectReason::ConnectFail,
            6 => DisconnectReason::Application,
            7 => DisconnectReason::UnreachableConnection,
            8 => DisconnectReason::UnacknowledgedTimeout,
            9 => DisconnectReason::NewConnectionAttempt,
            10 => DisconnectReason::ConnectionRefused,
            11 => DisconnectReason::ConnectError,
            12 => DisconnectReason::ConnectingToSelf,
            13 => DisconnectReason::ReliableOverflow,
            14 => DisconnectReason::ApplicationReleased,
            15 => DisconnectReason::CorruptPacket,
            16 => DisconnectReason::ProtocolMismatch,
            _ => DisconnectReason::Unknown,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// A single decoded logical packet. MultiPacket contents are flattened by the
/// deserializer into a sequence of these rather than kept as a nested variant
/// (mirrors the teacher's `deserialize_packet` call sites, which recurse and
/// collect rather than return a tree).
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    SessionRequest {
        protocol_version: SoeProtocolVersion,
        session_id: SessionId,
        udp_length: BufferSize,
        application_protocol: String,
    },
    SessionResponse {
        session_id: SessionId,
        crc_seed: u32,
        crc_length: u8,
        is_compression_enabled: bool,
        unknown1: bool,
        udp_length: BufferSize,
        protocol_version: SoeProtocolVersion,
    },
    Disconnect {
        session_id: SessionId,
        reason: DisconnectReason,
    },
    Heartbeat,
    NetStatusRequest {
        client_tick_count: u16,
        last_client_update: u32,
        average_update: u32,
        shortest_update: u32,
        longest_update: u32,
        last_server_update: u32,
        packets_sent: u64,
        packets_received: u64,
        unknown: u16,
    },
    NetStatusResponse {
        client_tick_count: u16,
        server_tick_count: u32,
        client_packets_sent: u64,
        client_packets_received: u64,
        server_packets_sent: u64,
        server_packets_received: u64,
        unknown: u16,
    },
    ReliableData {
        sequence: SequenceNumber,
        data: Vec<u8>,
    },
    ReliableDataFragment {
        sequence: SequenceNumber,
        data: Vec<u8>,
    },
    Acknowledge(SequenceNumber),
    AcknowledgeAll(SequenceNumber),
    UnknownSender,
    RemapConnection {
        session_id: SessionId,
        crc_seed: u32,
    },
}

impl Packet {
    pub fn op_code(&self) -> ProtocolOpCode {
        match self {
            Packet::SessionRequest { .. } => ProtocolOpCode::SessionRequest,
            Packet::SessionResponse { .. } => ProtocolOpCode::SessionResponse,
            Packet::Disconnect { .. } => ProtocolOpCode::Disconnect,
            Packet::Heartbeat => ProtocolOpCode::Heartbeat,
            Packet::NetStatusRequest { .. } => ProtocolOpCode::NetStatusRequest,
            Packet::NetStatusResponse { .. } => ProtocolOpCode::NetStatusResponse,
            Packet::ReliableData { .. } => ProtocolOpCode::ReliableData,
            Packet::ReliableDataFragment { .. } => ProtocolOpCode::ReliableDataFragment,
            Packet::Acknowledge(_) => ProtocolOpCode::Acknowledge,
            Packet::AcknowledgeAll(_) => ProtocolOpCode::AcknowledgeAll,
            Packet::UnknownSender => ProtocolOpCode::UnknownSender,
            Packet::RemapConnection { .. } => ProtocolOpCode::RemapConnection,
        }
    }

    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        match self {
            Packet::ReliableData { sequence, .. } | Packet::ReliableDataFragment { sequence, .. } => {
                Some(*sequence)
            }
            Packet::Acknowledge(sequence) | Packet::AcknowledgeAll(sequence) => Some(*sequence),
            _ => None,
        }
    }
}

/// True iff `a` is considered to come before `b` on the 16-bit sequence
/// space, i.e. `b` is within the next half of the space after `a` (spec §4.4
/// sliding-window comparison).
pub fn precedes(a: SequenceNumber, b: SequenceNumber) -> bool {
    b.wrapping_sub(a) != 0 && b.wrapping_sub(a) < 0x8000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips() {
        for op in [
            ProtocolOpCode::SessionRequest,
            ProtocolOpCode::SessionResponse,
            ProtocolOpCode::MultiPacket,
            ProtocolOpCode::Disconnect,
            ProtocolOpCode::Heartbeat,
            ProtocolOpCode::NetStatusRequest,
            ProtocolOpCode::NetStatusResponse,
            ProtocolOpCode::ReliableData,
            ProtocolOpCode::ReliableDataFragment,
            ProtocolOpCode::Acknowledge,
            ProtocolOpCode::AcknowledgeAll,
            ProtocolOpCode::UnknownSender,
            ProtocolOpCode::RemapConnection,
        ] {
            assert_eq!(ProtocolOpCode::from_u16(op.as_u16()), Some(op));
        }
    }

    #[test]
    fn contextless_opcodes_are_exactly_four() {
        let contextless: Vec<_> = [
            ProtocolOpCode::SessionRequest,
            ProtocolOpCode::SessionResponse,
            ProtocolOpCode::MultiPacket,
            ProtocolOpCode::Disconnect,
            ProtocolOpCode::Heartbeat,
            ProtocolOpCode::NetStatusRequest,
            ProtocolOpCode::NetStatusResponse,
            ProtocolOpCode::ReliableData,
            ProtocolOpCode::ReliableDataFragment,
            ProtocolOpCode::Acknowledge,
            ProtocolOpCode::AcknowledgeAll,
            ProtocolOpCode::UnknownSender,
            ProtocolOpCode::RemapConnection,
        ]
        .into_iter()
        .filter(|op| !op.is_contextual())
        .collect();
        assert_eq!(contextless.len(), 4);
    }

    #[test]
    fn precedes_wraps_around_the_16_bit_space() {
        assert!(precedes(0, 1));
        assert!(precedes(0xFFFF, 0));
        assert!(!precedes(0, 0x8000));
        assert!(!precedes(5, 5));
        assert!(!precedes(5, 4));
    }
}
