//! `ReliableDataOutputChannel` (spec §4.5): fragmentation, windowed transmit,
//! adaptive retransmit timer, opportunistic bundling. Grounded on
//! `fragment_data`/`DataPacket` (`src/protocol/reliable_data_ops.rs`) for the
//! fragmentation shape and `Channel::send_next`/`update_time_until_resend`
//! (`src/protocol/mod.rs`) for the window and adaptive resend timing this
//! spec's open question on `ACK_WAIT_MILLISECONDS` resolves to (SPEC_FULL §B).

use crate::protocol::cipher::encrypt_in_place;
use crate::protocol::deserialize::CodecParams;
use crate::protocol::packet::{precedes, BufferSize, Packet, SequenceNumber};
use crate::protocol::reliable::ApplicationParameters;
use crate::protocol::varint::write_data_bundle_length;
use byteorder::{BigEndian, WriteBytesExt};
use std::collections::VecDeque;
use std::mem::size_of;
use std::time::{Duration, Instant};

const ROUND_TRIP_SAMPLE_CAPACITY: usize = 16;

pub struct OutputChannelParams {
    pub buffer_size: BufferSize,
    pub codec_params: CodecParams,
    pub window_size: u16,
    pub max_queued_outgoing: usize,
    pub default_ack_wait: Duration,
}

struct InFlight {
    sequence: SequenceNumber,
    packet: Packet,
    sent_at: Option<Instant>,
    first_sent_at: Option<Instant>,
}

pub struct ReliableDataOutputChannel {
    next_sequence: SequenceNumber,
    pending: VecDeque<Vec<u8>>,
    in_flight: VecDeque<InFlight>,
    buffer_size: BufferSize,
    codec_params: CodecParams,
    window_size: u16,
    max_queued_outgoing: usize,
    default_ack_wait: Duration,
    round_trip_samples: VecDeque<Duration>,
}

impl ReliableDataOutputChannel {
    pub fn new(params: OutputChannelParams) -> Self {
        ReliableDataOutputChannel {
            next_sequence: 0,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            buffer_size: params.buffer_size,
            codec_params: params.codec_params,
            window_size: params.window_size,
            max_queued_outgoing: params.max_queued_outgoing,
            default_ack_wait: params.default_ack_wait,
            round_trip_samples: VecDeque::with_capacity(ROUND_TRIP_SAMPLE_CAPACITY),
        }
    }

    /// Queues an application buffer for eventual transmission. Returns
    /// `false` (and drops nothing) if the outgoing queue is already full.
    pub fn enqueue_data(&mut self, data: Vec<u8>) -> bool {
        if self.pending.len() + self.in_flight.len() >= self.max_queued_outgoing {
            return false;
        }
        self.pending.push_back(data);
        true
    }

    pub fn has_unacknowledged(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// How long the oldest unacknowledged, already-sent packet has been
    /// waiting, if any. The handler uses this to decide on
    /// `UnacknowledgedTimeout`.
    pub fn oldest_unacknowledged_age(&self, now: Instant) -> Option<Duration> {
        self.in_flight
            .front()
            .and_then(|entry| entry.first_sent_at)
            .map(|sent_at| now.duration_since(sent_at))
    }

    fn current_ack_wait(&self) -> Duration {
        if self.round_trip_samples.is_empty() {
            return self.default_ack_wait;
        }
        let mut sorted: Vec<Duration> = self.round_trip_samples.iter().copied().collect();
        sorted.sort();
        let median = sorted[sorted.len() / 2];
        // Pad the observed round trip generously; never exceed the fixed ceiling.
        (median * 2).min(self.default_ack_wait)
    }

    fn record_round_trip(&mut self, sample: Duration) {
        if self.round_trip_samples.len() >= ROUND_TRIP_SAMPLE_CAPACITY {
            self.round_trip_samples.pop_front();
        }
        self.round_trip_samples.push_back(sample);
    }

    fn max_single_payload_len(&self) -> usize {
        crate::protocol::serialize::max_fragment_data_size(self.buffer_size, &self.codec_params) as usize
    }

    fn take_next_unit(&mut self, app: &mut ApplicationParameters) -> Option<Vec<u8>> {
        let single_cap = self.max_single_payload_len();
        let first_len = self.pending.front()?.len();

        if first_len > single_cap {
            let buf = self.pending.pop_front().unwrap();
            return Some(self.maybe_encrypt(app, buf));
        }

        let mut items: Vec<Vec<u8>> = Vec::new();
        let mut used = 2usize; // 0x00 0x19 bundle indicator
        while let Some(next) = self.pending.front() {
            if next.len() > single_cap {
                break;
            }
            let mut header = Vec::new();
            write_data_bundle_length(&mut header, next.len() as u32);
            let needed = header.len() + next.len();
            if used + needed > single_cap {
                break;
            }
            used += needed;
            items.push(self.pending.pop_front().unwrap());
        }

        if items.is_empty() {
            // The lone front buffer fits a single `ReliableData` but not the
            // bundle indicator plus its own length header; send it unbundled.
            let buf = self.pending.pop_front().expect("checked non-empty above");
            return Some(self.maybe_encrypt(app, buf));
        }

        if items.len() == 1 {
            let buf = items.into_iter().next().expect("checked len == 1 above");
            return Some(self.maybe_encrypt(app, buf));
        }

        let mut bundle = vec![0x00u8, 0x19];
        for item in &items {
            write_data_bundle_length(&mut bundle, item.len() as u32);
            bundle.extend_from_slice(item);
        }
        Some(self.maybe_encrypt(app, bundle))
    }

    fn maybe_encrypt(&self, app: &mut ApplicationParameters, mut buf: Vec<u8>) -> Vec<u8> {
        if app.is_encryption_enabled() {
            if let Some(state) = app.outbound_cipher.as_mut() {
                encrypt_in_place(state, &mut buf);
            }
        }
        buf
    }

    fn fragment_unit(&self, unit: Vec<u8>) -> Vec<Packet> {
        let single_cap = self.max_single_payload_len();
        if unit.len() <= single_cap {
            let sequence = unit.len() as u16; // placeholder, overwritten by caller
            let _ = sequence;
            return vec![Packet::ReliableData { sequence: 0, data: unit }];
        }

        let mut packets = Vec::new();
        let mut remaining = &unit[..];
        let mut first = true;
        while !remaining.is_empty() {
            let mut chunk = Vec::new();
            let mut take = single_cap.min(remaining.len());
            if first {
                chunk.write_u32::<BigEndian>(unit.len() as u32).expect("Vec write is infallible");
                take = take.saturating_sub(size_of::<u32>());
                first = false;
            }
            chunk.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            packets.push(Packet::ReliableDataFragment { sequence: 0, data: chunk });
        }
        packets
    }

    /// Admits new units from the pending queue while there's window room,
    /// then emits everything due to be (re)sent this tick.
    pub fn tick(&mut self, now: Instant, app: &mut ApplicationParameters) -> Vec<Packet> {
        while self.in_flight.len() < self.window_size as usize {
            let Some(unit) = self.take_next_unit(app) else { break };
            for mut packet in self.fragment_unit(unit) {
                let sequence = self.next_sequence;
                self.next_sequence = self.next_sequence.wrapping_add(1);
                match &mut packet {
                    Packet::ReliableData { sequence: s, .. } | Packet::ReliableDataFragment { sequence: s, .. } => {
                        *s = sequence;
                    }
                    _ => unreachable!("fragment_unit only produces reliable data packets"),
                }
                self.in_flight.push_back(InFlight { sequence, packet, sent_at: None, first_sent_at: None });
            }
        }

        let ack_wait = self.current_ack_wait();
        let resend_due = self
            .in_flight
            .front()
            .and_then(|entry| entry.sent_at)
            .map(|sent_at| now.duration_since(sent_at) > ack_wait)
            .unwrap_or(false);

        let mut to_send = Vec::new();
        for entry in self.in_flight.iter_mut() {
            if entry.sent_at.is_none() || resend_due {
                to_send.push(entry.packet.clone());
                entry.sent_at = Some(now);
                if entry.first_sent_at.is_none() {
                    entry.first_sent_at = Some(now);
                }
            }
        }
        to_send
    }

    fn remove_acknowledged(&mut self, sequence: SequenceNumber, now: Instant) {
        if let Some(pos) = self.in_flight.iter().position(|entry| entry.sequence == sequence) {
            if let Some(entry) = self.in_flight.remove(pos) {
                if let Some(first_sent) = entry.first_sent_at {
                    self.record_round_trip(now.duration_since(first_sent));
                }
            }
        }
    }

    pub fn on_acknowledge(&mut self, sequence: SequenceNumber, now: Instant) {
        self.remove_acknowledged(sequence, now);
    }

    pub fn on_acknowledge_all(&mut self, sequence: SequenceNumber, now: Instant) {
        let to_remove: Vec<SequenceNumber> = self
            .in_flight
            .iter()
            .map(|entry| entry.sequence)
            .filter(|&s| s == sequence || precedes(s, sequence))
            .collect();
        for s in to_remove {
            self.remove_acknowledged(s, now);
        }
    }
}
