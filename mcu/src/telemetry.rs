//! Telemetry records streamed by the MCU and the buffer that
//! reassembles them from an unreliable byte stream.
//!
//! Record layout (10 bytes):
//!
//! ```text
//! byte 0       header: bits 7..5 = 0b101 sync marker
//!                      bit  4    = motion-complete flag
//!                      bits 3..0 = tick counter (mod 16, +1 per record)
//! bytes 1..4   X position, i24 big-endian two's complement
//! bytes 4..7   Y position, i24 BE
//! bytes 7..10  Z position, i24 BE
//! ```
//!
//! The MCU emits one record per 5 ms timer tick and batches 50 of them
//! into each 500-byte update. Ticks are consecutive (mod 16) across
//! records, which is what alignment validation keys on.

use crate::{Axis, AxisPosition, ProtocolError, N_BYTES_POS, RECORD_LENGTH};

const MARKER_MASK: u8 = 0b1110_0000;
const MARKER: u8 = 0b1010_0000;
const COMPLETE_FLAG: u8 = 0b0001_0000;
const TICK_MASK: u8 = 0b0000_1111;
const TICK_MODULUS: u8 = 16;

/// Consecutive records that must validate before the buffer trusts an
/// alignment.
const SYNC_WINDOW: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryRecord {
    /// Wrapping tick counter, 0..16.
    pub tick: u8,
    pub motion_complete: bool,
    pub position: AxisPosition,
}

impl TelemetryRecord {
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != RECORD_LENGTH {
            return Err(ProtocolError::FrameLength {
                expected: RECORD_LENGTH,
                got: bytes.len(),
            });
        }

        let header = bytes[0];
        if header & MARKER_MASK != MARKER {
            return Err(ProtocolError::Marker(header));
        }

        let mut position = AxisPosition::default();
        for (index, axis) in Axis::ALL.into_iter().enumerate() {
            let offset = 1 + index * N_BYTES_POS;
            position.set(axis, decode_i24(&bytes[offset..offset + N_BYTES_POS]));
        }

        Ok(Self {
            tick: header & TICK_MASK,
            motion_complete: header & COMPLETE_FLAG != 0,
            position,
        })
    }

    pub fn encode(&self) -> [u8; RECORD_LENGTH] {
        let mut buf = [0u8; RECORD_LENGTH];
        buf[0] = MARKER | (self.tick & TICK_MASK);
        if self.motion_complete {
            buf[0] |= COMPLETE_FLAG;
        }

        for (index, axis) in Axis::ALL.into_iter().enumerate() {
            let offset = 1 + index * N_BYTES_POS;
            buf[offset..offset + N_BYTES_POS].copy_from_slice(&encode_i24(self.position.get(axis)));
        }

        buf
    }

    fn follows(&self, previous: u8) -> bool {
        self.tick == (previous + 1) % TICK_MODULUS
    }
}

fn encode_i24(steps: i32) -> [u8; N_BYTES_POS] {
    let bytes = steps.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

fn decode_i24(bytes: &[u8]) -> i32 {
    let raw = ((bytes[0] as i32) << 16) | ((bytes[1] as i32) << 8) | bytes[2] as i32;
    // Sign-extend from 24 bits.
    (raw << 8) >> 8
}

/// Reassembles aligned telemetry records from arbitrarily chunked
/// bytes. After a reconnect (or any validation failure) the buffer
/// resynchronizes by scanning for the first offset where the header
/// marker and tick continuity hold over [`SYNC_WINDOW`] records.
#[derive(Debug, Default)]
pub struct TelemetryBuffer {
    buf: Vec<u8>,
    synced: bool,
    ever_synced: bool,
    resyncs: u64,
    last_tick: Option<u8>,
}

impl TelemetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the buffer has had to re-establish record alignment after
    /// initially acquiring it.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Discard buffered bytes and force a fresh alignment scan. Called
    /// after the transport reconnects, when no assumption about record
    /// boundaries survives.
    pub fn mark_lost(&mut self) {
        self.buf.clear();
        self.synced = false;
        self.last_tick = None;
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode every complete, aligned record currently buffered,
    /// preserving arrival order. The undecodable tail stays buffered.
    pub fn drain_records(&mut self) -> Vec<TelemetryRecord> {
        let mut records = Vec::new();

        loop {
            if !self.synced && !self.try_sync() {
                return records;
            }

            while self.buf.len() >= RECORD_LENGTH {
                match TelemetryRecord::decode(&self.buf[..RECORD_LENGTH]) {
                    Ok(record)
                        if self
                            .last_tick
                            .map_or(true, |previous| record.follows(previous)) =>
                    {
                        self.buf.drain(..RECORD_LENGTH);
                        self.last_tick = Some(record.tick);
                        records.push(record);
                    }
                    _ => {
                        // Alignment no longer holds; rescan.
                        self.synced = false;
                        self.last_tick = None;
                        break;
                    }
                }
            }

            if self.synced {
                return records;
            }
        }
    }

    fn try_sync(&mut self) -> bool {
        let window_len = SYNC_WINDOW * RECORD_LENGTH;
        if self.buf.len() < window_len {
            return false;
        }

        for offset in 0..=self.buf.len() - window_len {
            if self.window_aligned(offset) {
                self.buf.drain(..offset);
                self.synced = true;
                self.last_tick = None;
                if self.ever_synced {
                    self.resyncs += 1;
                }
                self.ever_synced = true;
                return true;
            }
        }

        // No alignment anywhere; keep only the bytes that could still
        // start a valid window once more data arrives.
        let keep_from = self.buf.len() - (window_len - 1);
        self.buf.drain(..keep_from);
        false
    }

    fn window_aligned(&self, offset: usize) -> bool {
        let mut previous: Option<u8> = None;

        for index in 0..SYNC_WINDOW {
            let start = offset + index * RECORD_LENGTH;
            let record = match TelemetryRecord::decode(&self.buf[start..start + RECORD_LENGTH]) {
                Ok(record) => record,
                Err(_) => return false,
            };

            if let Some(previous) = previous {
                if !record.follows(previous) {
                    return false;
                }
            }
            previous = Some(record.tick);
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AxisPosition, MSG_LENGTH, TIMEPOINT_PER_UPDATE};

    fn record(tick: u8, x: i32, complete: bool) -> TelemetryRecord {
        TelemetryRecord {
            tick: tick % TICK_MODULUS,
            motion_complete: complete,
            position: AxisPosition::new(x, -x, x / 2),
        }
    }

    fn update_message(start_tick: u8, complete: bool) -> (Vec<TelemetryRecord>, Vec<u8>) {
        let records: Vec<_> = (0..TIMEPOINT_PER_UPDATE as u8)
            .map(|i| record(start_tick.wrapping_add(i), 1000 + i as i32, complete))
            .collect();
        let bytes: Vec<u8> = records.iter().flat_map(|r| r.encode()).collect();
        (records, bytes)
    }

    #[test]
    fn record_round_trip_preserves_negative_positions() {
        let original = TelemetryRecord {
            tick: 13,
            motion_complete: true,
            position: AxisPosition::new(-1, 8_388_607, -8_388_608),
        };

        let decoded = TelemetryRecord::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn missing_marker_is_rejected() {
        let mut bytes = record(0, 5, false).encode();
        bytes[0] &= !MARKER_MASK;
        assert!(matches!(
            TelemetryRecord::decode(&bytes),
            Err(ProtocolError::Marker(_))
        ));
    }

    #[test]
    fn whole_update_decodes_in_order() {
        let (records, bytes) = update_message(3, false);
        assert_eq!(bytes.len(), MSG_LENGTH);

        let mut buffer = TelemetryBuffer::new();
        buffer.extend(&bytes);
        assert_eq!(buffer.drain_records(), records);
        assert_eq!(buffer.resyncs(), 0);
    }

    #[test]
    fn chunked_delivery_matches_whole_delivery() {
        let (records, bytes) = update_message(0, true);

        // Split at deliberately awkward boundaries.
        for chunk_len in [1usize, 3, 7, 10, 13, 499] {
            let mut buffer = TelemetryBuffer::new();
            let mut reassembled = Vec::new();

            for chunk in bytes.chunks(chunk_len) {
                buffer.extend(chunk);
                reassembled.extend(buffer.drain_records());
            }

            assert_eq!(reassembled, records, "chunk length {chunk_len}");
        }
    }

    #[test]
    fn misaligned_stream_resynchronizes() {
        let (first, first_bytes) = update_message(0, false);
        let (second, second_bytes) = update_message(50, false);

        let mut buffer = TelemetryBuffer::new();
        buffer.extend(&first_bytes);
        assert_eq!(buffer.drain_records(), first);

        // Reconnect mid-record: the next update arrives with a torn
        // prefix from an old record in front of it.
        buffer.mark_lost();
        buffer.extend(&first_bytes[..6]);
        buffer.extend(&second_bytes);
        assert_eq!(buffer.drain_records(), second);
        assert_eq!(buffer.resyncs(), 1);
    }

    #[test]
    fn tick_discontinuity_triggers_rescan() {
        let (_, first_bytes) = update_message(0, false);
        let (second, second_bytes) = update_message(9, false);

        let mut buffer = TelemetryBuffer::new();
        // Only the tail of the first update survives, then a jump in
        // tick numbering where records were dropped.
        buffer.extend(&first_bytes[..5 * RECORD_LENGTH]);
        buffer.extend(&second_bytes);

        let records = buffer.drain_records();
        // The five leading records decode, then the discontinuity
        // forces a rescan which locks onto the second update.
        assert_eq!(records.len(), 5 + second.len());
        assert_eq!(&records[5..], &second[..]);
    }
}
