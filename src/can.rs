//! CAN envelope types moved between the receive/send loops and the
//! pub/sub channels. The daemon never parses frame payloads (non-goal);
//! these are deliberately opaque byte batches plus the bookkeeping needed
//! to route and age them.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A batch of CAN frames read off one board's receive buffer, verbatim.
/// Bus indices inside the batch have already been shifted by the board's
/// `bus_shift` so downstream consumers see a unified 0/1/2 numbering.
#[derive(Clone, Debug)]
pub struct CanEnvelope {
    pub bytes: Vec<u8>,
}

impl CanEnvelope {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// `Instant` has no epoch, so it can't be serialized directly; every
/// `SendCanEvent` on the wire carries its log timestamp as nanoseconds
/// since this process's first observation of the monotonic clock, and
/// `decode` rebuilds an `Instant` from that offset. This is the stand-in
/// for the real fabric's monotonic log timestamp (spec §3, §6).
fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

const LOG_TIME_LEN: usize = 8;

/// An inbound `sendcan` event: a batch of frames to forward, stamped with
/// the monotonic time it was logged so the send loop can drop it if it's
/// gone stale in transit.
#[derive(Clone, Debug)]
pub struct SendCanEvent {
    pub log_mono_time: Instant,
    pub frames: Vec<u8>,
}

impl SendCanEvent {
    pub fn new(frames: Vec<u8>) -> Self {
        Self {
            log_mono_time: Instant::now(),
            frames,
        }
    }

    /// A send-can batch older than 1s is silently dropped (spec invariant).
    pub fn is_stale(&self) -> bool {
        self.log_mono_time.elapsed() >= Duration::from_secs(1)
    }

    /// Encode onto the wire: an 8-byte big-endian nanosecond offset from
    /// `process_epoch()`, followed by the raw frame bytes.
    pub fn encode(&self) -> Vec<u8> {
        let nanos = self
            .log_mono_time
            .saturating_duration_since(process_epoch())
            .as_nanos() as u64;
        let mut out = Vec::with_capacity(LOG_TIME_LEN + self.frames.len());
        out.extend_from_slice(&nanos.to_be_bytes());
        out.extend_from_slice(&self.frames);
        out
    }

    /// Decode off the wire, parsing the embedded log timestamp rather than
    /// stamping `now()` at decode time — the latter would make every
    /// message "fresh" regardless of how long it actually sat in transit
    /// (spec §4.3, §8 "stale send-can" invariant).
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < LOG_TIME_LEN {
            return None;
        }
        let nanos = u64::from_be_bytes(bytes[..LOG_TIME_LEN].try_into().ok()?);
        let log_mono_time = process_epoch() + Duration::from_nanos(nanos);
        Some(Self {
            log_mono_time,
            frames: bytes[LOG_TIME_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_is_not_stale() {
        let event = SendCanEvent::new(vec![1, 2, 3]);
        assert!(!event.is_stale());
    }

    #[test]
    fn aged_event_is_stale() {
        let mut event = SendCanEvent::new(vec![1, 2, 3]);
        event.log_mono_time = Instant::now() - Duration::from_millis(1500);
        assert!(event.is_stale());
    }

    #[test]
    fn encode_decode_round_trips_timestamp_and_frames() {
        let event = SendCanEvent::new(vec![9, 9, 9]);
        let decoded = SendCanEvent::decode(&event.encode()).unwrap();
        assert_eq!(decoded.frames, vec![9, 9, 9]);
        assert!(!decoded.is_stale());
    }

    #[test]
    fn decode_preserves_staleness_of_an_aged_event() {
        let mut event = SendCanEvent::new(vec![1, 2, 3]);
        event.log_mono_time = Instant::now() - Duration::from_millis(1500);
        let decoded = SendCanEvent::decode(&event.encode()).unwrap();
        assert!(decoded.is_stale());
    }

    #[test]
    fn decode_rejects_short_payload() {
        assert!(SendCanEvent::decode(&[1, 2, 3]).is_none());
    }
}
