//! Dead Peer Detection (RFC 3706)
//!
//! Liveness is probed with R-U-THERE notifications on the established
//! ISAKMP SA; the peer answers R-U-THERE-ACK with the same sequence
//! number. Sequence numbers increase monotonically per direction, and
//! a probe is only answered when its sequence number is fresh.
//!
//! The timer side (when to probe, when to declare the peer dead) lives
//! in the engine's timer wheel; this module keeps the per-SA sequence
//! state and the decision logic.

use std::time::Duration;
use tracing::{debug, warn};

/// Default probe interval
pub const DEFAULT_DPD_INTERVAL: Duration = Duration::from_secs(30);

/// Default probe response timeout
pub const DEFAULT_DPD_TIMEOUT: Duration = Duration::from_secs(120);

/// DPD policy for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpdConfig {
    /// Quiet period between probes
    pub interval: Duration,
    /// How long to wait for an ACK before declaring the peer dead
    pub timeout: Duration,
}

impl Default for DpdConfig {
    fn default() -> Self {
        DpdConfig {
            interval: DEFAULT_DPD_INTERVAL,
            timeout: DEFAULT_DPD_TIMEOUT,
        }
    }
}

/// Per-SA DPD sequence state
#[derive(Debug, Clone, Default)]
pub struct DpdState {
    /// Sequence number of our next probe
    our_seqno: u32,
    /// Highest peer probe sequence number we have answered
    peer_seqno: u32,
    /// Sequence number of our outstanding probe, if any
    outstanding: Option<u32>,
}

impl DpdState {
    /// Fresh state, seeded with a starting sequence number
    pub fn new(initial_seqno: u32) -> Self {
        DpdState {
            our_seqno: initial_seqno,
            peer_seqno: 0,
            outstanding: None,
        }
    }

    /// Take the sequence number for our next probe and mark it
    /// outstanding
    pub fn next_probe(&mut self) -> u32 {
        let seq = self.our_seqno;
        self.our_seqno = self.our_seqno.wrapping_add(1);
        self.outstanding = Some(seq);
        seq
    }

    /// A probe of ours is still waiting for its ACK
    pub fn probe_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    /// Process a peer R-U-THERE; returns true when an ACK should be
    /// sent
    pub fn recv_r_u_there(&mut self, seqno: u32) -> bool {
        if self.peer_seqno != 0 && seqno <= self.peer_seqno {
            warn!(
                seqno,
                last = self.peer_seqno,
                "ignoring stale or replayed R_U_THERE sequence number"
            );
            return false;
        }
        // wild jumps are suspicious too
        if self.peer_seqno != 0 && seqno > self.peer_seqno.wrapping_add(65536) {
            warn!(
                seqno,
                last = self.peer_seqno,
                "ignoring R_U_THERE with implausible sequence number"
            );
            return false;
        }
        self.peer_seqno = seqno;
        true
    }

    /// Process a peer R-U-THERE-ACK; returns true when it answers our
    /// outstanding probe
    pub fn recv_ack(&mut self, seqno: u32) -> bool {
        match self.outstanding {
            Some(expected) if expected == seqno => {
                debug!(seqno, "DPD probe acknowledged");
                self.outstanding = None;
                true
            }
            _ => {
                debug!(seqno, "unexpected R_U_THERE_ACK sequence number");
                false
            }
        }
    }

    /// Clear the outstanding probe (peer proved alive by other traffic)
    pub fn reset(&mut self) {
        self.outstanding = None;
    }
}

/// Build the 4-byte big-endian DPD sequence number notification data
pub fn seqno_data(seqno: u32) -> Vec<u8> {
    seqno.to_be_bytes().to_vec()
}

/// Extract the sequence number from DPD notification data
pub fn parse_seqno(data: &[u8]) -> Option<u32> {
    if data.len() != 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_sequence_increments() {
        let mut dpd = DpdState::new(100);
        assert_eq!(dpd.next_probe(), 100);
        assert!(dpd.probe_outstanding());
        assert!(dpd.recv_ack(100));
        assert!(!dpd.probe_outstanding());
        assert_eq!(dpd.next_probe(), 101);
    }

    #[test]
    fn test_ack_with_wrong_seqno_ignored() {
        let mut dpd = DpdState::new(7);
        dpd.next_probe();
        assert!(!dpd.recv_ack(99));
        assert!(dpd.probe_outstanding());
    }

    #[test]
    fn test_peer_probe_accepts_fresh_rejects_stale() {
        let mut dpd = DpdState::default();
        assert!(dpd.recv_r_u_there(5));
        assert!(dpd.recv_r_u_there(6));
        assert!(!dpd.recv_r_u_there(6)); // replay
        assert!(!dpd.recv_r_u_there(3)); // stale
        assert!(dpd.recv_r_u_there(7));
    }

    #[test]
    fn test_peer_probe_rejects_wild_jump() {
        let mut dpd = DpdState::default();
        assert!(dpd.recv_r_u_there(1));
        assert!(!dpd.recv_r_u_there(1_000_000));
    }

    #[test]
    fn test_seqno_data_roundtrip() {
        assert_eq!(parse_seqno(&seqno_data(0xAABBCCDD)), Some(0xAABBCCDD));
        assert_eq!(parse_seqno(&[1, 2, 3]), None);
    }

    #[test]
    fn test_default_config() {
        let config = DpdConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(120));
    }
}
