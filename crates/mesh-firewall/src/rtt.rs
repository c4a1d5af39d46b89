//! Opportunistic TCP round-trip-time sampling.
//!
//! Works directly on raw IPv4+TCP bytes: an outbound segment arms the
//! sampler with its sequence number, and the first inbound ACK covering
//! that sequence produces one histogram sample. Assumes well-formed
//! headers; the caller owns packet validation.

use crate::conntrack::Conn;
use mesh_common::RttHistogram;
use std::time::Instant;

const TCP_FIN: u8 = 0x01;
const TCP_ACK: u8 = 0x10;

#[inline]
fn ip_header_len(packet: &[u8]) -> usize {
    ((packet[0] & 0x0f) as usize) << 2
}

/// Arm the sampler with an outbound segment's sequence number. No-op when
/// already armed (or already sampled) and for FIN segments, which see
/// delayed acks.
pub(crate) fn arm(conn: &mut Conn, packet: &[u8], now: Instant) {
    if conn.seq != 0 {
        return;
    }

    let ihl = ip_header_len(packet);
    if packet[ihl + 13] & TCP_FIN != 0 {
        return;
    }

    conn.seq = u32::from_be_bytes([
        packet[ihl + 4],
        packet[ihl + 5],
        packet[ihl + 6],
        packet[ihl + 7],
    ]);
    conn.sent_at = Some(now);
}

/// Test an inbound segment against the armed sequence number. On a covering
/// ACK, record one sample and disarm so each conn samples at most once.
/// Returns whether a sample was taken.
pub(crate) fn check(conn: &mut Conn, packet: &[u8], histogram: &RttHistogram, now: Instant) -> bool {
    if conn.seq == 0 {
        return false;
    }

    let ihl = ip_header_len(packet);
    if packet[ihl + 13] & TCP_ACK == 0 {
        return false;
    }

    let ack = u32::from_be_bytes([
        packet[ihl + 8],
        packet[ihl + 9],
        packet[ihl + 10],
        packet[ihl + 11],
    ]);

    // Signed difference handles sequence wrap-around at the cost of half
    // the window. Zero or positive means the ack does not cover our
    // sequence number yet.
    if conn.seq.wrapping_sub(ack) as i32 >= 0 {
        return false;
    }

    let Some(sent_at) = conn.sent_at else {
        return false;
    };

    histogram.record(now.duration_since(sent_at).as_nanos() as u64);
    conn.seq = 0;
    true
}
