//! Chunk framing for the persistent-WebSocket wire protocol.
//!
//! Every WebSocket binary frame ("chunk") starts with a 2-byte big-endian
//! header; the rest is opaque payload.  Header layout, MSB first:
//!
//! - bit 15 = signal bit
//! - bit 14 = jet bit
//! - bits 0-13 = the low 14 bits of the chunk index, or a signal code
//!
//! | Header range    | Meaning                              | Payload        |
//! |-----------------|--------------------------------------|----------------|
//! | 0x0000–0x3FFF   | message chunk, RPC channel           | user bytes     |
//! | 0x4000–0x7FFF   | message chunk, jet channel           | user bytes     |
//! | 0x8000–0xBFFF   | signal                               | signal-defined |
//! | 0xC000–0xFFFF   | jet command chunk                    | UTF-8 command  |
//!
//! Indices are per-direction monotonic `u64` counters starting at 0.  Only
//! the low 14 bits travel on the wire; [`unmod`] reconstructs the full value
//! on the receiving side.  This layout is a frozen peer contract; both
//! sides must agree bit for bit.

/// Modulus of the on-the-wire index space (14 bits).
pub const MAX_LSB: u64 = 16384;

/// Signal: acknowledge everything below the carried index (payload: next
/// expected index, 2 bytes big-endian LSBs).
pub const SIG_ACK: u16 = 0x8010;
/// Signal: request retransmission from the carried index onward.
pub const SIG_RESEND: u16 = 0x8011;
/// Signal: a resend request could not be satisfied; the conversation is dead.
pub const SIG_RESEND_ERROR: u16 = 0x8012;
/// Signal: application-level ping; peer echoes the payload in a pong.
pub const SIG_PING: u16 = 0x8020;
/// Signal: reply to [`SIG_PING`], payload echoed verbatim.
pub const SIG_PONG: u16 = 0x8021;

const JET_BIT: u16 = 0x4000;
const SIGNAL_BIT: u16 = 0x8000;

/// The low 14 bits of an index, as placed on the wire.
pub fn lsb(index: u64) -> u16 {
    (index % MAX_LSB) as u16
}

/// Encode a chunk header for a message or jet-command chunk.
///
/// `command` implies the jet channel (commands only exist there).
pub fn encode_header(index: u64, jet: bool, command: bool) -> [u8; 2] {
    debug_assert!(jet || !command, "command chunks only exist on the jet channel");
    let mut header = lsb(index);
    if jet {
        header |= JET_BIT;
    }
    if command {
        header |= SIGNAL_BIT;
    }
    header.to_be_bytes()
}

/// Encode a signal header (`code` must be one of the `SIG_*` values).
pub fn encode_signal(code: u16) -> [u8; 2] {
    debug_assert!(code >= SIGNAL_BIT, "signal codes live in the 0x8000+ range");
    code.to_be_bytes()
}

/// Decode the 2-byte big-endian header at the front of a chunk.
///
/// Callers must have checked `chunk.len() >= 2`.
pub fn decode_header(chunk: &[u8]) -> u16 {
    u16::from_be_bytes([chunk[0], chunk[1]])
}

/// True for signal headers (0x8000–0xBFFF); jet commands (0xC000+) are not
/// signals, they are indexed chunks.
pub fn is_signal(header: u16) -> bool {
    header & SIGNAL_BIT != 0 && header & JET_BIT == 0
}

/// True when the jet bit is set (jet data or jet command).
pub fn is_jet(header: u16) -> bool {
    header & JET_BIT != 0
}

/// True for jet command chunks (both top bits set).
pub fn is_jet_command(header: u16) -> bool {
    header & (SIGNAL_BIT | JET_BIT) == SIGNAL_BIT | JET_BIT
}

/// The 14 index bits of a non-signal header.
pub fn index_lsb(header: u16) -> u16 {
    header & 0x3FFF
}

/// Reconstruct a full index from its 14 wire bits.
///
/// Returns the unique `n` with `n % MAX_LSB == xx` and `|near − n| ≤
/// MAX_LSB/2`; when both candidates are exactly half a window away, the
/// lower one wins.  `near` is the receiver's expectation (`in_index` for
/// inbound data, `journal_index` for ack payloads).
pub fn unmod(xx: u16, near: u64) -> u64 {
    let xx = u64::from(xx) % MAX_LSB;
    let low = near.saturating_sub(MAX_LSB / 2);
    low + (xx + MAX_LSB - low % MAX_LSB) % MAX_LSB
}
