//! Bounded outbound journal.
//!
//! Holds every transmitted-but-unacked chunk, fully encoded, so it can be
//! retransmitted after a resend request or a reconnect.  Entries are
//! contiguous in index: the journal always covers exactly
//! `[tail_index, next_index)`.
//!
//! The journal is the volatile send window, not a durability layer; it is
//! capped at [`MAX_SEND_BUFFER`] and callers must back off while it is full.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ceiling on unacked outbound chunks.  Well under the 8192-index ambiguity
/// bound of the 14-bit wire window.
pub const MAX_SEND_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JournalError {
    #[error("ack index {ack} is ahead of the next outbound index {next}")]
    AckBeyondNext { ack: u64, next: u64 },
    #[error("ack index {ack} is behind the journal tail {tail}")]
    AckBehindTail { ack: u64, tail: u64 },
}

/// Ordered queue of encoded outbound chunks keyed by monotonic index.
#[derive(Debug, Default)]
pub struct Journal {
    chunks: VecDeque<Bytes>,
    /// Next outbound index to assign (`journal_index` in protocol terms).
    next_index: u64,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.chunks.len() >= MAX_SEND_BUFFER
    }

    /// The next outbound index to be assigned.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Index of the oldest retained chunk.
    pub fn tail_index(&self) -> u64 {
        self.next_index - self.chunks.len() as u64
    }

    /// The oldest retained chunk, if any.
    pub fn front(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Append an encoded chunk and return the index it was assigned.
    ///
    /// Panics when the journal is already full; callers gate on
    /// [`Journal::is_full`] and apply backpressure first.
    pub fn append(&mut self, chunk: Bytes) -> u64 {
        assert!(
            self.chunks.len() < MAX_SEND_BUFFER,
            "journal overflow; callers must back off while the journal is full"
        );
        let index = self.next_index;
        self.chunks.push_back(chunk);
        self.next_index += 1;
        index
    }

    /// Drop every chunk with index below `ack_index`.
    ///
    /// `ack_index == tail_index` is a no-op; `ack_index == next_index`
    /// empties the journal.  Anything outside that range is a protocol
    /// violation by the peer.
    pub fn drop_through(&mut self, ack_index: u64) -> Result<(), JournalError> {
        if ack_index > self.next_index {
            return Err(JournalError::AckBeyondNext {
                ack: ack_index,
                next: self.next_index,
            });
        }
        let tail = self.tail_index();
        if ack_index < tail {
            return Err(JournalError::AckBehindTail {
                ack: ack_index,
                tail,
            });
        }
        for _ in tail..ack_index {
            self.chunks.pop_front();
        }
        Ok(())
    }

    /// Chunks whose indices lie in `[start, end)`, oldest first.
    ///
    /// The range is clamped to what the journal still holds.
    pub fn iter_range(&self, start: u64, end: u64) -> impl Iterator<Item = &Bytes> {
        let tail = self.tail_index();
        let lo = start.max(tail).min(self.next_index) - tail;
        let hi = end.max(tail).min(self.next_index) - tail;
        self.chunks.range(lo as usize..(hi.max(lo)) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8) -> Bytes {
        Bytes::copy_from_slice(&[tag])
    }

    #[test]
    fn append_assigns_contiguous_indices() {
        let mut j = Journal::new();
        assert_eq!(j.append(chunk(0)), 0);
        assert_eq!(j.append(chunk(1)), 1);
        assert_eq!(j.append(chunk(2)), 2);
        assert_eq!(j.tail_index(), 0);
        assert_eq!(j.next_index(), 3);
        assert_eq!(j.len(), 3);
    }

    #[test]
    fn drop_through_advances_the_tail() {
        let mut j = Journal::new();
        for i in 0..10 {
            j.append(chunk(i));
        }
        j.drop_through(4).unwrap();
        assert_eq!(j.tail_index(), 4);
        assert_eq!(j.len(), 6);
        assert_eq!(j.front().unwrap()[0], 4);

        // no-op and full-drain edges
        j.drop_through(4).unwrap();
        assert_eq!(j.len(), 6);
        j.drop_through(10).unwrap();
        assert!(j.is_empty());
        assert_eq!(j.tail_index(), 10);
    }

    #[test]
    fn drop_through_rejects_impossible_acks() {
        let mut j = Journal::new();
        for i in 0..5 {
            j.append(chunk(i));
        }
        j.drop_through(3).unwrap();
        assert_eq!(
            j.drop_through(6),
            Err(JournalError::AckBeyondNext { ack: 6, next: 5 })
        );
        assert_eq!(
            j.drop_through(2),
            Err(JournalError::AckBehindTail { ack: 2, tail: 3 })
        );
    }

    #[test]
    fn iter_range_clamps_to_retained_chunks() {
        let mut j = Journal::new();
        for i in 0..8 {
            j.append(chunk(i));
        }
        j.drop_through(2).unwrap();

        let tags: Vec<u8> = j.iter_range(0, 5).map(|c| c[0]).collect();
        assert_eq!(tags, vec![2, 3, 4]);
        let tags: Vec<u8> = j.iter_range(6, 100).map(|c| c[0]).collect();
        assert_eq!(tags, vec![6, 7]);
        assert_eq!(j.iter_range(5, 5).count(), 0);
    }

    /// Invariant: after any mix of appends and drops,
    /// `tail_index + len == next_index` and indices stay contiguous.
    #[test]
    fn contiguity_invariant_holds() {
        let mut j = Journal::new();
        let mut acked = 0u64;
        for round in 0u64..40 {
            for i in 0..(round % 7) {
                if !j.is_full() {
                    j.append(chunk(i as u8));
                }
            }
            acked = (acked + round % 5).min(j.next_index());
            if acked >= j.tail_index() {
                j.drop_through(acked).unwrap();
            }
            assert_eq!(j.tail_index() + j.len() as u64, j.next_index());
        }
    }

    #[test]
    #[should_panic(expected = "journal overflow")]
    fn append_past_the_cap_panics() {
        let mut j = Journal::new();
        for i in 0..=MAX_SEND_BUFFER {
            j.append(chunk((i % 251) as u8));
        }
    }
}
