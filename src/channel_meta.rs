//! Per-channel metadata kept by the overflow engine.
//!
//! The metadata arena is a plain `HashMap<String, ChannelMeta>`; the
//! first-offset tracker is a separate `BTreeMap<u64, String>` sharing the
//! same storage-name key. Neither side holds a pointer into the other —
//! `ChannelMeta::tracked` just records whether this channel currently has
//! an entry in the tracker.

use crate::record::RecordHeader;

/// Bookkeeping for one overflow channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMeta {
    pub id: u32,
    pub first_offset: u64,
    pub last_offset: u64,
    pub last_header: RecordHeader,
    pub records: u64,
    pub bytes: u64,
    /// Mirrors whether this channel has a live entry in the first-offset
    /// tracker (`records > 0`).
    pub tracked: bool,
}

impl ChannelMeta {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            first_offset: 0,
            last_offset: 0,
            last_header: RecordHeader::default(),
            records: 0,
            bytes: 0,
            tracked: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// Resets to the empty state, retaining `id`.
    pub fn reset_to_empty(&mut self) {
        let id = self.id;
        *self = ChannelMeta::new(id);
    }

    /// Checks this metadata's internal consistency invariants. Used in
    /// tests and after recovery; panics on violation.
    pub fn assert_invariants(&self) {
        if self.records == 0 {
            assert_eq!(self.first_offset, 0);
            assert_eq!(self.last_offset, 0);
            assert_eq!(self.bytes, 0);
            assert_eq!(self.last_header, RecordHeader::default());
            assert!(!self.tracked);
        } else {
            if self.records == 1 {
                assert_eq!(self.first_offset, self.last_offset);
            } else {
                assert!(self.first_offset < self.last_offset);
            }
            assert!(self.first_offset > 0);
            assert_eq!(self.last_header.channel_id, self.id);
            assert_eq!(self.last_header.next_offset, 0);
            assert!(self.tracked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_channel_satisfies_invariants() {
        ChannelMeta::new(1).assert_invariants();
    }

    #[test]
    fn reset_preserves_id() {
        let mut meta = ChannelMeta::new(42);
        meta.records = 3;
        meta.bytes = 99;
        meta.first_offset = 8;
        meta.last_offset = 40;
        meta.tracked = true;
        meta.reset_to_empty();
        assert_eq!(meta.id, 42);
        meta.assert_invariants();
    }
}
