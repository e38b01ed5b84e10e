//! The fixed-size record header threaded through the overflow data file.
//!
//! Field order is fixed and mirrors the on-disk layout exactly: changing it
//! changes the wire format of every data file ever written by this crate.

/// Size, in bytes, of a serialized [`RecordHeader`].
///
/// `channel_id` (4) + `next_offset` (8) + `parity` (1) + `length` (8).
pub const HEADER_SIZE: usize = 4 + 8 + 1 + 8;

/// The 8-byte magic string that opens every overflow data file.
pub const DATA_FILE_MAGIC: &[u8; 8] = b"QDSKOF01";

/// Sentinel `channel_id` used by dummy filler records left behind by head
/// truncation (spec §4.5.6). No live record ever carries this id.
pub const DUMMY_CHANNEL_ID: u32 = 0;

/// A record header as stored on disk, little-endian, in declaration order.
///
/// `length` is pinned to an on-disk `u64` (rather than a platform `size_t`)
/// so the data file format does not depend on the host's pointer width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Owning channel id. Must be `> 0` for live records; `0` marks a dummy.
    pub channel_id: u32,
    /// Byte distance from the start of *this* header to the start of the
    /// next record in the same channel, or `0` if this is the last record.
    pub next_offset: i64,
    /// Horizontal XOR parity over every other header byte.
    pub parity: u8,
    /// Number of payload bytes following this header.
    pub length: u64,
}

impl RecordHeader {
    /// Builds a header and computes its parity byte.
    pub fn new(channel_id: u32, next_offset: i64, length: u64) -> Self {
        let mut header = Self {
            channel_id,
            next_offset,
            parity: 0,
            length,
        };
        header.parity = header.compute_parity();
        header
    }

    /// Serializes the header to its fixed on-disk byte layout.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        let mut offset = 0;
        buf[offset..offset + 4].copy_from_slice(&self.channel_id.to_le_bytes());
        offset += 4;
        buf[offset..offset + 8].copy_from_slice(&self.next_offset.to_le_bytes());
        offset += 8;
        buf[offset] = self.parity;
        offset += 1;
        buf[offset..offset + 8].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Parses a header from its on-disk byte layout without validating parity.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut offset = 0;
        let channel_id = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
        offset += 4;
        let next_offset = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        offset += 8;
        let parity = buf[offset];
        offset += 1;
        let length = u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
        Self {
            channel_id,
            next_offset,
            parity,
            length,
        }
    }

    /// Recomputes the parity byte, as though `parity` were currently zero.
    pub fn compute_parity(&self) -> u8 {
        let mut scratch = *self;
        scratch.parity = 0;
        scratch
            .to_bytes()
            .iter()
            .fold(0u8, |acc, byte| acc ^ byte)
    }

    /// `true` if the stored parity byte matches the header's contents.
    pub fn parity_is_valid(&self) -> bool {
        self.parity == self.compute_parity()
    }

    /// Total on-disk footprint of this record (header + payload).
    pub fn total_size(&self) -> u64 {
        HEADER_SIZE as u64 + self.length
    }
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self {
            channel_id: 0,
            next_offset: 0,
            parity: 0,
            length: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn round_trips_through_bytes() {
        let header = RecordHeader::new(7, 128, 42);
        let bytes = header.to_bytes();
        let parsed = RecordHeader::from_bytes(&bytes);
        assert_eq!(header, parsed);
        assert!(parsed.parity_is_valid());
    }

    #[test]
    fn flipping_any_byte_breaks_parity() {
        let header = RecordHeader::new(7, 128, 42);
        let bytes = header.to_bytes();
        for i in 0..HEADER_SIZE {
            let mut mutated = bytes;
            mutated[i] ^= 0x01;
            let parsed = RecordHeader::from_bytes(&mutated);
            assert!(
                !parsed.parity_is_valid(),
                "byte {i} flip should have broken parity"
            );
        }
    }

    quickcheck! {
        fn parity_always_valid_after_new(channel_id: u32, next_offset: i64, length: u64) -> bool {
            RecordHeader::new(channel_id, next_offset, length).parity_is_valid()
        }
    }
}
