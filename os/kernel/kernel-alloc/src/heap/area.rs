//! Block header and footer, encoded to and from their fixed byte layouts.
//!
//! ```text
//! header (12 bytes)                     footer (8 bytes)
//! +0  size   u32  (overhead included)   +0  magic   u32
//! +4  state  u8   (0 used, 1 free)      +4  header  u32 (address)
//! +5  3 zero bytes
//! +8  magic  u32
//! ```

/// Sentinel written into every live header and footer.
pub const HEAP_MAGIC: u32 = 0xABCD_EF12;

pub const HEADER_SIZE: u32 = 12;
pub const FOOTER_SIZE: u32 = 8;

/// Bytes of bookkeeping around every block.
pub const OVERHEAD: u32 = HEADER_SIZE + FOOTER_SIZE;

/// A remainder smaller than this is absorbed instead of split off.
pub const MIN_SPLIT: u32 = 16 + OVERHEAD;

const STATE_USED: u8 = 0;
const STATE_FREE: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AreaState {
    Used,
    Free,
}

/// Block header as stored in heap memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AreaHeader {
    pub size: u32,
    pub state: u8,
    pub magic: u32,
}

impl AreaHeader {
    #[must_use]
    pub const fn new(size: u32, state: AreaState) -> Self {
        Self {
            size,
            state: match state {
                AreaState::Used => STATE_USED,
                AreaState::Free => STATE_FREE,
            },
            magic: HEAP_MAGIC,
        }
    }

    /// The decoded state, or `None` for a byte that is neither.
    #[must_use]
    pub const fn area_state(&self) -> Option<AreaState> {
        match self.state {
            STATE_USED => Some(AreaState::Used),
            STATE_FREE => Some(AreaState::Free),
            _ => None,
        }
    }

    #[must_use]
    pub const fn has_magic(&self) -> bool {
        self.magic == HEAP_MAGIC
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.has_magic() && self.state == STATE_FREE
    }

    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.has_magic() && self.state == STATE_USED
    }

    /// Address of the footer of a block of this size starting at `at`.
    #[must_use]
    pub const fn footer_address(&self, at: u32) -> u32 {
        at + self.size - FOOTER_SIZE
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut raw = [0u8; HEADER_SIZE as usize];
        raw[0..4].copy_from_slice(&self.size.to_le_bytes());
        raw[4] = self.state;
        raw[8..12].copy_from_slice(&self.magic.to_le_bytes());
        raw
    }

    #[must_use]
    pub const fn from_bytes(raw: &[u8; HEADER_SIZE as usize]) -> Self {
        Self {
            size: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            state: raw[4],
            magic: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
        }
    }
}

/// Block footer as stored in heap memory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AreaFooter {
    pub magic: u32,
    pub header: u32,
}

impl AreaFooter {
    #[must_use]
    pub const fn new(header: u32) -> Self {
        Self {
            magic: HEAP_MAGIC,
            header,
        }
    }

    #[must_use]
    pub const fn points_to(&self, header: u32) -> bool {
        self.magic == HEAP_MAGIC && self.header == header
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE as usize] {
        let mut raw = [0u8; FOOTER_SIZE as usize];
        raw[0..4].copy_from_slice(&self.magic.to_le_bytes());
        raw[4..8].copy_from_slice(&self.header.to_le_bytes());
        raw
    }

    #[must_use]
    pub const fn from_bytes(raw: &[u8; FOOTER_SIZE as usize]) -> Self {
        Self {
            magic: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            header: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let h = AreaHeader::new(0x1234, AreaState::Free);
        assert_eq!(
            h.to_bytes(),
            [0x34, 0x12, 0, 0, 1, 0, 0, 0, 0x12, 0xEF, 0xCD, 0xAB]
        );
        assert_eq!(AreaHeader::from_bytes(&h.to_bytes()), h);
        assert!(h.is_free() && !h.is_used());
        assert_eq!(h.footer_address(0x1000), 0x1000 + 0x1234 - 8);
    }

    #[test]
    fn footer_layout() {
        let f = AreaFooter::new(0xC008_0000);
        assert_eq!(f.to_bytes(), [0x12, 0xEF, 0xCD, 0xAB, 0, 0, 0x08, 0xC0]);
        assert!(f.points_to(0xC008_0000));
        assert!(!f.points_to(0xC008_0004));
    }

    #[test]
    fn unknown_state_is_neither() {
        let mut raw = AreaHeader::new(64, AreaState::Used).to_bytes();
        raw[4] = 7;
        let h = AreaHeader::from_bytes(&raw);
        assert_eq!(h.area_state(), None);
        assert!(!h.is_free() && !h.is_used());
    }
}
