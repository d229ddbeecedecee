use bitvec::{order::Msb0, vec::BitVec};

// Represents which pieces exists for a peer.
// Each bit represents a piece, where 1 means the piece exists and 0 means it does not.
// Using Msb0 order for BitVec to match the BitTorrent protocol specification.
// https://www.bittorrent.org/beps/bep_0003.html#peer-messages
//
// The storage is a whole number of bytes and never grows. Any index past the
// last byte reads as missing and setting it does nothing, so the bitfield has
// to be sized from the piece count when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An empty bitfield with room for `num_pieces`, rounded up to whole bytes.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, num_pieces.div_ceil(8) * 8),
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.bits.get(index).is_some_and(|bit| *bit)
    }

    pub fn set_piece(&mut self, index: usize) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    /// Number of addressable bits, always a multiple of 8.
    pub fn capacity(&self) -> usize {
        self.bits.len()
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

// Payload of a `bitfield` message.
impl From<Vec<u8>> for Bitfield {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bits: BitVec::from_vec(bytes),
        }
    }
}

impl From<Bitfield> for Vec<u8> {
    fn from(bitfield: Bitfield) -> Self {
        bitfield.bits.into_vec()
    }
}
