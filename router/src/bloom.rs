use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use thiserror::Error;

const CRC64: Crc<u64> = Crc::<u64>::new(&crc::CRC_64_XZ);
const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Largest filter accepted off the wire
const MAX_LENGTH: usize = 64 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Truncated summary vector")]
    Truncated,

    #[error("Summary vector needs at least one hash function")]
    NoHashFunctions,

    #[error("Summary vector length {0} is out of range")]
    InvalidLength(usize),
}

/// A fixed-size bloom filter keyed by strings.
///
/// Membership tests may report false positives, never false negatives.
/// Positions are derived by double hashing with CRC-64 and CRC-32 so that two
/// nodes always agree on the bits for a given key.
#[derive(Clone, PartialEq, Eq)]
pub struct BloomFilter {
    bits: Box<[u8]>,
    hashes: u16,
}

impl BloomFilter {
    pub const DEFAULT_LENGTH: usize = 1024;
    pub const DEFAULT_HASHES: u16 = 3;

    pub fn new(length: usize, hashes: u16) -> Self {
        Self {
            bits: vec![0u8; length.max(1)].into_boxed_slice(),
            hashes: hashes.max(1),
        }
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = usize> + '_ {
        let nbits = (self.bits.len() as u64) * 8;
        let h1 = CRC64.checksum(key.as_bytes());
        let h2 = (CRC32.checksum(key.as_bytes()) as u64) | 1;
        (0..self.hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % nbits) as usize)
    }

    pub fn insert(&mut self, key: &str) {
        let positions = self.positions(key).collect::<Vec<_>>();
        for p in positions {
            self.bits[p / 8] |= 1 << (p % 8);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.positions(key)
            .all(|p| self.bits[p / 8] & (1 << (p % 8)) != 0)
    }

    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn encoded_len(&self) -> usize {
        2 + 4 + self.bits.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.hashes);
        buf.put_u32(self.bits.len() as u32);
        buf.put_slice(&self.bits);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        if buf.remaining() < 6 {
            return Err(Error::Truncated);
        }
        let hashes = buf.get_u16();
        if hashes == 0 {
            return Err(Error::NoHashFunctions);
        }
        let length = buf.get_u32() as usize;
        if length == 0 || length > MAX_LENGTH {
            return Err(Error::InvalidLength(length));
        }
        if buf.remaining() < length {
            return Err(Error::Truncated);
        }
        let mut bits = vec![0u8; length];
        buf.copy_to_slice(&mut bits);
        Ok(Self {
            bits: bits.into_boxed_slice(),
            hashes,
        })
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LENGTH, Self::DEFAULT_HASHES)
    }
}

impl std::fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BloomFilter")
            .field("length", &self.bits.len())
            .field("hashes", &self.hashes)
            .field(
                "set",
                &self.bits.iter().map(|b| b.count_ones()).sum::<u32>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut filter = BloomFilter::new(256, 3);
        let keys = (0..200)
            .map(|i| format!("[{i}.0] dtn://node/app"))
            .collect::<Vec<_>>();
        for k in &keys {
            filter.insert(k);
        }
        assert!(keys.iter().all(|k| filter.contains(k)));
    }

    #[test]
    fn empty_filter() {
        let mut filter = BloomFilter::default();
        assert!(filter.is_empty());
        assert!(!filter.contains("[1.0] dtn://a"));

        filter.insert("[1.0] dtn://a");
        assert!(!filter.is_empty());
        filter.clear();
        assert!(filter.is_empty());
    }

    #[test]
    fn wire_form() {
        let mut filter = BloomFilter::new(32, 2);
        filter.insert("[5.1] dtn://x");

        let mut buf = BytesMut::new();
        filter.encode(&mut buf);
        assert_eq!(buf.len(), filter.encoded_len());

        let decoded = BloomFilter::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, filter);
        assert!(decoded.contains("[5.1] dtn://x"));
    }

    #[test]
    fn bad_wire_form() {
        assert_eq!(
            BloomFilter::decode(&mut &[0u8, 1][..]),
            Err(Error::Truncated)
        );
        assert_eq!(
            BloomFilter::decode(&mut &[0u8, 0, 0, 0, 0, 1, 0][..]),
            Err(Error::NoHashFunctions)
        );
        assert_eq!(
            BloomFilter::decode(&mut &[0u8, 1, 0, 0, 0, 0][..]),
            Err(Error::InvalidLength(0))
        );
        assert_eq!(
            BloomFilter::decode(&mut &[0u8, 1, 0, 0, 0, 4, 1][..]),
            Err(Error::Truncated)
        );
    }
}
