//! # Fixed-Width On-Disk Keys
//!
//! Every item and unit in the tree is addressed by a 24-byte key, stored
//! little-endian and compared as a plain tuple. The packing follows the
//! classic three-word scheme:
//!
//! ```text
//! word 0:  locality (upper 60 bits) | key type (low 4 bits)
//! word 1:  objectid
//! word 2:  offset   (byte offset in a file body, name hash in a directory)
//! ```
//!
//! Keys order lexicographically over `(word0, word1, word2)`, which groups
//! all records of one locality together, then by type band, then by object,
//! then by position inside the object. Duplicate keys are legal (directory
//! entries whose name hashes collide) and are always resolved to the
//! leftmost occurrence by node lookup.

use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const KEY_SIZE: usize = 24;

const TYPE_MASK: u64 = 0xf;

/// The 4-bit type band packed into the low bits of key word 0.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Directory entry keys; `offset` holds the name hash.
    FileName = 0x0,
    /// Stat-data keys; `offset` is always zero.
    StatData = 0x1,
    /// File body keys (tails, extents, blobs); `offset` is a byte offset.
    FileBody = 0x4,
}

impl KeyType {
    pub fn from_bits(bits: u64) -> Option<KeyType> {
        match bits & TYPE_MASK {
            0x0 => Some(KeyType::FileName),
            0x1 => Some(KeyType::StatData),
            0x4 => Some(KeyType::FileBody),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Key {
    el: [U64; 3],
}

const _: () = assert!(std::mem::size_of::<Key>() == KEY_SIZE);

impl Key {
    pub fn build(locality: u64, typ: KeyType, objectid: u64, offset: u64) -> Key {
        Key {
            el: [
                U64::new((locality << 4) | typ as u64),
                U64::new(objectid),
                U64::new(offset),
            ],
        }
    }

    /// Smallest possible key; sorts before every real key.
    pub fn minimal() -> Key {
        Key {
            el: [U64::new(0); 3],
        }
    }

    /// Largest possible key; sorts after every real key.
    pub fn maximal() -> Key {
        Key {
            el: [U64::new(u64::MAX); 3],
        }
    }

    pub fn locality(&self) -> u64 {
        self.el[0].get() >> 4
    }

    /// Raw 4-bit type band. [`Key::key_type`] gives the decoded form.
    pub fn type_bits(&self) -> u64 {
        self.el[0].get() & TYPE_MASK
    }

    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::from_bits(self.el[0].get())
    }

    pub fn objectid(&self) -> u64 {
        self.el[1].get()
    }

    pub fn offset(&self) -> u64 {
        self.el[2].get()
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.el[2] = U64::new(offset);
    }

    /// Same key with a different offset word; the common way item plugins
    /// derive unit keys from their item key.
    pub fn with_offset(&self, offset: u64) -> Key {
        let mut key = *self;
        key.set_offset(offset);
        key
    }

    /// True when both keys address the same object in the same type band,
    /// i.e. they can only differ in `offset`.
    pub fn same_object(&self, other: &Key) -> bool {
        self.el[0] == other.el[0] && self.el[1] == other.el[1]
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Key) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Key) -> std::cmp::Ordering {
        let lhs = (self.el[0].get(), self.el[1].get(), self.el[2].get());
        let rhs = (other.el[0].get(), other.el[1].get(), other.el[2].get());
        lhs.cmp(&rhs)
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Key({:x}:{:x}:{:x}:{:x})",
            self.locality(),
            self.type_bits(),
            self.objectid(),
            self.offset()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_size_is_24_bytes() {
        assert_eq!(std::mem::size_of::<Key>(), KEY_SIZE);
    }

    #[test]
    fn build_roundtrips_fields() {
        let key = Key::build(0x123, KeyType::FileBody, 77, 4096);
        assert_eq!(key.locality(), 0x123);
        assert_eq!(key.key_type(), Some(KeyType::FileBody));
        assert_eq!(key.objectid(), 77);
        assert_eq!(key.offset(), 4096);
    }

    #[test]
    fn ordering_is_locality_type_object_offset() {
        let a = Key::build(1, KeyType::StatData, 9, 0);
        let b = Key::build(1, KeyType::FileBody, 2, 0);
        let c = Key::build(2, KeyType::FileName, 0, 0);
        assert!(a < b, "type band orders before objectid");
        assert!(b < c, "locality dominates");

        let d = Key::build(1, KeyType::FileBody, 2, 100);
        assert!(b < d, "offset is the least significant word");
    }

    #[test]
    fn minimal_and_maximal_bracket_everything() {
        let key = Key::build(u64::MAX >> 4, KeyType::FileBody, u64::MAX, 12);
        assert!(Key::minimal() < key);
        assert!(key < Key::maximal());
    }

    #[test]
    fn same_object_ignores_offset() {
        let a = Key::build(5, KeyType::FileBody, 8, 0);
        let b = a.with_offset(8192);
        assert!(a.same_object(&b));
        assert!(!a.same_object(&Key::build(5, KeyType::FileBody, 9, 0)));
    }

    #[test]
    fn bytes_roundtrip_little_endian() {
        use zerocopy::IntoBytes;

        let key = Key::build(3, KeyType::StatData, 0x1122334455667788, 1);
        let bytes = key.as_bytes();
        assert_eq!(bytes.len(), KEY_SIZE);
        let parsed = Key::read_from_bytes(bytes).unwrap();
        assert_eq!(parsed, key);
        assert_eq!(&bytes[8..16], &0x1122334455667788u64.to_le_bytes());
    }
}
