use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-item flag bits.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemFlags(u32);

impl ItemFlags {
    pub const NONE: ItemFlags = ItemFlags(0);
    /// Item is mirrored into storage and survives restarts.
    pub const PERSISTENT: ItemFlags = ItemFlags(1);

    const KNOWN: u32 = Self::PERSISTENT.0;

    /// Keeps only the bits this version understands.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        ItemFlags(bits & Self::KNOWN)
    }

    /// Keeps every bit, including ones written by a newer version.
    pub const fn from_bits_retain(bits: u32) -> Self {
        ItemFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: ItemFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: ItemFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: ItemFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for ItemFlags {
    type Output = ItemFlags;

    fn bitor(self, rhs: ItemFlags) -> ItemFlags {
        ItemFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for ItemFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("ItemFlags(NONE)");
        }
        let mut first = true;
        f.write_str("ItemFlags(")?;
        if self.contains(ItemFlags::PERSISTENT) {
            f.write_str("PERSISTENT")?;
            first = false;
        }
        let unknown = self.0 & !Self::KNOWN;
        if unknown != 0 {
            if !first {
                f.write_str(" | ")?;
            }
            write!(f, "{unknown:#x}")?;
        }
        f.write_str(")")
    }
}

/// One queued message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Caller-supplied identifier, unique within a store.
    pub uuid: String,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Remaining lifetime in seconds. Only decremented on reconnect.
    pub ttl: f64,
    pub flags: ItemFlags,
}

impl Item {
    /// Creates a transient item, kept in memory only.
    pub fn new(uuid: impl Into<String>, data: impl Into<Vec<u8>>, ttl: f64) -> Self {
        Self {
            uuid: uuid.into(),
            data: data.into(),
            ttl,
            flags: ItemFlags::NONE,
        }
    }

    /// Creates an item that is mirrored into storage.
    pub fn persistent(uuid: impl Into<String>, data: impl Into<Vec<u8>>, ttl: f64) -> Self {
        Self::new(uuid, data, ttl).with_flags(ItemFlags::PERSISTENT)
    }

    pub fn with_flags(mut self, flags: ItemFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(ItemFlags::PERSISTENT)
    }
}
