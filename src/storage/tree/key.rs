//! Item keys, their ordering and their two on-disk encodings.

use std::cmp::Ordering;
use std::fmt;

use crate::types::{Result, StreeError};

/// Size of an encoded key.
pub const KEY_SIZE: usize = 16;
/// Key offset of the first byte of file content.
pub const FIRST_BYTE_OFFSET: u64 = 1;
/// Key offset of the "." entry and of the first directory item.
pub const DOT_OFFSET: u64 = 1;
/// Key offset of the ".." entry.
pub const DOT_DOT_OFFSET: u64 = 2;

const V1_SD_UNIQUENESS: u32 = 0;
const V1_DIRENTRY_UNIQUENESS: u32 = 500;
const V1_ANY_UNIQUENESS: u32 = 555;
const V1_INDIRECT_UNIQUENESS: u32 = 0xFFFF_FFFE;
const V1_DIRECT_UNIQUENESS: u32 = 0xFFFF_FFFF;

const V2_OFFSET_MASK: u64 = (1u64 << 60) - 1;
const V2_TYPE_SHIFT: u32 = 60;

/// Item type carried in a key. Declaration order is comparison order.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum KeyType {
    /// Whole-object metadata.
    StatData,
    /// Array of unformatted block pointers.
    Indirect,
    /// Inline file bytes.
    Direct,
    /// Directory entries.
    DirEntry,
    /// Wildcard used only in search keys and sentinels.
    Any,
}

impl KeyType {
    fn v2_nibble(self) -> u64 {
        match self {
            KeyType::StatData => 0,
            KeyType::Indirect => 1,
            KeyType::Direct => 2,
            KeyType::DirEntry => 3,
            KeyType::Any => 15,
        }
    }

    fn from_v2_nibble(nibble: u64) -> Result<Self> {
        match nibble {
            0 => Ok(KeyType::StatData),
            1 => Ok(KeyType::Indirect),
            2 => Ok(KeyType::Direct),
            3 => Ok(KeyType::DirEntry),
            15 => Ok(KeyType::Any),
            _ => Err(StreeError::Corruption("unknown v2 key type")),
        }
    }

    fn uniqueness(self) -> u32 {
        match self {
            KeyType::StatData => V1_SD_UNIQUENESS,
            KeyType::Indirect => V1_INDIRECT_UNIQUENESS,
            KeyType::Direct => V1_DIRECT_UNIQUENESS,
            KeyType::DirEntry => V1_DIRENTRY_UNIQUENESS,
            KeyType::Any => V1_ANY_UNIQUENESS,
        }
    }

    fn from_uniqueness(uniqueness: u32) -> Result<Self> {
        match uniqueness {
            V1_SD_UNIQUENESS => Ok(KeyType::StatData),
            V1_DIRENTRY_UNIQUENESS => Ok(KeyType::DirEntry),
            V1_INDIRECT_UNIQUENESS => Ok(KeyType::Indirect),
            V1_DIRECT_UNIQUENESS => Ok(KeyType::Direct),
            V1_ANY_UNIQUENESS => Ok(KeyType::Any),
            _ => Err(StreeError::Corruption("unknown v1 key uniqueness")),
        }
    }
}

/// On-disk key format a key was read from or will be written in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyVersion {
    /// 32-bit offset plus uniqueness.
    V1,
    /// 60-bit offset with the type in the top nibble.
    V2,
}

impl KeyVersion {
    /// Item-head encoding of the version.
    pub fn as_u16(self) -> u16 {
        match self {
            KeyVersion::V1 => 0,
            KeyVersion::V2 => 1,
        }
    }

    /// Decodes the item-head version field.
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(KeyVersion::V1),
            1 => Ok(KeyVersion::V2),
            _ => Err(StreeError::Corruption("unknown item version")),
        }
    }

    /// Largest file offset representable by keys of this version. Also used
    /// as the "delete the whole item" cut target.
    pub fn max_offset(self) -> u64 {
        match self {
            KeyVersion::V1 => u64::from(u32::MAX),
            KeyVersion::V2 => V2_OFFSET_MASK,
        }
    }
}

/// How many key components take part in a comparison.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum KeyLen {
    /// `(dir_id, object_id, offset)`.
    Three,
    /// `(dir_id, object_id, offset, type)`.
    Four,
}

/// In-memory key, normalised from either on-disk encoding.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Key {
    /// Parent directory object id.
    pub dir_id: u32,
    /// Object id.
    pub object_id: u32,
    /// Byte offset (1-based), entry hash, or `0` for stat data.
    pub offset: u64,
    /// Item type.
    pub kind: KeyType,
    /// Encoding the key came from.
    pub version: KeyVersion,
    /// Components compared by [`Key::compare`].
    pub len: KeyLen,
}

/// Smallest possible key; never stored.
pub const MIN_KEY: Key = Key {
    dir_id: 0,
    object_id: 0,
    offset: 0,
    kind: KeyType::StatData,
    version: KeyVersion::V1,
    len: KeyLen::Four,
};

/// Largest possible key; never stored.
pub const MAX_KEY: Key = Key {
    dir_id: u32::MAX,
    object_id: u32::MAX,
    offset: u64::MAX,
    kind: KeyType::Any,
    version: KeyVersion::V2,
    len: KeyLen::Four,
};

impl Key {
    /// Builds a full four-component key.
    pub const fn new(
        dir_id: u32,
        object_id: u32,
        offset: u64,
        kind: KeyType,
        version: KeyVersion,
    ) -> Self {
        Self {
            dir_id,
            object_id,
            offset,
            kind,
            version,
            len: KeyLen::Four,
        }
    }

    /// Stat-data key of an object.
    pub const fn stat_data(dir_id: u32, object_id: u32, version: KeyVersion) -> Self {
        Self::new(dir_id, object_id, 0, KeyType::StatData, version)
    }

    /// Same key with a different offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Same key with a different type.
    pub fn with_kind(mut self, kind: KeyType) -> Self {
        self.kind = kind;
        self
    }

    /// Same key with a different comparison length.
    pub fn with_len(mut self, len: KeyLen) -> Self {
        self.len = len;
        self
    }

    /// Same key re-tagged with another encoding.
    pub fn with_version(mut self, version: KeyVersion) -> Self {
        self.version = version;
        self
    }

    /// Compares `(dir_id, object_id)` only.
    pub fn compare_short(&self, other: &Key) -> Ordering {
        self.dir_id
            .cmp(&other.dir_id)
            .then_with(|| self.object_id.cmp(&other.object_id))
    }

    /// Returns `true` if both keys belong to the same object.
    pub fn same_object(&self, other: &Key) -> bool {
        self.compare_short(other) == Ordering::Equal
    }

    /// Full comparison. The type takes part only when both keys carry four
    /// components.
    pub fn compare(&self, other: &Key) -> Ordering {
        self.compare_short(other)
            .then_with(|| self.offset.cmp(&other.offset))
            .then_with(|| {
                if self.len == KeyLen::Four && other.len == KeyLen::Four {
                    self.kind.cmp(&other.kind)
                } else {
                    Ordering::Equal
                }
            })
    }

    /// Writes the key in its own version's encoding.
    pub fn encode(&self, out: &mut [u8]) -> Result<()> {
        if out.len() < KEY_SIZE {
            return Err(StreeError::Invalid("key buffer too small"));
        }
        out[0..4].copy_from_slice(&self.dir_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.object_id.to_le_bytes());
        match self.version {
            KeyVersion::V1 => {
                let offset = u32::try_from(self.offset)
                    .map_err(|_| StreeError::Invalid("offset does not fit a v1 key"))?;
                out[8..12].copy_from_slice(&offset.to_le_bytes());
                out[12..16].copy_from_slice(&self.kind.uniqueness().to_le_bytes());
            }
            KeyVersion::V2 => {
                if self.offset > V2_OFFSET_MASK {
                    return Err(StreeError::Invalid("offset does not fit a v2 key"));
                }
                let packed = (self.kind.v2_nibble() << V2_TYPE_SHIFT) | self.offset;
                out[8..16].copy_from_slice(&packed.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Reads a key whose version is known from its item head.
    pub fn decode(bytes: &[u8], version: KeyVersion) -> Result<Self> {
        if bytes.len() < KEY_SIZE {
            return Err(StreeError::Corruption("key truncated"));
        }
        let dir_id = read_u32(bytes, 0);
        let object_id = read_u32(bytes, 4);
        let (offset, kind) = match version {
            KeyVersion::V1 => (
                u64::from(read_u32(bytes, 8)),
                KeyType::from_uniqueness(read_u32(bytes, 12))?,
            ),
            KeyVersion::V2 => {
                let packed = read_u64(bytes, 8);
                (
                    packed & V2_OFFSET_MASK,
                    KeyType::from_v2_nibble(packed >> V2_TYPE_SHIFT)?,
                )
            }
        };
        Ok(Self::new(dir_id, object_id, offset, kind, version))
    }

    /// Reads a key stored without an item head (internal nodes), inferring
    /// the version from the type nibble.
    pub fn decode_detect(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < KEY_SIZE {
            return Err(StreeError::Corruption("key truncated"));
        }
        Self::decode(bytes, detect_version(bytes))
    }
}

/// Guesses the encoding of a raw key. A v2 stat-data key and a v1 one are
/// byte-identical, so both classify as v1.
pub fn detect_version(bytes: &[u8]) -> KeyVersion {
    match read_u64(bytes, 8) >> V2_TYPE_SHIFT {
        1..=3 => KeyVersion::V2,
        _ => KeyVersion::V1,
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} {} {} {:?}]",
            self.dir_id, self.object_id, self.offset, self.kind
        )
    }
}

pub(crate) fn read_u16(bytes: &[u8], at: usize) -> u16 {
    let mut arr = [0u8; 2];
    arr.copy_from_slice(&bytes[at..at + 2]);
    u16::from_le_bytes(arr)
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(arr)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(arr)
}
