use time::OffsetDateTime;

use crate::storage::tree::key::{read_u16, read_u32, read_u64, KeyVersion};
use crate::types::{Result, StreeError};

/// Encoded size of a version 1 stat-data item.
pub const SD_V1_SIZE: usize = 32;
/// Encoded size of a version 2 stat-data item.
pub const SD_V2_SIZE: usize = 44;

/// File type mask of `mode`.
pub const S_IFMT: u16 = 0o170000;
/// Directory.
pub const S_IFDIR: u16 = 0o040000;
/// Regular file.
pub const S_IFREG: u16 = 0o100000;

/// Per-object metadata kept in the stat-data item.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatData {
    /// Type and permission bits.
    pub mode: u16,
    /// Link count.
    pub nlink: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Logical size in bytes.
    pub size: u64,
    /// Access time, seconds since the epoch.
    pub atime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Status change time.
    pub ctime: u32,
    /// Allocated 512-byte sectors.
    pub blocks: u32,
}

impl StatData {
    /// Fresh metadata for an object of the given type, stamped now.
    pub fn new(mode: u16) -> Self {
        let now = unix_now();
        Self {
            mode,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            ..Self::default()
        }
    }

    /// Returns `true` for directories.
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Sets modification and change times to now.
    pub fn touch(&mut self) {
        let now = unix_now();
        self.mtime = now;
        self.ctime = now;
    }

    /// Encoded length for `version`.
    pub fn encoded_len(version: KeyVersion) -> usize {
        match version {
            KeyVersion::V1 => SD_V1_SIZE,
            KeyVersion::V2 => SD_V2_SIZE,
        }
    }

    /// Serialises the record. Version 1 records hold 16-bit ids and 32-bit
    /// sizes; wider values are rejected.
    pub fn encode(&self, version: KeyVersion) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::encoded_len(version));
        match version {
            KeyVersion::V1 => {
                let narrow = |value: u32| {
                    u16::try_from(value).map_err(|_| StreeError::Invalid("id too wide for v1 stat data"))
                };
                let nlink = narrow(self.nlink)?;
                let uid = narrow(self.uid)?;
                let gid = narrow(self.gid)?;
                let size = u32::try_from(self.size)
                    .map_err(|_| StreeError::Invalid("size too large for v1 stat data"))?;
                out.extend_from_slice(&self.mode.to_le_bytes());
                out.extend_from_slice(&nlink.to_le_bytes());
                out.extend_from_slice(&uid.to_le_bytes());
                out.extend_from_slice(&gid.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&self.atime.to_le_bytes());
                out.extend_from_slice(&self.mtime.to_le_bytes());
                out.extend_from_slice(&self.ctime.to_le_bytes());
                out.extend_from_slice(&self.blocks.to_le_bytes());
                // first direct byte; unused
                out.extend_from_slice(&u32::MAX.to_le_bytes());
            }
            KeyVersion::V2 => {
                out.extend_from_slice(&self.mode.to_le_bytes());
                out.extend_from_slice(&0u16.to_le_bytes());
                out.extend_from_slice(&self.nlink.to_le_bytes());
                out.extend_from_slice(&self.size.to_le_bytes());
                out.extend_from_slice(&self.uid.to_le_bytes());
                out.extend_from_slice(&self.gid.to_le_bytes());
                out.extend_from_slice(&self.atime.to_le_bytes());
                out.extend_from_slice(&self.mtime.to_le_bytes());
                out.extend_from_slice(&self.ctime.to_le_bytes());
                out.extend_from_slice(&self.blocks.to_le_bytes());
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        Ok(out)
    }

    /// Parses a record of either version.
    pub fn decode(body: &[u8], version: KeyVersion) -> Result<Self> {
        if body.len() != Self::encoded_len(version) {
            return Err(StreeError::Corruption("stat data has the wrong length"));
        }
        Ok(match version {
            KeyVersion::V1 => Self {
                mode: read_u16(body, 0),
                nlink: u32::from(read_u16(body, 2)),
                uid: u32::from(read_u16(body, 4)),
                gid: u32::from(read_u16(body, 6)),
                size: u64::from(read_u32(body, 8)),
                atime: read_u32(body, 12),
                mtime: read_u32(body, 16),
                ctime: read_u32(body, 20),
                blocks: read_u32(body, 24),
            },
            KeyVersion::V2 => Self {
                mode: read_u16(body, 0),
                nlink: read_u32(body, 4),
                size: read_u64(body, 8),
                uid: read_u32(body, 16),
                gid: read_u32(body, 20),
                atime: read_u32(body, 24),
                mtime: read_u32(body, 28),
                ctime: read_u32(body, 32),
                blocks: read_u32(body, 36),
            },
        })
    }
}

fn unix_now() -> u32 {
    OffsetDateTime::now_utc()
        .unix_timestamp()
        .clamp(0, i64::from(u32::MAX)) as u32
}
