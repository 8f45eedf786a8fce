//! Layout of FileSystem Structure
//!
//! 磁盘布局：
//!
//! ```text
//! [ boot block | super block | log header + log blocks | group 0 | ... | group N-1 ]
//! group = [ inode blocks | bitmap blocks | data blocks ]
//! ```
//!
//! 所有记录都是 `#[repr(C)]` 的定长无符号整数，按小端序直接映射到块缓存中。
//! 位图只覆盖本组的数据区：第 `i` 位对应 `组起点 + data_offset + i` 号块。

use crate::config::{DEFAULT_GROUP_AREA_BLOCKS, DEFAULT_NUM_GROUPS, DEFAULT_NUM_INODES};
use crate::BLOCK_SZ;
use core::fmt::{Debug, Formatter, Result};
use core::mem::size_of;

/// FileSystem Magic Number
const FS_MAGIC: u32 = 0x4646_5331;
/// Block number of the super block.
pub const SUPER_BLOCK_NO: usize = 1;
/// Inode number of the root directory.
pub const ROOT_INODE_NO: usize = 1;
/// Number of direct block pointers in an inode.
pub const INODE_NUM_DIRECT: usize = 12;
/// Number of block pointers held by the indirect block.
pub const INODE_NUM_INDIRECT: usize = BLOCK_SZ / size_of::<u32>();
/// Largest number of data blocks one inode can address.
pub const INODE_MAX_BLOCKS: usize = INODE_NUM_DIRECT + INODE_NUM_INDIRECT;
/// Largest file size in bytes.
pub const INODE_MAX_BYTES: usize = INODE_MAX_BLOCKS * BLOCK_SZ;
/// Maximum length of a file name; names filling the field are not
/// null-terminated.
pub const FILE_NAME_MAX_LENGTH: usize = 14;
/// Maximum number of block numbers the log header can record.
pub const LOG_MAX_SIZE: usize = (BLOCK_SZ - size_of::<u32>()) / size_of::<u32>();
/// Bits in one bitmap block.
pub const BLOCK_BITS: usize = BLOCK_SZ * 8;
/// On-disk inodes per inode block.
pub const INODES_PER_BLOCK: usize = BLOCK_SZ / size_of::<InodeEntry>();
/// size of a directory entry
pub const DIRENT_SZ: usize = size_of::<DirEntry>();
/// Directory entries store inode numbers in 16 bits
pub const MAX_INODES: u32 = u16::MAX as u32;

/// A raw data block
pub type DataBlock = [u8; BLOCK_SZ];
/// Block that stores indirect block's indexes
pub type IndirectBlock = [u32; INODE_NUM_INDIRECT];
/// a bit map block
pub type BitmapBlock = [u64; BLOCK_SZ / 8];

/// Super block of a filesystem
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct SuperBlock {
    magic: u32,
    /// total number of blocks in filesystem
    pub num_blocks: u32,
    /// number of blocks for logging, including the log header
    pub num_log_blocks: u32,
    /// number of block groups
    pub num_groups: u32,
    /// number of inodes over all groups
    pub num_inodes: u32,
    /// number of blocks in a single block group
    pub blocks_per_group: u32,
    /// the first block of the logging area (the log header)
    pub log_start: u32,
    /// the first block of group 0
    pub group_start: u32,
    /// inode blocks in a single block group
    pub inode_blocks_per_group: u32,
    /// bitmap blocks in a single block group
    pub bitmap_blocks_per_group: u32,
    /// data blocks in a single block group
    pub data_blocks_per_group: u32,
    /// offset of the bitmap region inside a group
    pub bitmap_offset: u32,
    /// offset of the data region inside a group
    pub data_offset: u32,
}

impl Debug for SuperBlock {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("SuperBlock")
            .field("num_blocks", &self.num_blocks)
            .field("num_log_blocks", &self.num_log_blocks)
            .field("num_groups", &self.num_groups)
            .field("num_inodes", &self.num_inodes)
            .field("blocks_per_group", &self.blocks_per_group)
            .field("inode_blocks_per_group", &self.inode_blocks_per_group)
            .field("bitmap_blocks_per_group", &self.bitmap_blocks_per_group)
            .field("data_blocks_per_group", &self.data_blocks_per_group)
            .finish()
    }
}

impl SuperBlock {
    /// Whether the magic number matches and the geometry is self-consistent.
    pub fn is_valid(&self) -> bool {
        self.magic == FS_MAGIC
            && self.num_groups > 0
            && self.num_inodes >= self.num_groups
            && self.num_inodes <= MAX_INODES
            && self.num_log_blocks >= 2
            && self.data_offset == self.bitmap_offset + self.bitmap_blocks_per_group
            && self.blocks_per_group == self.data_offset + self.data_blocks_per_group
            && self.bitmap_blocks_per_group as usize * BLOCK_BITS
                >= self.data_blocks_per_group as usize
    }

    /// Number of groups.
    pub fn groups(&self) -> usize {
        self.num_groups as usize
    }

    /// Inodes owned by each group.
    pub fn inodes_per_group(&self) -> usize {
        (self.num_inodes / self.num_groups) as usize
    }

    /// First block of group `group`.
    pub fn group_base(&self, group: usize) -> usize {
        self.group_start as usize + group * self.blocks_per_group as usize
    }

    /// Group that owns inode `inode_no`.
    pub fn group_of_inode(&self, inode_no: usize) -> usize {
        (inode_no - 1) / self.inodes_per_group()
    }

    /// returns (block_id, inner_block_offset) of inode `inode_no`
    pub fn inode_pos(&self, inode_no: usize) -> (usize, usize) {
        assert!(
            inode_no >= 1 && inode_no <= self.num_inodes as usize,
            "inode number {inode_no} out of range"
        );
        let index = (inode_no - 1) % self.inodes_per_group();
        let block_id = self.group_base(self.group_of_inode(inode_no)) + index / INODES_PER_BLOCK;
        (block_id, index % INODES_PER_BLOCK * size_of::<InodeEntry>())
    }

    /// Block number of the `bit`-th data block of `group`.
    pub fn data_block(&self, group: usize, bit: usize) -> usize {
        self.group_base(group) + self.data_offset as usize + bit
    }

    /// Group owning data block `block_no`, if it lies in some data region.
    pub fn group_of_block(&self, block_no: usize) -> Option<usize> {
        let start = self.group_start as usize;
        if block_no < start {
            return None;
        }
        let group = (block_no - start) / self.blocks_per_group as usize;
        let offset = (block_no - start) % self.blocks_per_group as usize;
        let data = self.data_offset as usize;
        if group < self.groups() && offset >= data && offset < data + self.data_blocks_per_group as usize {
            Some(group)
        } else {
            None
        }
    }

    /// returns (group, bitmap block, bit inside that block) of data block `block_no`
    pub fn bitmap_pos(&self, block_no: usize) -> (usize, usize, usize) {
        let group = self
            .group_of_block(block_no)
            .unwrap_or_else(|| panic!("block {block_no} is not a data block"));
        let bit = block_no - self.data_block(group, 0);
        let bitmap_block = self.group_base(group) + self.bitmap_offset as usize + bit / BLOCK_BITS;
        (group, bitmap_block, bit % BLOCK_BITS)
    }

    /// Capacity of the log in blocks, excluding the header.
    pub fn log_capacity(&self) -> usize {
        (self.num_log_blocks as usize - 1).min(LOG_MAX_SIZE)
    }
}

/// Geometry requested when formatting an image.
#[derive(Clone, Copy, Debug)]
pub struct FsGeometry {
    /// Total blocks on the device.
    pub total_blocks: u32,
    /// Number of block groups.
    pub num_groups: u32,
    /// Number of inodes; rounded down to a multiple of `num_groups`.
    pub num_inodes: u32,
    /// Blocks reserved for the log, header included.
    pub log_blocks: u32,
}

impl Default for FsGeometry {
    fn default() -> Self {
        let log_blocks = LOG_MAX_SIZE as u32 + 1;
        Self {
            total_blocks: 2 + log_blocks + DEFAULT_GROUP_AREA_BLOCKS,
            num_groups: DEFAULT_NUM_GROUPS,
            num_inodes: DEFAULT_NUM_INODES,
            log_blocks,
        }
    }
}

impl FsGeometry {
    /// Lay out the super block, or `None` when the geometry cannot hold a
    /// filesystem.
    pub fn super_block(&self) -> Option<SuperBlock> {
        if self.num_groups == 0 || self.log_blocks < 2 || self.log_blocks as usize > LOG_MAX_SIZE + 1 {
            return None;
        }
        let group_start = 2 + self.log_blocks;
        let blocks_per_group = self.total_blocks.checked_sub(group_start)? / self.num_groups;
        let inodes_per_group = self.num_inodes / self.num_groups;
        if inodes_per_group == 0 || inodes_per_group * self.num_groups > MAX_INODES {
            return None;
        }
        let inode_blocks = inodes_per_group.div_ceil(INODES_PER_BLOCK as u32);
        let bitmap_blocks = blocks_per_group.div_ceil(BLOCK_BITS as u32);
        let data_blocks = blocks_per_group.checked_sub(inode_blocks + bitmap_blocks)?;
        if data_blocks == 0 {
            return None;
        }
        Some(SuperBlock {
            magic: FS_MAGIC,
            num_blocks: self.total_blocks,
            num_log_blocks: self.log_blocks,
            num_groups: self.num_groups,
            num_inodes: inodes_per_group * self.num_groups,
            blocks_per_group,
            log_start: 2,
            group_start,
            inode_blocks_per_group: inode_blocks,
            bitmap_blocks_per_group: bitmap_blocks,
            data_blocks_per_group: data_blocks,
            bitmap_offset: inode_blocks,
            data_offset: inode_blocks + bitmap_blocks,
        })
    }
}

/// Type of an on-disk inode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    /// free slot
    Invalid = 0,
    /// directory
    Directory = 1,
    /// regular file
    Regular = 2,
    /// character device
    Device = 3,
}

impl InodeType {
    /// Decode a raw type field; unknown values mean a corrupted inode table.
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Directory,
            2 => Self::Regular,
            3 => Self::Device,
            _ => panic!("unexpected inode type {raw}"),
        }
    }
}

/// On-disk inode. `kind == Invalid` implies this inode is free.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InodeEntry {
    kind: u16,
    /// major device id, for device inodes only
    pub major: u16,
    /// minor device id, for device inodes only
    pub minor: u16,
    /// number of hard links to this inode
    pub num_links: u16,
    /// file's total bytes
    pub num_bytes: u32,
    /// direct block numbers
    pub addrs: [u32; INODE_NUM_DIRECT],
    /// the indirect block number
    pub indirect: u32,
}

impl InodeEntry {
    /// A zeroed entry of the given type.
    pub fn new(kind: InodeType) -> Self {
        Self {
            kind: kind as u16,
            ..Self::default()
        }
    }

    /// Decoded type.
    pub fn kind(&self) -> InodeType {
        InodeType::from_raw(self.kind)
    }

    /// Overwrite the type.
    pub fn set_kind(&mut self, kind: InodeType) {
        self.kind = kind as u16;
    }

    /// Whether this slot is free.
    pub fn is_free(&self) -> bool {
        self.kind == InodeType::Invalid as u16
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind() == InodeType::Directory
    }
}

/// Directory entry. `inode_no == 0` implies this entry is free.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    inode_no: u16,
    name: [u8; FILE_NAME_MAX_LENGTH],
}

impl DirEntry {
    /// A free entry.
    pub fn empty() -> Self {
        Self {
            inode_no: 0,
            name: [0; FILE_NAME_MAX_LENGTH],
        }
    }

    /// An entry naming `inode_no`; longer names are cut to the field width.
    pub fn new(name: &str, inode_no: usize) -> Self {
        let mut bytes = [0u8; FILE_NAME_MAX_LENGTH];
        let name = truncate_name(name.as_bytes());
        bytes[..name.len()].copy_from_slice(name);
        assert!(inode_no <= MAX_INODES as usize, "dirent: inode number {inode_no} out of range");
        Self {
            inode_no: inode_no as u16,
            name: bytes,
        }
    }

    /// Serialize into bytes
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const _ as usize as *const u8, DIRENT_SZ) }
    }

    /// Serialize into mutable bytes
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self as *mut _ as usize as *mut u8, DIRENT_SZ) }
    }

    /// Raw name bytes, without padding.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(FILE_NAME_MAX_LENGTH);
        &self.name[..len]
    }

    /// Get name of the entry
    pub fn name(&self) -> &str {
        core::str::from_utf8(self.name_bytes()).unwrap_or("?")
    }

    /// Whether this entry is named `name`, comparing at most the field width.
    pub fn matches(&self, name: &str) -> bool {
        self.name_bytes() == truncate_name(name.as_bytes())
    }

    /// Get inode number of the entry
    pub fn inode_number(&self) -> usize {
        self.inode_no as usize
    }

    /// Whether the slot is unused.
    pub fn is_free(&self) -> bool {
        self.inode_no == 0
    }
}

/// Cut a name to `FILE_NAME_MAX_LENGTH` bytes.
pub(crate) fn truncate_name(name: &[u8]) -> &[u8] {
    &name[..name.len().min(FILE_NAME_MAX_LENGTH)]
}

/// On-disk log header: block numbers written ahead of their home locations.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogHeader {
    /// number of valid entries in `block_no`
    pub num_blocks: u32,
    /// home locations of the logged blocks, in log order
    pub block_no: [u32; LOG_MAX_SIZE],
}

impl LogHeader {
    /// An empty header.
    pub const fn empty() -> Self {
        Self {
            num_blocks: 0,
            block_no: [0; LOG_MAX_SIZE],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<InodeEntry>(), 64);
        assert_eq!(INODES_PER_BLOCK, 8);
        assert_eq!(DIRENT_SZ, 16);
        assert_eq!(size_of::<LogHeader>(), BLOCK_SZ);
        assert_eq!(size_of::<BitmapBlock>(), BLOCK_SZ);
        assert_eq!(size_of::<IndirectBlock>(), BLOCK_SZ);
        assert!(size_of::<SuperBlock>() <= BLOCK_SZ);
    }

    #[test]
    fn default_geometry() {
        let sb = FsGeometry::default().super_block().unwrap();
        assert!(sb.is_valid());
        assert_eq!(sb.num_groups, 10);
        assert_eq!(sb.num_inodes, 200);
        assert_eq!(sb.blocks_per_group, 1000);
        assert_eq!(sb.inode_blocks_per_group, 3);
        assert_eq!(sb.bitmap_blocks_per_group, 1);
        assert_eq!(sb.data_blocks_per_group, 996);
        assert_eq!(sb.log_capacity(), LOG_MAX_SIZE);
    }

    #[test]
    fn inode_count_fits_dir_entries() {
        let mut geometry = FsGeometry {
            total_blocks: 2 + 32 + 7 * 2000,
            num_groups: 7,
            num_inodes: 7 * 9363,
            log_blocks: 32,
        };
        assert!(geometry.super_block().is_none());

        // rounded down to a multiple of the group count first
        geometry.num_inodes = MAX_INODES + 1;
        let sb = geometry.super_block().unwrap();
        assert_eq!(sb.num_inodes, 7 * 9362);
        assert!(sb.is_valid());

        let mut forged = sb;
        forged.num_inodes = MAX_INODES + 1;
        assert!(!forged.is_valid());
    }

    #[test]
    #[should_panic]
    fn dir_entry_rejects_wide_inode_number() {
        DirEntry::new("x", MAX_INODES as usize + 1);
    }

    #[test]
    fn inode_and_block_positions() {
        let sb = FsGeometry {
            total_blocks: 2 + 32 + 4 * 100,
            num_groups: 4,
            num_inodes: 40,
            log_blocks: 32,
        }
        .super_block()
        .unwrap();
        assert_eq!(sb.inode_pos(1), (sb.group_start as usize, 0));
        assert_eq!(sb.inode_pos(9), (sb.group_start as usize + 1, 0));
        assert_eq!(sb.group_of_inode(10), 0);
        assert_eq!(sb.group_of_inode(11), 1);
        assert_eq!(sb.inode_pos(11), (sb.group_base(1), 0));

        let first = sb.data_block(2, 0);
        assert_eq!(sb.group_of_block(first), Some(2));
        assert_eq!(sb.group_of_block(sb.group_base(2)), None);
        let (group, bitmap, bit) = sb.bitmap_pos(first + 5);
        assert_eq!((group, bit), (2, 5));
        assert_eq!(bitmap, sb.group_base(2) + sb.bitmap_offset as usize);
    }

    #[test]
    fn dir_entry_names() {
        let e = DirEntry::new("exactly14bytes", 3);
        assert_eq!(e.name(), "exactly14bytes");
        assert!(e.matches("exactly14bytes-and-more"));
        let short = DirEntry::new("a", 2);
        assert!(short.matches("a"));
        assert!(!short.matches("ab"));
        assert!(DirEntry::empty().is_free());
    }

    #[test]
    #[should_panic]
    fn unknown_inode_type_is_fatal() {
        InodeType::from_raw(7);
    }
}
