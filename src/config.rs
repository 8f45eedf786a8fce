//! 可调参数。
//!
//! 磁盘格式相关的常量在 `layout.rs`；这里只放运行时缓存参数与 mkfs 默认几何。

use crate::layout::SuperBlock;
use crate::FsError;

/// Default number of block groups created by `format`.
pub const DEFAULT_NUM_GROUPS: u32 = 10;
/// Default number of inodes created by `format`.
pub const DEFAULT_NUM_INODES: u32 = 200;
/// Default size of the group area in blocks.
pub const DEFAULT_GROUP_AREA_BLOCKS: u32 = 10000;

/// Smallest usable per-operation reservation: a bitmap block and a data
/// block, plus the indirect block, its bitmap block and the inode block.
pub(crate) const MIN_OP_BLOCKS: usize = 5;

/// Blocks besides bitmap blocks that freeing a whole file may sync in the
/// same operation: the parent's directory block, the parent's inode block
/// and the file's inode block.
const RECLAIM_EXTRA_BLOCKS: usize = 3;

/// Runtime tuning of the block cache.
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    /// Live-block count above which unheld, unpinned blocks get recycled.
    pub eviction_threshold: usize,
    /// Log blocks reserved by each `begin_op`; also the most distinct blocks
    /// one transaction may sync.
    pub op_max_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            eviction_threshold: 20,
            op_max_blocks: 16,
        }
    }
}

impl CacheConfig {
    /// Most data blocks one transaction may write through a file handle.
    ///
    /// Each data block may drag in its bitmap block, plus the indirect block,
    /// its bitmap block and the inode block once per transaction.
    pub fn max_write_blocks(&self) -> usize {
        (self.op_max_blocks.saturating_sub(4) / 2).max(1)
    }

    /// Check that this tuning can run every operation on a filesystem laid
    /// out as `sb`.
    ///
    /// The log must hold one reservation, and one reservation must hold
    /// every bitmap block of the image: freeing a file spread over all groups
    /// happens inside a single operation.
    pub fn check(&self, sb: &SuperBlock) -> Result<(), FsError> {
        let bitmap_blocks = sb.groups() * sb.bitmap_blocks_per_group as usize;
        if self.op_max_blocks < MIN_OP_BLOCKS
            || self.op_max_blocks > sb.log_capacity()
            || bitmap_blocks + RECLAIM_EXTRA_BLOCKS > self.op_max_blocks
        {
            return Err(FsError::BadSuperBlock);
        }
        Ok(())
    }
}
