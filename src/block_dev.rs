//!
//! 教程说明：
//! 这是文件系统与具体硬件/驱动之间的最小抽象边界。
//! 文件系统只依赖“按块读写”，不关心块设备底层是 virtio、SD 卡还是内存盘。
//! 设备类型的 inode（例如控制台）则通过 `CharDevice` 把读写转交给字符设备驱动。

use core::any::Any;

/// Trait for block devices
/// which reads and writes data in the unit of blocks
pub trait BlockDevice: Send + Sync + Any {
    /// Read data form block to buffer
    fn read_block(&self, block_id: usize, buf: &mut [u8]);
    /// Write data from buffer to block
    fn write_block(&self, block_id: usize, buf: &[u8]);
}

/// Trait for character devices reachable through device inodes.
///
/// The filesystem looks the driver up by the inode's major number and hands
/// it the minor number, so one driver may serve several device files.
pub trait CharDevice: Send + Sync {
    /// Read up to `buf.len()` bytes, returning how many were produced.
    fn read(&self, minor: u16, buf: &mut [u8]) -> usize;
    /// Write `buf`, returning how many bytes were consumed.
    fn write(&self, minor: u16, buf: &[u8]) -> usize;
}
