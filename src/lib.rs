//! 一个带块组与预写日志的文件系统实现。
//!
//! 本 crate 是教学内核的磁盘文件系统层：ext2 风格的块组布局，
//! 加上 xv6 风格的预写日志（write-ahead log）保证崩溃一致性。
//!
//! 教程阅读建议：
//!
//! - 先看 `layout.rs`：理解磁盘布局（boot/super/log/块组）；
//! - 再看 `block_cache.rs`：理解块缓存、事务、checkpoint 与崩溃恢复；
//! - 然后看 `inode.rs`：理解 inode 引用计数、块映射与目录项操作；
//! - 最后看 `path.rs` 与 `fs.rs`：理解路径解析与 create/unlink 等组合操作。

#![no_std]
#![deny(warnings, missing_docs)]
extern crate alloc;

mod bitmap;
mod block_cache;
mod block_dev;
mod config;
mod error;
mod file;
mod fs;
mod inode;
mod layout;
mod path;
mod sched;

/// Use a block size of 512 bytes
pub const BLOCK_SZ: usize = 512;

pub use block_cache::{Block, BlockCache, OpContext};
pub use block_dev::{BlockDevice, CharDevice};
pub use config::CacheConfig;
pub use error::FsError;
pub use file::{read_all, FileHandle, OpenFlags};
pub use fs::FileSystem;
pub use inode::{Inode, InodeGuard, InodeTree, Stat};
pub use layout::{
    DirEntry, FsGeometry, InodeEntry, InodeType, SuperBlock, DIRENT_SZ, FILE_NAME_MAX_LENGTH,
    INODE_MAX_BYTES, INODE_NUM_DIRECT, INODE_NUM_INDIRECT, LOG_MAX_SIZE, ROOT_INODE_NO,
};
pub use sched::{Channel, Scheduler};
