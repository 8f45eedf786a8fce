//! 错误类型。
//!
//! 教程阅读建议：
//!
//! - 磁盘或内存状态被破坏（日志溢出、重复释放、链接数下溢、未知 inode 类型）直接 panic，不在这里；
//! - 资源耗尽在内部用 `Option` 表示，到了对外接口才折算成 `NoInode` / `NoSpace`；
//! - 其余都是调用者可以处理的错误，失败时已获取的块、inode 锁和引用都会被释放。

use core::fmt;

/// Errors reported to filesystem callers.
///
/// Corruption of on-disk or in-memory state is not represented here: those
/// conditions panic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    /// A path component does not exist or could not be traversed.
    NotFound,
    /// A directory was required.
    NotDirectory,
    /// A non-directory was required.
    IsDirectory,
    /// The target name is already taken.
    AlreadyExists,
    /// The directory still has entries other than "." and "..".
    DirectoryNotEmpty,
    /// The name is empty, "." or "..", or otherwise unusable here.
    InvalidName,
    /// No free inode is left.
    NoInode,
    /// No free data block is left in any group.
    NoSpace,
    /// The write would exceed the maximum file size.
    FileTooLarge,
    /// The offset lies beyond the end of the file.
    InvalidOffset,
    /// No character device is registered for the inode's major number.
    NoDevice,
    /// The super block is missing or malformed, or the cache tuning does
    /// not fit its log and groups.
    BadSuperBlock,
    /// The handle was not opened for reading.
    NotReadable,
    /// The handle was not opened for writing.
    NotWritable,
    /// Hard links to directories are not allowed.
    CrossLinkDirectory,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotDirectory => "not a directory",
            FsError::IsDirectory => "is a directory",
            FsError::AlreadyExists => "file exists",
            FsError::DirectoryNotEmpty => "directory not empty",
            FsError::InvalidName => "invalid file name",
            FsError::NoInode => "no free inode",
            FsError::NoSpace => "no space left on device",
            FsError::FileTooLarge => "file too large",
            FsError::InvalidOffset => "offset beyond end of file",
            FsError::NoDevice => "no such device",
            FsError::BadSuperBlock => "bad super block",
            FsError::NotReadable => "file not readable",
            FsError::NotWritable => "file not writable",
            FsError::CrossLinkDirectory => "cannot hard-link a directory",
        };
        f.write_str(msg)
    }
}
