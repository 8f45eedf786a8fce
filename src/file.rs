use crate::fs::FileSystem;
use crate::inode::{Inode, Stat};
use crate::{FsError, BLOCK_SZ};
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::*;
use core::sync::atomic::{AtomicUsize, Ordering};

// 教程阅读建议：
// - 先看 `OpenFlags`：打开模式如何折算成“可读/可写”；
// - 再看 `FileHandle::write`：大块写入被切成多个事务，每个事务都不超过日志预留。

bitflags! {
  /// Open file flags
  pub struct OpenFlags: u32 {
      /// Read only
      const RDONLY = 0;
      /// Write only
      const WRONLY = 1 << 0;
      /// Read & Write
      const RDWR = 1 << 1;
      /// Allow create
      const CREATE = 1 << 9;
      /// Clear file and return an empty one
      const TRUNC = 1 << 10;
  }
}

impl OpenFlags {
    /// Do not check validity for simplicity
    /// Return (readable, writable)
    pub fn read_write(&self) -> (bool, bool) {
        if self.contains(Self::WRONLY) {
            (false, true)
        } else if self.contains(Self::RDWR) {
            (true, true)
        } else {
            (true, false)
        }
    }
}

/// An open file: inode reference, access mode and current offset.
///
/// Dropping the handle releases the inode reference, reclaiming the inode
/// if it was already unlinked.
pub struct FileHandle {
    fs: Arc<FileSystem>,
    inode: Option<Arc<Inode>>,
    readable: bool,
    writable: bool,
    offset: AtomicUsize,
}

impl FileHandle {
    pub(crate) fn new(fs: Arc<FileSystem>, inode: Arc<Inode>, readable: bool, writable: bool) -> Self {
        Self {
            fs,
            inode: Some(inode),
            readable,
            writable,
            offset: AtomicUsize::new(0),
        }
    }

    fn inode(&self) -> &Arc<Inode> {
        match &self.inode {
            Some(inode) => inode,
            None => unreachable!("file handle used after close"),
        }
    }

    /// 是否可读。
    pub fn readable(&self) -> bool {
        self.readable
    }

    /// 是否可写。
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Current offset.
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    /// Move the offset to `offset`.
    pub fn seek(&self, offset: usize) {
        self.offset.store(offset, Ordering::Relaxed);
    }

    /// Read from the current offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        if !self.readable {
            return Err(FsError::NotReadable);
        }
        let guard = self.fs.inodes().lock(self.inode());
        let read_size = guard.read_at(self.offset(), buf)?;
        self.offset.fetch_add(read_size, Ordering::Relaxed);
        Ok(read_size)
    }

    /// Write at the current offset, advancing it.
    ///
    /// Long writes are split into several transactions. Returns the bytes
    /// written, fewer than `buf.len()` only when space ran out midway.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        if !self.writable {
            return Err(FsError::NotWritable);
        }
        let max_blocks = self.fs.cache().config().max_write_blocks();
        let mut write_size = 0;
        while write_size < buf.len() {
            let offset = self.offset();
            // 切到块边界，保证一次事务最多碰 max_blocks 个数据块。
            let limit = (offset / BLOCK_SZ + max_blocks) * BLOCK_SZ - offset;
            let chunk = &buf[write_size..buf.len().min(write_size + limit)];
            let ctx = self.fs.begin_op();
            let result = self.fs.inodes().lock(self.inode()).write_at(&ctx, offset, chunk);
            self.fs.end_op(ctx);
            let n = match result {
                Ok(n) => n,
                Err(err) if write_size == 0 => return Err(err),
                Err(_) => break,
            };
            self.offset.fetch_add(n, Ordering::Relaxed);
            write_size += n;
            if n < chunk.len() {
                break;
            }
        }
        Ok(write_size)
    }

    /// Status of the open inode.
    pub fn stat(&self) -> Stat {
        self.fs.inodes().lock(self.inode()).stat()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if let Some(inode) = self.inode.take() {
            self.fs.release(inode);
        }
    }
}

/// 读取文件的全部内容到 Vec<u8>
///
/// 从偏移 0 开始逐块读取，直到读取长度为 0（表示文件结束）。
pub fn read_all(fd: &FileHandle) -> Result<Vec<u8>, FsError> {
    let mut buffer = [0u8; BLOCK_SZ];
    let mut v: Vec<u8> = Vec::new();
    fd.seek(0);
    loop {
        let len = fd.read(&mut buffer)?;
        if len == 0 {
            break;
        }
        v.extend_from_slice(&buffer[..len]);
    }
    Ok(v)
}
