//! 文件系统对外接口。
//!
//! 教程阅读建议：
//!
//! - 先看 `format` 与 `open_with`：格式化写入超级块与根目录，挂载时校验魔数并重放日志；
//! - 再看 `create`：父目录查找、重名处理、按块组分配 inode、"." 与 ".." 的链接计数；
//! - 最后看 `unlink` 与 `link`：目录项增删与链接计数，最后一次 `put` 负责回收。
//!
//! 每个对外操作都包在一次 `begin_op`/`end_op` 事务里；失败路径靠 RAII 释放块与 inode 锁。

use crate::block_cache::{BlockCache, OpContext};
use crate::config::CacheConfig;
use crate::file::{FileHandle, OpenFlags};
use crate::inode::{Inode, InodeGuard, InodeTree, Stat};
use crate::layout::{FsGeometry, InodeType, SuperBlock, ROOT_INODE_NO, SUPER_BLOCK_NO};
use crate::sched::Scheduler;
use crate::{BlockDevice, CharDevice, FsError, BLOCK_SZ};
use alloc::{string::String, sync::Arc, vec::Vec};
use core::mem::size_of;
use log::{debug, info, trace};

/// A mounted filesystem.
pub struct FileSystem {
    cache: Arc<BlockCache>,
    inodes: InodeTree,
    root: Arc<Inode>,
}

fn read_super_block(device: &dyn BlockDevice) -> SuperBlock {
    let mut buf = [0u8; BLOCK_SZ];
    device.read_block(SUPER_BLOCK_NO, &mut buf);
    unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const SuperBlock) }
}

fn write_super_block(device: &dyn BlockDevice, sb: &SuperBlock) {
    let mut buf = [0u8; BLOCK_SZ];
    let bytes = unsafe {
        core::slice::from_raw_parts(sb as *const _ as *const u8, size_of::<SuperBlock>())
    };
    buf[..bytes.len()].copy_from_slice(bytes);
    device.write_block(SUPER_BLOCK_NO, &buf);
}

impl FileSystem {
    /// Create a fresh filesystem on `device` and mount it.
    ///
    /// The device is zeroed, the super block written, and the root
    /// directory created with "." and ".." pointing at itself.
    pub fn format(
        device: Arc<dyn BlockDevice>,
        sched: Arc<dyn Scheduler>,
        geometry: FsGeometry,
    ) -> Result<Arc<Self>, FsError> {
        Self::format_with(device, sched, geometry, CacheConfig::default())
    }

    /// Format like [`FileSystem::format`] and mount with `config`.
    ///
    /// Fails with `BadSuperBlock` before touching the device when `config`
    /// cannot run on the requested geometry.
    pub fn format_with(
        device: Arc<dyn BlockDevice>,
        sched: Arc<dyn Scheduler>,
        geometry: FsGeometry,
        config: CacheConfig,
    ) -> Result<Arc<Self>, FsError> {
        let sb = geometry.super_block().ok_or(FsError::BadSuperBlock)?;
        config.check(&sb)?;
        debug!("format: {sb:?}");
        let zero = [0u8; BLOCK_SZ];
        for block_id in 0..sb.num_blocks as usize {
            device.write_block(block_id, &zero);
        }
        write_super_block(&*device, &sb);

        let cache = Arc::new(BlockCache::new(sb, device, sched.clone(), config));
        let inodes = InodeTree::new(cache.clone(), sched);
        let ctx = cache.begin_op();
        let root_no = inodes.alloc(&ctx, InodeType::Directory);
        assert_eq!(root_no, Some(ROOT_INODE_NO), "format: root inode");
        let root = inodes.get(ROOT_INODE_NO);
        let created = {
            let mut guard = inodes.lock(&root);
            guard.entry_mut().num_links = 1;
            guard.sync(&ctx);
            guard
                .insert(&ctx, ".", ROOT_INODE_NO)
                .and_then(|_| guard.insert(&ctx, "..", ROOT_INODE_NO))
        };
        cache.end_op(ctx);
        created?;
        Ok(Arc::new(Self {
            cache,
            inodes,
            root,
        }))
    }

    /// Mount the filesystem on `device` with default cache tuning.
    pub fn open(device: Arc<dyn BlockDevice>, sched: Arc<dyn Scheduler>) -> Result<Arc<Self>, FsError> {
        Self::open_with(device, sched, CacheConfig::default())
    }

    /// Mount the filesystem on `device`, replaying the log if the last
    /// session crashed.
    ///
    /// Fails with `BadSuperBlock` on a malformed image or when `config`
    /// does not fit its log and groups.
    pub fn open_with(
        device: Arc<dyn BlockDevice>,
        sched: Arc<dyn Scheduler>,
        config: CacheConfig,
    ) -> Result<Arc<Self>, FsError> {
        let sb = read_super_block(&*device);
        if !sb.is_valid() {
            return Err(FsError::BadSuperBlock);
        }
        config.check(&sb)?;
        info!("mount: {sb:?}");
        let cache = Arc::new(BlockCache::new(sb, device, sched.clone(), config));
        let inodes = InodeTree::new(cache.clone(), sched);
        let root = inodes.get(ROOT_INODE_NO);
        Ok(Arc::new(Self {
            cache,
            inodes,
            root,
        }))
    }

    /// The block cache.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// The inode tree.
    pub fn inodes(&self) -> &InodeTree {
        &self.inodes
    }

    /// The super block in use.
    pub fn super_block(&self) -> &SuperBlock {
        self.cache.super_block()
    }

    /// Another reference to the root directory.
    pub fn root(&self) -> Arc<Inode> {
        self.inodes.share(&self.root)
    }

    /// Route device inodes with `major` to `device`.
    pub fn register_device(&self, major: u16, device: Arc<dyn CharDevice>) {
        self.inodes.register_device(major, device);
    }

    /// Start an atomic operation.
    pub fn begin_op(&self) -> OpContext {
        self.cache.begin_op()
    }

    /// Finish an atomic operation; returns once it is durable.
    pub fn end_op(&self, ctx: OpContext) {
        self.cache.end_op(ctx);
    }

    /// Run `f` inside one atomic operation.
    fn transaction<V>(&self, f: impl FnOnce(&OpContext) -> V) -> V {
        let ctx = self.cache.begin_op();
        let result = f(&ctx);
        self.cache.end_op(ctx);
        result
    }

    /// Drop an inode reference obtained from this filesystem.
    pub fn release(&self, inode: Arc<Inode>) {
        self.transaction(|ctx| self.inodes.put(ctx, inode));
    }

    /// Resolve `path` to a directory, e.g. a new working directory.
    pub fn chdir(&self, path: &str, cwd: Option<&Arc<Inode>>) -> Result<Arc<Inode>, FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.inodes.namei(ctx, path, cwd).ok_or(FsError::NotFound)?;
            let is_dir = self.inodes.lock(&ip).kind() == InodeType::Directory;
            if is_dir {
                Ok(ip)
            } else {
                self.inodes.put(ctx, ip);
                Err(FsError::NotDirectory)
            }
        })
    }

    /// Create `path` as `kind` under `ctx`.
    ///
    /// An existing name is returned only when both it and `kind` are
    /// regular files; any other clash fails with `AlreadyExists`.
    pub fn create(
        &self,
        ctx: &OpContext,
        path: &str,
        kind: InodeType,
        major: u16,
        minor: u16,
        cwd: Option<&Arc<Inode>>,
    ) -> Result<Arc<Inode>, FsError> {
        if kind == InodeType::Invalid {
            return Err(FsError::InvalidName);
        }
        let (dp, name) = self.inodes.nameiparent(ctx, path, cwd).ok_or(FsError::NotFound)?;
        let result = self.create_at(ctx, &dp, &name, kind, major, minor);
        self.inodes.put(ctx, dp);
        result
    }

    fn create_at(
        &self,
        ctx: &OpContext,
        dp: &Arc<Inode>,
        name: &str,
        kind: InodeType,
        major: u16,
        minor: u16,
    ) -> Result<Arc<Inode>, FsError> {
        let mut dir = self.inodes.lock(dp);
        if let Some((inode_no, _)) = dir.lookup(name) {
            // 先放开父目录：name 可能就是 "."。
            drop(dir);
            let ip = self.inodes.get(inode_no);
            let existing = self.inodes.lock(&ip).kind();
            if kind == InodeType::Regular && existing == InodeType::Regular {
                return Ok(ip);
            }
            self.inodes.put(ctx, ip);
            return Err(FsError::AlreadyExists);
        }

        let group = self.inodes.group_of(dp.inode_no());
        let inode_no = self.inodes.allocg(ctx, kind, group).ok_or(FsError::NoInode)?;
        let ip = self.inodes.get(inode_no);
        let linked = {
            let mut guard = self.inodes.lock(&ip);
            let entry = guard.entry_mut();
            entry.major = major;
            entry.minor = minor;
            entry.num_links = 1;
            guard.sync(ctx);
            Self::link_new(ctx, &mut dir, &mut guard, name)
        };
        match linked {
            Ok(()) => {
                trace!("create: {name} as inode {inode_no} ({kind:?})");
                Ok(ip)
            }
            Err(err) => {
                drop(dir);
                self.drop_links(ctx, &ip);
                self.inodes.put(ctx, ip);
                Err(err)
            }
        }
    }

    /// Fill a new inode's "." and ".." and enter it into `dir`.
    fn link_new(
        ctx: &OpContext,
        dir: &mut InodeGuard<'_>,
        child: &mut InodeGuard<'_>,
        name: &str,
    ) -> Result<(), FsError> {
        let is_dir = child.kind() == InodeType::Directory;
        if is_dir {
            child.insert(ctx, ".", child.inode_no())?;
            child.insert(ctx, "..", dir.inode_no())?;
        }
        dir.insert(ctx, name, child.inode_no())?;
        if is_dir {
            dir.entry_mut().num_links += 1;
            dir.sync(ctx);
        }
        Ok(())
    }

    /// Zero the link count so the last `put` reclaims `ip`.
    fn drop_links(&self, ctx: &OpContext, ip: &Arc<Inode>) {
        let mut guard = self.inodes.lock(ip);
        guard.entry_mut().num_links = 0;
        guard.sync(ctx);
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, cwd: Option<&Arc<Inode>>) -> Result<(), FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.create(ctx, path, InodeType::Directory, 0, 0, cwd)?;
            self.inodes.put(ctx, ip);
            Ok(())
        })
    }

    /// Create a device file for driver `major`, unit `minor`.
    pub fn mknod(&self, path: &str, major: u16, minor: u16, cwd: Option<&Arc<Inode>>) -> Result<(), FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.create(ctx, path, InodeType::Device, major, minor, cwd)?;
            self.inodes.put(ctx, ip);
            Ok(())
        })
    }

    /// Remove the directory entry `path`.
    ///
    /// "." and ".." cannot be removed, nor can directories with entries.
    pub fn unlink(&self, path: &str, cwd: Option<&Arc<Inode>>) -> Result<(), FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let (dp, name) = self.inodes.nameiparent(ctx, path, cwd).ok_or(FsError::NotFound)?;
            let result = self.unlink_at(ctx, &dp, &name);
            self.inodes.put(ctx, dp);
            result
        })
    }

    fn unlink_at(&self, ctx: &OpContext, dp: &Arc<Inode>, name: &str) -> Result<(), FsError> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidName);
        }
        let mut dir = self.inodes.lock(dp);
        let (inode_no, index) = dir.lookup(name).ok_or(FsError::NotFound)?;
        let ip = self.inodes.get(inode_no);
        let result = {
            let mut guard = self.inodes.lock(&ip);
            assert!(guard.entry().num_links >= 1, "unlink: nlink < 1");
            Self::remove_entry(ctx, &mut dir, &mut guard, index)
        };
        drop(dir);
        // 链接数归零时，这次 put 回收内容。
        self.inodes.put(ctx, ip);
        result
    }

    fn remove_entry(
        ctx: &OpContext,
        dir: &mut InodeGuard<'_>,
        target: &mut InodeGuard<'_>,
        index: usize,
    ) -> Result<(), FsError> {
        let is_dir = target.kind() == InodeType::Directory;
        if is_dir && !target.is_empty() {
            return Err(FsError::DirectoryNotEmpty);
        }
        dir.remove(ctx, index)?;
        if is_dir {
            dir.entry_mut().num_links -= 1;
            dir.sync(ctx);
        }
        target.entry_mut().num_links -= 1;
        target.sync(ctx);
        trace!("unlink: inode {} now has {} links", target.inode_no(), target.entry().num_links);
        Ok(())
    }

    /// Add the name `new` for the non-directory `old`.
    pub fn link(&self, old: &str, new: &str, cwd: Option<&Arc<Inode>>) -> Result<(), FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.inodes.namei(ctx, old, cwd).ok_or(FsError::NotFound)?;
            {
                let mut guard = self.inodes.lock(&ip);
                if guard.kind() == InodeType::Directory {
                    drop(guard);
                    self.inodes.put(ctx, ip);
                    return Err(FsError::CrossLinkDirectory);
                }
                guard.entry_mut().num_links += 1;
                guard.sync(ctx);
            }
            let result = self.link_at(ctx, new, cwd, ip.inode_no());
            if result.is_err() {
                let mut guard = self.inodes.lock(&ip);
                guard.entry_mut().num_links -= 1;
                guard.sync(ctx);
            }
            self.inodes.put(ctx, ip);
            result
        })
    }

    fn link_at(&self, ctx: &OpContext, path: &str, cwd: Option<&Arc<Inode>>, inode_no: usize) -> Result<(), FsError> {
        let (dp, name) = self.inodes.nameiparent(ctx, path, cwd).ok_or(FsError::NotFound)?;
        let result = {
            let mut dir = self.inodes.lock(&dp);
            match dir.lookup(&name) {
                Some(_) => Err(FsError::AlreadyExists),
                None => dir.insert(ctx, &name, inode_no).map(|_| ()),
            }
        };
        self.inodes.put(ctx, dp);
        result
    }

    /// Names in the directory `path`, "." and ".." included.
    pub fn readdir(&self, path: &str, cwd: Option<&Arc<Inode>>) -> Result<Vec<String>, FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.inodes.namei(ctx, path, cwd).ok_or(FsError::NotFound)?;
            let names = {
                let guard = self.inodes.lock(&ip);
                if guard.kind() == InodeType::Directory {
                    Ok(guard.readdir())
                } else {
                    Err(FsError::NotDirectory)
                }
            };
            self.inodes.put(ctx, ip);
            names
        })
    }

    /// Status of `path`.
    pub fn stat(&self, path: &str, cwd: Option<&Arc<Inode>>) -> Result<Stat, FsError> {
        self.transaction(|ctx| -> Result<_, FsError> {
            let ip = self.inodes.namei(ctx, path, cwd).ok_or(FsError::NotFound)?;
            let stat = self.inodes.lock(&ip).stat();
            self.inodes.put(ctx, ip);
            Ok(stat)
        })
    }

    /// Open `path` as a file handle.
    ///
    /// `CREATE` makes a regular file if the name is free, `TRUNC` empties a
    /// regular file. Directories may only be opened read-only.
    pub fn open_file(
        self: &Arc<Self>,
        path: &str,
        flags: OpenFlags,
        cwd: Option<&Arc<Inode>>,
    ) -> Result<FileHandle, FsError> {
        let (readable, writable) = flags.read_write();
        let inode = self.transaction(|ctx| -> Result<_, FsError> {
            let ip = if flags.contains(OpenFlags::CREATE) {
                self.create(ctx, path, InodeType::Regular, 0, 0, cwd)?
            } else {
                self.inodes.namei(ctx, path, cwd).ok_or(FsError::NotFound)?
            };
            let checked = {
                let mut guard = self.inodes.lock(&ip);
                match guard.kind() {
                    InodeType::Directory if writable => Err(FsError::IsDirectory),
                    InodeType::Regular if flags.contains(OpenFlags::TRUNC) => {
                        guard.clear(ctx);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            };
            match checked {
                Ok(()) => Ok(ip),
                Err(err) => {
                    self.inodes.put(ctx, ip);
                    Err(err)
                }
            }
        })?;
        Ok(FileHandle::new(self.clone(), inode, readable, writable))
    }
}
