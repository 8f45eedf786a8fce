//! 内存 inode 树。
//!
//! 教程阅读建议：
//!
//! - `InodeTree::get/share/put`：显式引用计数，最后一个引用且链接数为 0 时回收磁盘内容；
//! - `InodeTree::lock`：返回 `InodeGuard`，首次加锁时才从磁盘读入 `InodeEntry`；
//! - `InodeGuard::map_block`：直接块 / 间接块映射，以及按块组分散的分配策略；
//! - 目录操作（`lookup/insert/remove/is_empty`）都建立在字节区间读写之上。

use crate::block_cache::{BlockCache, OpContext};
use crate::layout::{
    DataBlock, DirEntry, IndirectBlock, InodeEntry, InodeType, SuperBlock, DIRENT_SZ,
    INODE_MAX_BYTES, INODE_NUM_DIRECT, INODE_NUM_INDIRECT,
};
use crate::sched::{Channel, Scheduler};
use crate::{CharDevice, FsError, BLOCK_SZ};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::mem::ManuallyDrop;
use log::{trace, warn};
use spin::{Mutex, MutexGuard};

/// Device number reported by `stat`.
const ROOT_DEV: u32 = 1;

struct InodeState {
    /// `entry` has been loaded from disk
    valid: bool,
    entry: InodeEntry,
}

/// In-memory inode.
///
/// Obtained from [`InodeTree::get`]; its content is only reachable through
/// the [`InodeGuard`] returned by [`InodeTree::lock`].
pub struct Inode {
    inode_no: usize,
    state: Mutex<InodeState>,
}

impl Inode {
    /// Inode number.
    pub fn inode_no(&self) -> usize {
        self.inode_no
    }
}

struct CachedInode {
    rc: usize,
    inode: Arc<Inode>,
}

/// File status, as reported by `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    /// device holding the inode
    pub dev: u32,
    /// inode number
    pub ino: usize,
    /// type of the inode
    pub kind: InodeType,
    /// number of hard links
    pub nlink: u16,
    /// size in bytes
    pub size: usize,
}

/// The in-memory inode cache plus group-aware inode allocation.
pub struct InodeTree {
    cache: Arc<BlockCache>,
    sched: Arc<dyn Scheduler>,
    sb: SuperBlock,
    /// live in-memory inodes and their reference counts
    inner: Mutex<Vec<CachedInode>>,
    /// character devices by major number
    devices: Mutex<BTreeMap<u16, Arc<dyn CharDevice>>>,
}

impl InodeTree {
    /// Create an empty inode cache over `cache`.
    pub fn new(cache: Arc<BlockCache>, sched: Arc<dyn Scheduler>) -> Self {
        let sb = *cache.super_block();
        Self {
            cache,
            sched,
            sb,
            inner: Mutex::new(Vec::new()),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// The block cache underneath.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Number of in-memory inodes.
    pub fn live_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Group owning inode `inode_no`.
    pub fn group_of(&self, inode_no: usize) -> usize {
        self.sb.group_of_inode(inode_no)
    }

    /// Route device inodes with `major` to `device`.
    pub fn register_device(&self, major: u16, device: Arc<dyn CharDevice>) {
        self.devices.lock().insert(major, device);
    }

    fn device(&self, major: u16) -> Result<Arc<dyn CharDevice>, FsError> {
        self.devices.lock().get(&major).cloned().ok_or(FsError::NoDevice)
    }

    /// Get the in-memory inode for `inode_no`, creating an unloaded one if
    /// it is not cached.
    pub fn get(&self, inode_no: usize) -> Arc<Inode> {
        assert!(
            inode_no >= 1 && inode_no <= self.sb.num_inodes as usize,
            "get: inode number {inode_no} out of range"
        );
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.iter_mut().find(|c| c.inode.inode_no == inode_no) {
            cached.rc += 1;
            return cached.inode.clone();
        }
        let inode = Arc::new(Inode {
            inode_no,
            state: Mutex::new(InodeState {
                valid: false,
                entry: InodeEntry::default(),
            }),
        });
        inner.push(CachedInode {
            rc: 1,
            inode: inode.clone(),
        });
        inode
    }

    /// Take another reference to `inode`.
    pub fn share(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let mut inner = self.inner.lock();
        let cached = inner
            .iter_mut()
            .find(|c| Arc::ptr_eq(&c.inode, inode))
            .unwrap_or_else(|| panic!("share: inode {} not cached", inode.inode_no));
        cached.rc += 1;
        cached.inode.clone()
    }

    /// Drop a reference to `inode`.
    ///
    /// The last reference to an inode without links frees its content and
    /// marks the on-disk entry free. The caller must not hold its lock.
    pub fn put(&self, ctx: &OpContext, inode: Arc<Inode>) {
        {
            let mut inner = self.inner.lock();
            let cached = inner
                .iter_mut()
                .find(|c| Arc::ptr_eq(&c.inode, &inode))
                .unwrap_or_else(|| panic!("put: inode {} not cached", inode.inode_no));
            if cached.rc > 1 {
                cached.rc -= 1;
                return;
            }
        }
        // 最后一个引用：计数保持为 1 直到回收完成，并发的 put 只会看到 rc > 1 的情形。
        // 链接数为 0 时也没有目录项能再找到它，不会有人与我们竞争这把锁。
        let (valid, links) = {
            let state = inode.state.lock();
            (state.valid, state.entry.num_links)
        };
        if valid && links == 0 {
            let mut guard = self.lock(&inode);
            guard.clear(ctx);
            guard.entry_mut().set_kind(InodeType::Invalid);
            guard.sync(ctx);
            guard.state.valid = false;
            trace!("put: reclaimed inode {}", inode.inode_no);
        }
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.iter().position(|c| Arc::ptr_eq(&c.inode, &inode)) {
            inner[pos].rc -= 1;
            if inner[pos].rc == 0 {
                inner.swap_remove(pos);
            }
        }
    }

    /// Lock `inode`, loading its entry on first use. Sleeps while another
    /// thread holds it.
    pub fn lock<'a>(&'a self, inode: &'a Inode) -> InodeGuard<'a> {
        let mut state = inode.state.try_lock();
        if state.is_none() {
            self.sched.sleep_until(Channel::Inode(inode.inode_no), &mut || {
                state = inode.state.try_lock();
                state.is_some()
            });
        }
        let Some(mut state) = state else {
            panic!("lock: woke up without inode {}", inode.inode_no);
        };
        if !state.valid {
            state.entry = self.read_entry(inode.inode_no);
            state.valid = true;
        }
        assert!(
            !state.entry.is_free(),
            "lock: inode {} is not allocated",
            inode.inode_no
        );
        InodeGuard {
            tree: self,
            inode,
            state: ManuallyDrop::new(state),
        }
    }

    fn read_entry(&self, inode_no: usize) -> InodeEntry {
        let (block_no, offset) = self.sb.inode_pos(inode_no);
        self.cache.acquire(block_no).read(offset, |e: &InodeEntry| *e)
    }

    /// Claim slot `inode_no` for `kind` if it is free.
    fn try_claim(&self, ctx: &OpContext, inode_no: usize, kind: InodeType) -> bool {
        let (block_no, offset) = self.sb.inode_pos(inode_no);
        let mut block = self.cache.acquire(block_no);
        let claimed = block.modify(offset, |e: &mut InodeEntry| {
            if e.is_free() {
                *e = InodeEntry::new(kind);
                true
            } else {
                false
            }
        });
        if claimed {
            self.cache.sync(Some(ctx), &block);
            trace!("alloc: inode {inode_no} as {kind:?}");
        }
        claimed
    }

    /// Allocate the first free inode of any group.
    pub fn alloc(&self, ctx: &OpContext, kind: InodeType) -> Option<usize> {
        assert_ne!(kind, InodeType::Invalid, "alloc: invalid inode type");
        let inode_no = (1..=self.sb.num_inodes as usize).find(|&no| self.try_claim(ctx, no, kind));
        if inode_no.is_none() {
            warn!("alloc: no free inode");
        }
        inode_no
    }

    /// Allocate an inode near `group`.
    ///
    /// Directories go to the group with the fewest used blocks, regular files
    /// to the first unsaturated group from `group` on, devices to `group`
    /// itself. Falls back to [`InodeTree::alloc`] when that group has no free
    /// slot.
    pub fn allocg(&self, ctx: &OpContext, kind: InodeType, group: usize) -> Option<usize> {
        assert_ne!(kind, InodeType::Invalid, "allocg: invalid inode type");
        let groups = self.sb.groups();
        let target = match kind {
            InodeType::Directory => (0..groups).min_by_key(|&g| self.cache.used_blocks(g)),
            InodeType::Regular => (group..groups).find(|&g| !self.cache.group_full(g)),
            _ => Some(group).filter(|&g| g < groups),
        };
        if let Some(target) = target {
            let ipg = self.sb.inodes_per_group();
            let first = target * ipg + 1;
            if let Some(inode_no) = (first..first + ipg).find(|&no| self.try_claim(ctx, no, kind)) {
                return Some(inode_no);
            }
        }
        self.alloc(ctx, kind)
    }

    /// Allocate a data block for an inode of `group`, trying that group first.
    fn alloc_block(&self, ctx: &OpContext, group: usize) -> Option<usize> {
        self.cache.allocg(ctx, group).or_else(|| self.cache.alloc(ctx))
    }

    /// Group for the `index`-th indirect slot: a target derived from the
    /// index, then every other group, then any group with room.
    fn indirect_group(&self, index: usize) -> Option<usize> {
        let groups = self.sb.groups();
        let per_group = if groups > 1 {
            INODE_NUM_INDIRECT / (groups - 1) * 2 + 1
        } else {
            INODE_NUM_INDIRECT
        };
        let target = (index / per_group + 1) % groups;
        (target..groups)
            .step_by(2)
            .chain(0..groups)
            .find(|&g| !self.cache.group_full(g))
    }
}

/// Exclusive hold on an inode's content. Unlocks on drop.
pub struct InodeGuard<'a> {
    tree: &'a InodeTree,
    inode: &'a Inode,
    state: ManuallyDrop<MutexGuard<'a, InodeState>>,
}

impl Drop for InodeGuard<'_> {
    fn drop(&mut self) {
        // 先放锁再唤醒，否则被唤醒者的 try_lock 会落空。
        unsafe { ManuallyDrop::drop(&mut self.state) };
        self.tree.sched.wakeup(Channel::Inode(self.inode.inode_no));
    }
}

impl InodeGuard<'_> {
    /// Release the lock.
    pub fn unlock(self) {}

    /// Inode number.
    pub fn inode_no(&self) -> usize {
        self.inode.inode_no
    }

    /// Cached on-disk entry.
    pub fn entry(&self) -> &InodeEntry {
        &self.state.entry
    }

    /// Mutable cached entry; call [`InodeGuard::sync`] to persist changes.
    pub fn entry_mut(&mut self) -> &mut InodeEntry {
        &mut self.state.entry
    }

    /// Type of the inode.
    pub fn kind(&self) -> InodeType {
        self.state.entry.kind()
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.state.entry.num_bytes as usize
    }

    /// Write the cached entry back under `ctx`.
    pub fn sync(&self, ctx: &OpContext) {
        let tree = self.tree;
        let (block_no, offset) = tree.sb.inode_pos(self.inode.inode_no);
        let entry = self.state.entry;
        let mut block = tree.cache.acquire(block_no);
        block.modify(offset, |e: &mut InodeEntry| *e = entry);
        tree.cache.sync(Some(ctx), &block);
    }

    /// File status.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: ROOT_DEV,
            ino: self.inode.inode_no,
            kind: self.kind(),
            nlink: self.state.entry.num_links,
            size: self.size(),
        }
    }

    /// Data block holding the `index`-th block of the file, if any.
    fn block_of(&self, index: usize) -> Option<usize> {
        let entry = &self.state.entry;
        if index < INODE_NUM_DIRECT {
            return Some(entry.addrs[index] as usize).filter(|&no| no != 0);
        }
        let index = index - INODE_NUM_DIRECT;
        if index >= INODE_NUM_INDIRECT || entry.indirect == 0 {
            return None;
        }
        let addr = self
            .tree
            .cache
            .acquire(entry.indirect as usize)
            .read(0, |addrs: &IndirectBlock| addrs[index]);
        Some(addr as usize).filter(|&no| no != 0)
    }

    /// Data block holding the `index`-th block of the file, allocating it
    /// and the indirect block on first touch. Sets `modified` when the entry
    /// changed. `None` when no group has room.
    fn map_block(&mut self, ctx: &OpContext, index: usize, modified: &mut bool) -> Option<usize> {
        let tree = self.tree;
        let group = tree.sb.group_of_inode(self.inode.inode_no);
        if index < INODE_NUM_DIRECT {
            let addr = self.state.entry.addrs[index];
            if addr != 0 {
                return Some(addr as usize);
            }
            let block_no = tree.alloc_block(ctx, group)?;
            self.state.entry.addrs[index] = block_no as u32;
            *modified = true;
            return Some(block_no);
        }

        let index = index - INODE_NUM_DIRECT;
        assert!(index < INODE_NUM_INDIRECT, "map: block index out of range");
        if self.state.entry.indirect == 0 {
            let block_no = tree.alloc_block(ctx, group)?;
            self.state.entry.indirect = block_no as u32;
            *modified = true;
        }

        let mut indirect = tree.cache.acquire(self.state.entry.indirect as usize);
        let addr = indirect.read(0, |addrs: &IndirectBlock| addrs[index]);
        if addr != 0 {
            return Some(addr as usize);
        }
        let block_no = tree
            .indirect_group(index)
            .and_then(|g| tree.cache.allocg(ctx, g))?;
        indirect.modify(0, |addrs: &mut IndirectBlock| addrs[index] = block_no as u32);
        tree.cache.sync(Some(ctx), &indirect);
        *modified = true;
        Some(block_no)
    }

    /// Read bytes starting at `offset` into `buf`, clamped to the file size.
    ///
    /// Device inodes read from their character device instead.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        let entry = &self.state.entry;
        if entry.kind() == InodeType::Device {
            let device = self.tree.device(entry.major)?;
            return Ok(device.read(entry.minor, buf));
        }
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let end = (offset + buf.len()).min(size);
        let mut start = offset;
        let mut read_size = 0;
        while start < end {
            let inner = start % BLOCK_SZ;
            let step = (end - start).min(BLOCK_SZ - inner);
            let dest = &mut buf[read_size..read_size + step];
            match self.block_of(start / BLOCK_SZ) {
                Some(block_no) => self
                    .tree
                    .cache
                    .acquire(block_no)
                    .read(0, |data: &DataBlock| dest.copy_from_slice(&data[inner..inner + step])),
                None => dest.fill(0),
            }
            read_size += step;
            start += step;
        }
        Ok(read_size)
    }

    /// Write `buf` at `offset` under `ctx`, extending the file as needed.
    ///
    /// `offset` may not lie past the end of the file. When blocks run out
    /// midway the bytes written so far are kept and counted.
    pub fn write_at(&mut self, ctx: &OpContext, offset: usize, buf: &[u8]) -> Result<usize, FsError> {
        let entry = &self.state.entry;
        if entry.kind() == InodeType::Device {
            let device = self.tree.device(entry.major)?;
            return Ok(device.write(entry.minor, buf));
        }
        if offset > self.size() {
            return Err(FsError::InvalidOffset);
        }
        let end = offset + buf.len();
        if end > INODE_MAX_BYTES {
            return Err(FsError::FileTooLarge);
        }

        let tree = self.tree;
        let mut modified = false;
        let mut start = offset;
        let mut write_size = 0;
        while start < end {
            let Some(block_no) = self.map_block(ctx, start / BLOCK_SZ, &mut modified) else {
                warn!("write: inode {} out of space", self.inode.inode_no);
                break;
            };
            let inner = start % BLOCK_SZ;
            let step = (end - start).min(BLOCK_SZ - inner);
            let src = &buf[write_size..write_size + step];
            let mut block = tree.cache.acquire(block_no);
            block.modify(0, |data: &mut DataBlock| data[inner..inner + step].copy_from_slice(src));
            tree.cache.sync(Some(ctx), &block);
            write_size += step;
            start += step;
        }

        if start > self.size() {
            self.state.entry.num_bytes = start as u32;
            modified = true;
        }
        if modified {
            self.sync(ctx);
        }
        if write_size == 0 && !buf.is_empty() {
            return Err(FsError::NoSpace);
        }
        Ok(write_size)
    }

    /// Free every data block and set the size to zero.
    pub fn clear(&mut self, ctx: &OpContext) {
        let cache = &self.tree.cache;
        let entry = &mut self.state.entry;
        for addr in entry.addrs.iter_mut().filter(|addr| **addr != 0) {
            cache.free(ctx, *addr as usize);
            *addr = 0;
        }
        if entry.indirect != 0 {
            let addrs = cache
                .acquire(entry.indirect as usize)
                .read(0, |addrs: &IndirectBlock| *addrs);
            for &addr in addrs.iter().filter(|addr| **addr != 0) {
                cache.free(ctx, addr as usize);
            }
            cache.free(ctx, entry.indirect as usize);
            entry.indirect = 0;
        }
        entry.num_bytes = 0;
        self.sync(ctx);
    }

    fn dirent_at(&self, index: usize) -> DirEntry {
        let mut dirent = DirEntry::empty();
        let read = self.read_at(index * DIRENT_SZ, dirent.as_bytes_mut());
        assert_eq!(read, Ok(DIRENT_SZ), "dirent: short read");
        dirent
    }

    fn num_dirents(&self) -> usize {
        assert!(self.state.entry.is_dir(), "not a directory");
        self.size() / DIRENT_SZ
    }

    /// Find `name` in this directory, returning `(inode_no, index)`.
    pub fn lookup(&self, name: &str) -> Option<(usize, usize)> {
        (0..self.num_dirents()).find_map(|i| {
            let dirent = self.dirent_at(i);
            (!dirent.is_free() && dirent.matches(name)).then(|| (dirent.inode_number(), i))
        })
    }

    /// Add `name -> inode_no`, reusing the first free slot or appending.
    /// Returns the entry index.
    pub fn insert(&mut self, ctx: &OpContext, name: &str, inode_no: usize) -> Result<usize, FsError> {
        let count = self.num_dirents();
        let index = (0..count)
            .find(|&i| self.dirent_at(i).is_free())
            .unwrap_or(count);
        let dirent = DirEntry::new(name, inode_no);
        match self.write_at(ctx, index * DIRENT_SZ, dirent.as_bytes())? {
            DIRENT_SZ => {
                trace!("insert: {name} -> {inode_no} in dir {}", self.inode.inode_no);
                Ok(index)
            }
            _ => Err(FsError::NoSpace),
        }
    }

    /// Clear entry `index`; out-of-range indices are ignored.
    pub fn remove(&mut self, ctx: &OpContext, index: usize) -> Result<(), FsError> {
        if index >= self.num_dirents() {
            return Ok(());
        }
        self.write_at(ctx, index * DIRENT_SZ, DirEntry::empty().as_bytes())?;
        trace!("remove: entry {index} of dir {}", self.inode.inode_no);
        Ok(())
    }

    /// Whether the directory holds nothing besides "." and "..".
    pub fn is_empty(&self) -> bool {
        (2..self.num_dirents()).all(|i| self.dirent_at(i).is_free())
    }

    /// Live entries as `(name, inode_no)`, in slot order.
    pub fn entries(&self) -> Vec<(String, usize)> {
        (0..self.num_dirents())
            .map(|i| self.dirent_at(i))
            .filter(|dirent| !dirent.is_free())
            .map(|dirent| (String::from(dirent.name()), dirent.inode_number()))
            .collect()
    }

    /// Names of live entries.
    pub fn readdir(&self) -> Vec<String> {
        self.entries().into_iter().map(|(name, _)| name).collect()
    }
}
