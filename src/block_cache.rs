//! 块缓存与预写日志。
//!
//! 教程阅读建议：
//!
//! - 先看 `acquire` / `release`：块在内存中只有一份，同一时刻只有一个持有者；
//! - 再看 `begin_op` / `sync` / `end_op`：事务只记录“碰过哪些块”，数据留在缓存里并被 pin 住；
//! - 最后看 `checkpoint` 与 `install`：先写日志区、再写日志头、再写回原位置、最后清空日志头，
//!   挂载时若日志头非空就重放一遍，这就是全部的崩溃恢复。

use crate::bitmap;
use crate::config::{CacheConfig, MIN_OP_BLOCKS};
use crate::layout::{BitmapBlock, DataBlock, LogHeader, SuperBlock, BLOCK_BITS};
use crate::sched::{Channel, Scheduler};
use crate::{BlockDevice, BLOCK_SZ};
use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::mem::{align_of, size_of};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, info, trace, warn};
use spin::Mutex;

/// Block content, aligned so on-disk records can be mapped in place.
#[repr(C, align(8))]
struct BlockData([u8; BLOCK_SZ]);

struct BlockBuf {
    /// loaded from the device
    valid: bool,
    data: BlockData,
}

impl BlockBuf {
    fn new() -> Self {
        Self {
            valid: false,
            data: BlockData([0; BLOCK_SZ]),
        }
    }

    /// get ref of data type `T` from block cache entry
    fn get_ref<T>(&self, offset: usize) -> &T {
        assert!(offset + size_of::<T>() <= BLOCK_SZ);
        assert_eq!(offset % align_of::<T>(), 0, "misaligned record at {offset}");
        unsafe { &*(self.data.0.as_ptr().add(offset) as *const T) }
    }

    /// get mut ref of data type `T` from block cache entry
    fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        assert!(offset + size_of::<T>() <= BLOCK_SZ);
        assert_eq!(offset % align_of::<T>(), 0, "misaligned record at {offset}");
        unsafe { &mut *(self.data.0.as_mut_ptr().add(offset) as *mut T) }
    }
}

/// One cached block. Metadata lives under the cache lock, the content under
/// its own lock which only the current holder touches.
struct Slot {
    block_no: usize,
    acquired: bool,
    pinned: bool,
    buf: Arc<Mutex<BlockBuf>>,
}

struct CacheInner {
    /// most recently acquired first
    slots: VecDeque<Slot>,
    /// in-memory copy of the log header
    header: LogHeader,
    /// last timestamp handed out by `begin_op`
    last_allocated_ts: usize,
    /// last timestamp known to be at its home location
    last_persisted_ts: usize,
    /// log capacity; zero while a checkpoint runs
    log_size: usize,
    /// log entries reserved or used by uncommitted operations
    log_used: usize,
    /// operations begun but not yet ended
    op_count: usize,
}

/// Exclusive handle to a cached block, released on drop.
pub struct Block<'a> {
    cache: &'a BlockCache,
    block_no: usize,
    buf: Arc<Mutex<BlockBuf>>,
}

impl Block<'_> {
    /// Global block number.
    pub fn block_no(&self) -> usize {
        self.block_no
    }

    /// Map closure `f` onto the `T` at `offset`.
    pub fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.buf.lock().get_ref(offset))
    }

    /// Map closure `f` onto the mutable `T` at `offset`.
    ///
    /// The change stays in memory until the block is passed to
    /// [`BlockCache::sync`].
    pub fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.buf.lock().get_mut(offset))
    }

    /// Release the exclusive hold.
    pub fn release(self) {}
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        self.cache.release_slot(self.block_no);
    }
}

/// An atomic operation in progress.
///
/// Obtained from [`BlockCache::begin_op`] and handed back to
/// [`BlockCache::end_op`]; in between every modified block must be passed to
/// [`BlockCache::sync`] with this context.
pub struct OpContext {
    ts: usize,
    capacity: usize,
    blocks: Mutex<Vec<usize>>,
}

impl OpContext {
    /// Timestamp assigned by `begin_op`.
    pub fn timestamp(&self) -> usize {
        self.ts
    }

    /// Distinct blocks touched so far.
    pub fn num_blocks(&self) -> usize {
        self.blocks.lock().len()
    }

    fn record(&self, block_no: usize) {
        let mut blocks = self.blocks.lock();
        if !blocks.contains(&block_no) {
            assert!(
                blocks.len() < self.capacity,
                "sync: operation touched more than {} blocks",
                self.capacity
            );
            blocks.push(block_no);
        }
    }
}

/// The block cache, owning the log and the group bitmap allocator.
pub struct BlockCache {
    sb: SuperBlock,
    device: Arc<dyn BlockDevice>,
    sched: Arc<dyn Scheduler>,
    config: CacheConfig,
    /// the block right after the log header
    log_start: usize,
    inner: Mutex<CacheInner>,
    /// data blocks in use per group, drives placement
    used_blocks: Vec<AtomicUsize>,
}

impl BlockCache {
    /// Build the cache over a formatted device and recover from the log.
    ///
    /// Panics if the reservation does not fit the log; `FileSystem` rejects
    /// such tuning through [`CacheConfig::check`] before getting here.
    pub fn new(
        sb: SuperBlock,
        device: Arc<dyn BlockDevice>,
        sched: Arc<dyn Scheduler>,
        config: CacheConfig,
    ) -> Self {
        let log_size = sb.log_capacity();
        assert!(
            config.op_max_blocks >= MIN_OP_BLOCKS && config.op_max_blocks <= log_size,
            "per-operation reservation {} does not fit a log of {} blocks",
            config.op_max_blocks,
            log_size
        );
        let cache = Self {
            sb,
            device,
            sched,
            config,
            log_start: sb.log_start as usize + 1,
            inner: Mutex::new(CacheInner {
                slots: VecDeque::new(),
                header: LogHeader::empty(),
                last_allocated_ts: 0,
                last_persisted_ts: 0,
                log_size,
                log_used: 0,
                op_count: 0,
            }),
            used_blocks: (0..sb.groups()).map(|_| AtomicUsize::new(0)).collect(),
        };
        cache.replay();
        cache.count_used_blocks();
        cache
    }

    /// The super block this cache was built with.
    pub fn super_block(&self) -> &SuperBlock {
        &self.sb
    }

    /// Tuning in effect.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of blocks currently held in memory.
    pub fn num_cached_blocks(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Number of operations begun but not yet ended.
    pub fn outstanding_ops(&self) -> usize {
        self.inner.lock().op_count
    }

    /// Log entries currently reserved or used.
    pub fn log_used(&self) -> usize {
        self.inner.lock().log_used
    }

    /// Data blocks in use in `group`.
    pub fn used_blocks(&self, group: usize) -> usize {
        self.used_blocks[group].load(Ordering::Relaxed)
    }

    /// Whether `group` has no free data block left.
    pub fn group_full(&self, group: usize) -> bool {
        self.used_blocks(group) >= self.sb.data_blocks_per_group as usize
    }

    /// Get exclusive access to block `block_no`, loading it on first touch.
    ///
    /// Sleeps while another thread holds the block.
    pub fn acquire(&self, block_no: usize) -> Block<'_> {
        let mut buf = self.try_acquire(block_no);
        if buf.is_none() {
            self.sched.sleep_until(Channel::Block(block_no), &mut || {
                buf = self.try_acquire(block_no);
                buf.is_some()
            });
        }
        let buf = match buf {
            Some(buf) => buf,
            None => panic!("acquire: woke up without block {block_no}"),
        };
        {
            let mut guard = buf.lock();
            if !guard.valid {
                self.device.read_block(block_no, &mut guard.data.0);
                guard.valid = true;
            }
        }
        Block {
            cache: self,
            block_no,
            buf,
        }
    }

    /// Find or make the slot for `block_no` and mark it acquired, or `None`
    /// if someone else holds it.
    fn try_acquire(&self, block_no: usize) -> Option<Arc<Mutex<BlockBuf>>> {
        let mut inner = self.inner.lock();
        let mut found = None;
        let mut victim = None;
        for (i, slot) in inner.slots.iter().enumerate() {
            if slot.block_no == block_no {
                found = Some(i);
                break;
            }
            // 顺带记下离表头最远的可淘汰块。
            if !slot.acquired && !slot.pinned {
                victim = Some(i);
            }
        }
        let index = match (found, victim) {
            (Some(i), _) if inner.slots[i].acquired => return None,
            (Some(i), _) => i,
            (None, Some(i)) if inner.slots.len() >= self.config.eviction_threshold => {
                let slot = &mut inner.slots[i];
                slot.block_no = block_no;
                slot.buf.lock().valid = false;
                i
            }
            (None, _) => {
                inner.slots.push_front(Slot {
                    block_no,
                    acquired: false,
                    pinned: false,
                    buf: Arc::new(Mutex::new(BlockBuf::new())),
                });
                0
            }
        };
        let mut slot = inner.slots.remove(index)?;
        slot.acquired = true;
        let buf = slot.buf.clone();
        inner.slots.push_front(slot);
        Some(buf)
    }

    fn release_slot(&self, block_no: usize) {
        if let Some(slot) = self
            .inner
            .lock()
            .slots
            .iter_mut()
            .find(|slot| slot.block_no == block_no)
        {
            slot.acquired = false;
        }
        self.sched.wakeup(Channel::Block(block_no));
    }

    fn set_pinned(&self, block_no: usize, pinned: bool) {
        if let Some(slot) = self
            .inner
            .lock()
            .slots
            .iter_mut()
            .find(|slot| slot.block_no == block_no)
        {
            slot.pinned = pinned;
        }
    }

    /// Release the exclusive hold on `block`.
    pub fn release(&self, block: Block<'_>) {
        drop(block);
    }

    /// Start an atomic operation, sleeping while the log lacks room for a
    /// full reservation.
    pub fn begin_op(&self) -> OpContext {
        let mut ts = 0;
        self.sched.sleep_until(Channel::LogSpace, &mut || {
            let mut inner = self.inner.lock();
            if inner.log_used + self.config.op_max_blocks > inner.log_size {
                return false;
            }
            inner.log_used += self.config.op_max_blocks;
            inner.last_allocated_ts += 1;
            inner.op_count += 1;
            ts = inner.last_allocated_ts;
            true
        });
        trace!("begin_op: ts = {ts}");
        OpContext {
            ts,
            capacity: self.config.op_max_blocks,
            blocks: Mutex::new(Vec::new()),
        }
    }

    /// Record `block` in `ctx` and pin it, or write it straight to the
    /// device when `ctx` is `None`.
    pub fn sync(&self, ctx: Option<&OpContext>, block: &Block<'_>) {
        match ctx {
            Some(ctx) => {
                ctx.record(block.block_no);
                self.set_pinned(block.block_no, true);
            }
            None => {
                let buf = block.buf.lock();
                self.device.write_block(block.block_no, &buf.data.0);
            }
        }
    }

    /// Merge the blocks of `ctx` into the log header and return unused
    /// reservation.
    ///
    /// NOTE: the caller must hold the cache lock.
    fn commit(&self, inner: &mut CacheInner, ctx: &OpContext) {
        let blocks = ctx.blocks.lock();
        let mut absorbed = 0;
        for &block_no in blocks.iter() {
            let n = inner.header.num_blocks as usize;
            if inner.header.block_no[..n].contains(&(block_no as u32)) {
                absorbed += 1;
                continue;
            }
            assert!(n < inner.log_size, "commit: log overflow");
            inner.header.block_no[n] = block_no as u32;
            inner.header.num_blocks += 1;
        }
        let unused = self.config.op_max_blocks - blocks.len();
        inner.log_used -= unused + absorbed;
    }

    /// Finish `ctx`. Returns only after a checkpoint covering it completed.
    ///
    /// The caller seeing the operation count drop to zero runs the
    /// checkpoint itself.
    pub fn end_op(&self, ctx: OpContext) {
        let saved_log_size = {
            let mut inner = self.inner.lock();
            self.commit(&mut inner, &ctx);
            inner.op_count -= 1;
            if inner.op_count == 0 {
                // 容量清零，挡住所有新的 begin_op。
                let size = inner.log_size;
                inner.log_size = 0;
                Some(size)
            } else {
                None
            }
        };
        self.sched.wakeup(Channel::LogSpace);

        match saved_log_size {
            Some(log_size) => {
                self.checkpoint();
                {
                    let mut inner = self.inner.lock();
                    inner.log_size = log_size;
                    inner.log_used = 0;
                }
                self.sched.wakeup(Channel::LogSpace);
            }
            None => {
                let ts = ctx.ts;
                self.sched.sleep_until(Channel::Checkpoint, &mut || {
                    self.inner.lock().last_persisted_ts >= ts
                });
            }
        }
    }

    /// Persist every logged block: log area, header, home locations, then
    /// clear the header.
    ///
    /// NOTE: runs without the cache lock; only one thread gets here at a time.
    fn checkpoint(&self) {
        let header = self.inner.lock().header;
        let n = header.num_blocks as usize;
        debug!("checkpoint: {n} blocks");

        // step 1: write blocks into the logging area first.
        for (i, &home) in header.block_no[..n].iter().enumerate() {
            let src = self.acquire(home as usize);
            let mut dest = self.acquire(self.log_start + i);
            copy_block(&src, &mut dest);
            src.release();
            self.sync(None, &dest);
        }

        // step 2: the header makes the whole batch durable.
        self.write_header(&header);

        // step 3 & 4: install and clear.
        self.install(&header);

        {
            let mut inner = self.inner.lock();
            inner.last_persisted_ts = inner.last_allocated_ts;
        }
        self.sched.wakeup(Channel::Checkpoint);
    }

    /// Copy logged blocks to their home locations, unpin them and clear the
    /// log header.
    fn install(&self, header: &LogHeader) {
        let n = header.num_blocks as usize;
        for (i, &home) in header.block_no[..n].iter().enumerate() {
            let src = self.acquire(self.log_start + i);
            let mut dest = self.acquire(home as usize);
            copy_block(&src, &mut dest);
            src.release();
            self.sync(None, &dest);
            self.set_pinned(home as usize, false);
        }
        self.inner.lock().header = LogHeader::empty();
        self.write_header(&LogHeader::empty());
    }

    /// Recover from a crash: install whatever the persisted header lists.
    fn replay(&self) {
        let header = self.acquire(self.sb.log_start as usize).read(0, |h: &LogHeader| *h);
        assert!(
            header.num_blocks as usize <= self.sb.log_capacity(),
            "replay: corrupted log header"
        );
        if header.num_blocks > 0 {
            info!("replaying {} logged blocks", header.num_blocks);
            self.install(&header);
        }
    }

    fn write_header(&self, header: &LogHeader) {
        let mut block = self.acquire(self.sb.log_start as usize);
        block.modify(0, |h: &mut LogHeader| *h = *header);
        self.sync(None, &block);
    }

    fn count_used_blocks(&self) {
        let data_blocks = self.sb.data_blocks_per_group as usize;
        for group in 0..self.sb.groups() {
            let mut used = 0;
            for i in 0..self.sb.bitmap_blocks_per_group as usize {
                let limit = data_blocks.saturating_sub(i * BLOCK_BITS);
                if limit == 0 {
                    break;
                }
                let bitmap_no = self.sb.group_base(group) + self.sb.bitmap_offset as usize + i;
                used += self
                    .acquire(bitmap_no)
                    .read(0, |b: &BitmapBlock| bitmap::count_bits(b, limit));
            }
            self.used_blocks[group].store(used, Ordering::Relaxed);
        }
    }

    /// Allocate a zeroed data block from `group` only.
    pub fn allocg(&self, ctx: &OpContext, group: usize) -> Option<usize> {
        assert!(group < self.sb.groups(), "allocg: no group {group}");
        let data_blocks = self.sb.data_blocks_per_group as usize;
        for i in 0..self.sb.bitmap_blocks_per_group as usize {
            let limit = data_blocks.saturating_sub(i * BLOCK_BITS);
            if limit == 0 {
                break;
            }
            let bitmap_no = self.sb.group_base(group) + self.sb.bitmap_offset as usize + i;
            let mut bitmap = self.acquire(bitmap_no);
            let bit = bitmap.modify(0, |b: &mut BitmapBlock| bitmap::alloc_bit(b, limit));
            if let Some(bit) = bit {
                self.sync(Some(ctx), &bitmap);
                bitmap.release();

                let block_no = self.sb.data_block(group, i * BLOCK_BITS + bit);
                let mut block = self.acquire(block_no);
                block.modify(0, |data: &mut DataBlock| data.fill(0));
                self.sync(Some(ctx), &block);
                self.used_blocks[group].fetch_add(1, Ordering::Relaxed);
                trace!("allocg: block {block_no} in group {group}");
                return Some(block_no);
            }
        }
        None
    }

    /// Allocate a zeroed data block from the first group with room.
    pub fn alloc(&self, ctx: &OpContext) -> Option<usize> {
        let block_no = (0..self.sb.groups()).find_map(|group| self.allocg(ctx, group));
        if block_no.is_none() {
            warn!("alloc: no free block");
        }
        block_no
    }

    /// Return data block `block_no` to its group's bitmap.
    pub fn free(&self, ctx: &OpContext, block_no: usize) {
        let (group, bitmap_no, bit) = self.sb.bitmap_pos(block_no);
        let mut bitmap = self.acquire(bitmap_no);
        bitmap.modify(0, |b: &mut BitmapBlock| bitmap::clear_bit(b, bit));
        self.sync(Some(ctx), &bitmap);
        self.used_blocks[group].fetch_sub(1, Ordering::Relaxed);
        trace!("free: block {block_no} in group {group}");
    }
}

fn copy_block(src: &Block<'_>, dest: &mut Block<'_>) {
    let data = src.read(0, |data: &DataBlock| *data);
    dest.modify(0, |d: &mut DataBlock| *d = data);
}
