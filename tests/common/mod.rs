#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tg_ffs::{BlockDevice, CacheConfig, Channel, FileSystem, FsGeometry, Scheduler, BLOCK_SZ};

pub type Image = Vec<[u8; BLOCK_SZ]>;

/// RAM disk that can lose power: once the write budget is spent, further
/// writes are silently dropped.
pub struct MemDevice {
    blocks: Mutex<Image>,
    budget: Mutex<Option<usize>>,
    writes: AtomicUsize,
}

impl MemDevice {
    pub fn new(num_blocks: usize) -> Arc<Self> {
        Self::from_image(vec![[0u8; BLOCK_SZ]; num_blocks])
    }

    pub fn from_image(image: Image) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(image),
            budget: Mutex::new(None),
            writes: AtomicUsize::new(0),
        })
    }

    /// Copy of what survived on the medium.
    pub fn snapshot(&self) -> Image {
        self.blocks.lock().unwrap().clone()
    }

    pub fn block(&self, block_id: usize) -> [u8; BLOCK_SZ] {
        self.blocks.lock().unwrap()[block_id]
    }

    /// Let `n` more writes through, drop the rest.
    pub fn cut_power_after(&self, n: usize) {
        *self.budget.lock().unwrap() = Some(n);
    }

    /// Writes issued so far, dropped ones included.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_id: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.blocks.lock().unwrap()[block_id]);
    }

    fn write_block(&self, block_id: usize, buf: &[u8]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut budget = self.budget.lock().unwrap();
        match budget.as_mut() {
            Some(0) => return,
            Some(n) => *n -= 1,
            None => {}
        }
        self.blocks.lock().unwrap()[block_id].copy_from_slice(buf);
    }
}

/// One condition variable for every channel: the predicate is re-checked
/// under the monitor lock, so no wakeup is lost.
#[derive(Default)]
pub struct CondvarScheduler {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Scheduler for CondvarScheduler {
    fn sleep_until(&self, _chan: Channel, try_proceed: &mut dyn FnMut() -> bool) {
        let mut guard = self.lock.lock().unwrap();
        while !try_proceed() {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    fn wakeup(&self, _chan: Channel) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }
}

pub fn scheduler() -> Arc<dyn Scheduler> {
    Arc::new(CondvarScheduler::default())
}

/// 4 groups of 200 blocks, 10 inodes each, a 40-block log.
pub fn small_geometry() -> FsGeometry {
    FsGeometry {
        total_blocks: 2 + 41 + 4 * 200,
        num_groups: 4,
        num_inodes: 40,
        log_blocks: 41,
    }
}

pub fn setup(geometry: FsGeometry) -> (Arc<MemDevice>, Arc<FileSystem>) {
    let device = MemDevice::new(geometry.total_blocks as usize);
    let fs = FileSystem::format(device.clone(), scheduler(), geometry).unwrap();
    (device, fs)
}

/// Mount a copy of `image`, as after a reboot.
pub fn remount(image: &Image) -> (Arc<MemDevice>, Arc<FileSystem>) {
    remount_with(image, CacheConfig::default())
}

pub fn remount_with(image: &Image, config: CacheConfig) -> (Arc<MemDevice>, Arc<FileSystem>) {
    let device = MemDevice::from_image(image.clone());
    let fs = FileSystem::open_with(device.clone(), scheduler(), config).unwrap();
    (device, fs)
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}
