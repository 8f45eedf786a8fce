mod common;

use common::{remount, scheduler, setup, small_geometry, MemDevice};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tg_ffs::{BlockCache, CacheConfig, FileSystem, FsError, FsGeometry, BLOCK_SZ};

type Data = [u8; BLOCK_SZ];

fn fill(cache: &BlockCache, ctx: &tg_ffs::OpContext, block_no: usize, byte: u8) {
    let mut block = cache.acquire(block_no);
    block.modify(0, |data: &mut Data| data.fill(byte));
    cache.sync(Some(ctx), &block);
}

fn content(cache: &BlockCache, block_no: usize) -> Data {
    cache.acquire(block_no).read(0, |data: &Data| *data)
}

#[test]
fn end_op_is_durable() {
    let (device, fs) = setup(small_geometry());
    let cache = fs.cache();
    let ctx = cache.begin_op();
    let block_no = cache.alloc(&ctx).unwrap();
    fill(cache, &ctx, block_no, 0xab);
    cache.end_op(ctx);

    assert_eq!(device.block(block_no), [0xab; BLOCK_SZ]);
    let log_start = fs.super_block().log_start as usize;
    assert_eq!(device.block(log_start)[..4], [0; 4]);

    let (_, fs) = remount(&device.snapshot());
    assert_eq!(content(fs.cache(), block_no), [0xab; BLOCK_SZ]);
}

#[test]
fn unfinished_op_leaves_disk_untouched() {
    let (device, fs) = setup(small_geometry());
    let cache = fs.cache().clone();
    let t1 = cache.begin_op();
    let t2 = cache.begin_op();
    let a = cache.alloc(&t1).unwrap();
    let b = cache.alloc(&t2).unwrap();
    fill(&cache, &t1, a, 0x11);
    fill(&cache, &t2, b, 0x22);

    // t1 commits but cannot return before t2 ends.
    let committer = {
        let cache = cache.clone();
        thread::spawn(move || cache.end_op(t1))
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!committer.is_finished());

    // crash now: neither block reached its home location.
    let (_, crashed) = remount(&device.snapshot());
    assert_eq!(content(crashed.cache(), a), [0; BLOCK_SZ]);
    assert_eq!(content(crashed.cache(), b), [0; BLOCK_SZ]);

    cache.end_op(t2);
    committer.join().unwrap();
    let (_, fs) = remount(&device.snapshot());
    assert_eq!(content(fs.cache(), a), [0x11; BLOCK_SZ]);
    assert_eq!(content(fs.cache(), b), [0x22; BLOCK_SZ]);
}

/// Allocate three blocks and fill them in one operation, cutting power
/// after `cut` device writes of the commit. Returns the recovered contents.
fn commit_with_power_cut(cut: Option<usize>) -> (usize, Vec<Data>) {
    let (device, fs) = setup(small_geometry());
    let cache = fs.cache();
    let ctx = cache.begin_op();
    let blocks: Vec<usize> = (0..3).map(|_| cache.alloc(&ctx).unwrap()).collect();
    for (i, &block_no) in blocks.iter().enumerate() {
        fill(cache, &ctx, block_no, 0x40 + i as u8);
    }
    let before = device.writes();
    if let Some(cut) = cut {
        device.cut_power_after(cut);
    }
    cache.end_op(ctx);
    let issued = device.writes() - before;

    let (_, fs) = remount(&device.snapshot());
    let recovered = blocks.iter().map(|&no| content(fs.cache(), no)).collect();
    (issued, recovered)
}

#[test]
fn power_cut_is_all_or_nothing() {
    let (issued, complete) = commit_with_power_cut(None);
    for (i, data) in complete.iter().enumerate() {
        assert_eq!(*data, [0x40 + i as u8; BLOCK_SZ]);
    }
    for cut in 0..issued {
        let (_, recovered) = commit_with_power_cut(Some(cut));
        let old = recovered.iter().all(|data| *data == [0; BLOCK_SZ]);
        let new = recovered == complete;
        assert!(old || new, "torn commit after {cut} writes");
    }
}

#[test]
fn replay_is_idempotent() {
    let (device, fs) = setup(small_geometry());
    let cache = fs.cache();
    let ctx = cache.begin_op();
    let block_no = cache.alloc(&ctx).unwrap();
    fill(cache, &ctx, block_no, 0x5a);
    // stop right after the log header hits the disk: two log blocks + header.
    device.cut_power_after(3);
    cache.end_op(ctx);

    let image = device.snapshot();
    let log_start = fs.super_block().log_start as usize;
    assert_ne!(image[log_start][..4], [0; 4]);

    let (first, fs1) = remount(&image);
    assert_eq!(content(fs1.cache(), block_no), [0x5a; BLOCK_SZ]);
    assert_eq!(first.block(log_start)[..4], [0; 4]);
    let (_, fs2) = remount(&first.snapshot());
    assert_eq!(content(fs2.cache(), block_no), [0x5a; BLOCK_SZ]);
    assert_eq!(fs2.cache().used_blocks(fs2.super_block().group_of_block(block_no).unwrap()), 2);
}

#[test]
fn shared_blocks_are_absorbed() {
    let (_, fs) = setup(small_geometry());
    let cache: &Arc<BlockCache> = fs.cache();
    let t1 = cache.begin_op();
    let t2 = cache.begin_op();
    let a = cache.alloc(&t1).unwrap();
    let b = cache.alloc(&t2).unwrap();
    // both operations touch the same bitmap block
    assert_eq!(t1.num_blocks(), 2);
    assert_eq!(t2.num_blocks(), 2);
    assert!(t2.timestamp() > t1.timestamp());
    let reserved = cache.log_used();
    thread::scope(|s| {
        s.spawn(|| cache.end_op(t1));
        thread::sleep(Duration::from_millis(50));
        // t1 returned its unused reservation
        assert!(cache.log_used() < reserved);
        cache.end_op(t2);
    });
    assert_eq!(cache.outstanding_ops(), 0);
    assert_eq!(cache.log_used(), 0);
    assert_ne!(a, b);
}

#[test]
fn reservation_must_fit_the_log() {
    // seven log blocks behind the header
    let geometry = FsGeometry {
        total_blocks: 2 + 8 + 4 * 200,
        num_groups: 4,
        num_inodes: 40,
        log_blocks: 8,
    };
    assert!(geometry.super_block().is_some());
    let device = MemDevice::new(geometry.total_blocks as usize);
    assert_eq!(
        FileSystem::format(device.clone(), scheduler(), geometry).err(),
        Some(FsError::BadSuperBlock)
    );

    let config = CacheConfig {
        op_max_blocks: 7,
        ..CacheConfig::default()
    };
    let fs = FileSystem::format_with(device.clone(), scheduler(), geometry, config).unwrap();
    fs.mkdir("/a", None).unwrap();
    drop(fs);

    assert_eq!(
        FileSystem::open(device.clone(), scheduler()).err(),
        Some(FsError::BadSuperBlock)
    );
    let fs = FileSystem::open_with(device, scheduler(), config).unwrap();
    assert_eq!(fs.readdir("/", None).unwrap(), [".", "..", "a"]);
}
