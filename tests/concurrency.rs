mod common;

use common::{random_bytes, setup, small_geometry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tg_ffs::{read_all, OpenFlags};

#[test]
fn begin_op_waits_for_log_space() {
    let (_, fs) = setup(small_geometry());
    let cache = fs.cache();
    // a 40-block log holds two 16-block reservations
    let t1 = cache.begin_op();
    let t2 = cache.begin_op();
    let started = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let t3 = cache.begin_op();
            started.store(true, Ordering::SeqCst);
            cache.end_op(t3);
        });
        thread::sleep(Duration::from_millis(100));
        assert!(!started.load(Ordering::SeqCst));

        // committing t1 hands back its unused reservation
        s.spawn(|| cache.end_op(t1));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !started.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "begin_op never woke up");
            thread::sleep(Duration::from_millis(10));
        }
        cache.end_op(t2);
    });

    assert_eq!(cache.outstanding_ops(), 0);
    assert_eq!(cache.log_used(), 0);
}

#[test]
fn many_operations_make_progress() {
    let (_, fs) = setup(small_geometry());
    let cache = fs.cache();
    thread::scope(|s| {
        for _ in 0..16 {
            s.spawn(|| {
                for _ in 0..10 {
                    let ctx = cache.begin_op();
                    let block_no = cache.alloc(&ctx).unwrap();
                    cache.free(&ctx, block_no);
                    cache.end_op(ctx);
                }
            });
        }
    });
    assert_eq!(cache.outstanding_ops(), 0);
    assert_eq!(cache.used_blocks(0), 1);
}

#[test]
fn concurrent_writers() {
    let (_, fs) = setup(small_geometry());
    thread::scope(|s| {
        for i in 0..6 {
            let fs = fs.clone();
            s.spawn(move || {
                let path = format!("/file{i}");
                let data = random_bytes(8 * 1024 + i * 100);
                let file = fs
                    .open_file(&path, OpenFlags::CREATE | OpenFlags::RDWR, None)
                    .unwrap();
                assert_eq!(file.write(&data).unwrap(), data.len());
                assert_eq!(read_all(&file).unwrap(), data);
            });
        }
    });
    let mut names = fs.readdir("/", None).unwrap();
    names.sort();
    assert_eq!(names.len(), 2 + 6);
    assert_eq!(fs.cache().outstanding_ops(), 0);
}
