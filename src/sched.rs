//! 调度器协作接口。
//!
//! 文件系统本身不实现线程切换，只在三个地方需要睡眠：
//! 块已被他人持有、日志空间不足、以及 `end_op` 等待 checkpoint 完成。
//! 内核把自己的 sleep/wakeup 原语包装成 `Scheduler` 注入进来。

/// A named resource a thread can sleep on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    /// The exclusive hold on a cached block.
    Block(usize),
    /// The content lock of an in-memory inode.
    Inode(usize),
    /// Free log reservation, waited on by `begin_op`.
    LogSpace,
    /// Completion of a checkpoint, waited on by `end_op`.
    Checkpoint,
}

/// Scheduler primitives consumed by the filesystem.
///
/// `sleep_until` parks the calling thread until `try_proceed` returns
/// `true`. The predicate is evaluated once before sleeping and again after
/// every `wakeup` on the same channel; it performs its own short locking and
/// claims the resource when it succeeds. An implementation must not lose a
/// `wakeup` that races with a failed evaluation.
///
/// The filesystem never holds one of its internal locks while calling
/// either method.
pub trait Scheduler: Send + Sync {
    /// Sleep on `chan` until `try_proceed` succeeds.
    fn sleep_until(&self, chan: Channel, try_proceed: &mut dyn FnMut() -> bool);
    /// Wake every thread sleeping on `chan`.
    fn wakeup(&self, chan: Channel);
}
