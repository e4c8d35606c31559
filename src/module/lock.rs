//! 模块状态变更锁
//!
//! 每个模块一把，串行化该模块的生命周期转换。持有线程可重入；
//! 其他线程在限定时间内等待，超时后放弃。

use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// 可重入、带超时的互斥锁
pub(crate) struct StateChangeLock {
    owner: Mutex<Option<(ThreadId, usize)>>,
    released: Condvar,
}

impl StateChangeLock {
    pub(crate) fn new() -> Self {
        Self {
            owner: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// 获取锁，超时返回实际等待时长
    pub(crate) fn acquire(&self, timeout: Duration) -> Result<StateChangeGuard<'_>, Duration> {
        let me = thread::current().id();
        let start = Instant::now();
        let deadline = start + timeout;
        let mut owner = self.owner.lock();

        loop {
            match owner.as_mut() {
                None => {
                    *owner = Some((me, 1));
                    return Ok(StateChangeGuard { lock: self });
                }
                Some((holder, depth)) if *holder == me => {
                    *depth += 1;
                    return Ok(StateChangeGuard { lock: self });
                }
                Some(_) => {
                    if self.released.wait_until(&mut owner, deadline).timed_out() && owner.is_some() {
                        return Err(start.elapsed());
                    }
                }
            }
        }
    }

    /// 当前线程是否持有锁
    pub(crate) fn is_held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        matches!(*self.owner.lock(), Some((holder, _)) if holder == me)
    }

    fn release(&self) {
        let mut owner = self.owner.lock();
        if let Some((_, depth)) = owner.as_mut() {
            *depth -= 1;
            if *depth == 0 {
                *owner = None;
                self.released.notify_all();
            }
        }
    }
}

/// 锁守卫，析构时释放一层持有
pub(crate) struct StateChangeGuard<'a> {
    lock: &'a StateChangeLock,
}

impl Drop for StateChangeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
