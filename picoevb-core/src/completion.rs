// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Interrupt-to-waiter completion bridge
//!
//! The IRQ worker posts to a [`Completion`]; the request thread blocks on it.
//! Both the wait and the engine lock can be broken by a [`CancelToken`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Something blocked on a condition variable that cancellation must wake
pub trait Wake: Send + Sync {
    fn wake(&self);
}

struct CancelInner {
    cancelled: AtomicBool,
    watchers: Mutex<Vec<(u64, Arc<dyn Wake>)>>,
    next_watch: AtomicU64,
}

/// Per-request cancellation, the equivalent of a signal interrupting a blocked syscall
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                watchers: Mutex::new(Vec::new()),
                next_watch: AtomicU64::new(0),
            }),
        }
    }

    /// Cancel and wake whatever the owning request is blocked on
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let watchers: Vec<_> = self
            .inner
            .watchers
            .lock()
            .iter()
            .map(|(_, w)| Arc::clone(w))
            .collect();
        for watcher in watchers {
            watcher.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register `target` to be woken on cancel for as long as the guard lives
    pub fn watch(&self, target: Arc<dyn Wake>) -> WatchGuard<'_> {
        let id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.lock().push((id, target));
        WatchGuard { token: self, id }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

pub struct WatchGuard<'a> {
    token: &'a CancelToken,
    id: u64,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        self.token.inner.watchers.lock().retain(|(id, _)| *id != self.id);
    }
}

/// Completion signal shared between the IRQ worker and the waiting request
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    Cancelled,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Re-arm before starting a transfer
    pub fn reinit(&self) {
        *self.done.lock() = false;
    }

    /// Release the waiter; called from interrupt context
    pub fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Block until completed or cancelled. Consumes the completion.
    pub fn wait(self: &Arc<Self>, cancel: &CancelToken) -> WaitOutcome {
        let _watch = cancel.watch(Arc::clone(self) as Arc<dyn Wake>);
        let mut done = self.done.lock();
        loop {
            if *done {
                *done = false;
                return WaitOutcome::Completed;
            }
            if cancel.is_cancelled() {
                return WaitOutcome::Cancelled;
            }
            self.cond.wait(&mut done);
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Wake for Completion {
    fn wake(&self) {
        let _done = self.done.lock();
        self.cond.notify_all();
    }
}

/// Device-wide engine lock with cancellable acquisition
pub struct EngineLock {
    busy: Mutex<bool>,
    cond: Condvar,
}

impl EngineLock {
    pub fn new() -> Self {
        Self {
            busy: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Acquire, or `None` if cancelled first
    pub fn lock(self: &Arc<Self>, cancel: &CancelToken) -> Option<EngineLockGuard> {
        let _watch = cancel.watch(Arc::clone(self) as Arc<dyn Wake>);
        let mut busy = self.busy.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if !*busy {
                *busy = true;
                return Some(EngineLockGuard {
                    lock: Arc::clone(self),
                });
            }
            self.cond.wait(&mut busy);
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.busy.lock()
    }
}

impl Default for EngineLock {
    fn default() -> Self {
        Self::new()
    }
}

impl Wake for EngineLock {
    fn wake(&self) {
        let _busy = self.busy.lock();
        self.cond.notify_all();
    }
}

pub struct EngineLockGuard {
    lock: Arc<EngineLock>,
}

impl Drop for EngineLockGuard {
    fn drop(&mut self) {
        *self.lock.busy.lock() = false;
        self.lock.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_completion_before_wait() {
        let completion = Arc::new(Completion::new());
        completion.reinit();
        completion.complete();
        assert_eq!(
            completion.wait(&CancelToken::new()),
            WaitOutcome::Completed
        );
        assert!(!completion.is_done());
    }

    #[test]
    fn test_completion_from_other_thread() {
        let completion = Arc::new(Completion::new());
        let irq = Arc::clone(&completion);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            irq.complete();
        });
        assert_eq!(
            completion.wait(&CancelToken::new()),
            WaitOutcome::Completed
        );
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_breaks_wait() {
        let completion = Arc::new(Completion::new());
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert_eq!(completion.wait(&cancel), WaitOutcome::Cancelled);
        handle.join().unwrap();
    }

    #[test]
    fn test_engine_lock_cancelled_acquisition() {
        let lock = Arc::new(EngineLock::new());
        let held = lock.lock(&CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        assert!(lock.lock(&cancel).is_none());
        handle.join().unwrap();

        drop(held);
        assert!(!lock.is_locked());
        assert!(lock.lock(&CancelToken::new()).is_some());
    }

    #[test]
    fn test_engine_lock_hands_over() {
        let lock = Arc::new(EngineLock::new());
        let held = lock.lock(&CancelToken::new()).unwrap();
        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            let _guard = contender.lock(&CancelToken::new()).unwrap();
        });
        thread::sleep(Duration::from_millis(20));
        drop(held);
        handle.join().unwrap();
        assert!(!lock.is_locked());
    }
}
