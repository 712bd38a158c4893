//! Fixed-size frame buffers and the pool that recycles them.
//!
//! Every link owns two pools, one per direction. A buffer is identified by
//! its slot index and moves FREE → ACQUIRED → (FILLED) → FREE. Ownership
//! enforces the state machine: `acquire` hands out a `FrameBuffer` by value,
//! `release` takes it back by value, and `FrameBuffer` is not `Clone`, so a
//! slot can never have two owners.
//!
//! Acquisition blocks on a semaphore with one permit per free buffer. A
//! timeout is reported as `None`, which is the transport's backpressure
//! signal, not an error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use tokio::sync::Semaphore;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// One frame's worth of memory, on loan from a [`FramePool`].
#[derive(Debug)]
pub struct FrameBuffer {
    pool_id: u64,
    slot: usize,
    data: BytesMut,
    len: usize,
}

impl FrameBuffer {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Frame size. Fixed for the lifetime of the pool.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Valid bytes in the frame.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark the first `len` bytes valid. Clamped to the frame size.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole frame, for filling.
    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Copy `bytes` into the frame. Returns bytes copied.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len());
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.len = n;
        n
    }
}

/// Pool of equally sized frames.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: u64,
    frame_size: usize,
    free: Mutex<VecDeque<FrameBuffer>>,
    permits: Semaphore,
    total: Mutex<usize>,
}

impl PoolInner {
    fn free(&self) -> MutexGuard<'_, VecDeque<FrameBuffer>> {
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("frame_size", &self.inner.frame_size)
            .field("num_frames", &self.num_frames())
            .field("available", &self.available())
            .finish()
    }
}

impl FramePool {
    /// Pool of `num_frames` free buffers of `frame_size` bytes.
    pub fn new(frame_size: usize, num_frames: usize) -> Self {
        let pool = Self {
            inner: Arc::new(PoolInner {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                frame_size,
                free: Mutex::new(VecDeque::with_capacity(num_frames)),
                permits: Semaphore::new(0),
                total: Mutex::new(0),
            }),
        };
        pool.preload(num_frames);
        pool
    }

    /// Seed `n` more buffers in the FREE state.
    pub fn preload(&self, n: usize) {
        let first = {
            let mut total = self.inner.total.lock().unwrap_or_else(|e| e.into_inner());
            let first = *total;
            *total += n;
            first
        };
        {
            let mut free = self.inner.free();
            for slot in first..first + n {
                free.push_back(FrameBuffer {
                    pool_id: self.inner.id,
                    slot,
                    data: BytesMut::zeroed(self.inner.frame_size),
                    len: 0,
                });
            }
        }
        self.inner.permits.add_permits(n);
    }

    pub fn frame_size(&self) -> usize {
        self.inner.frame_size
    }

    pub fn num_frames(&self) -> usize {
        *self.inner.total.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Buffers currently FREE.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Take a free buffer without waiting.
    pub fn try_acquire(&self) -> Option<FrameBuffer> {
        let permit = self.inner.permits.try_acquire().ok()?;
        permit.forget();
        self.take()
    }

    /// Take a free buffer, waiting up to `timeout`. `None` on timeout.
    pub async fn acquire(&self, timeout: Duration) -> Option<FrameBuffer> {
        if timeout.is_zero() {
            return self.try_acquire();
        }
        match tokio::time::timeout(timeout, self.inner.permits.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                self.take()
            }
            _ => None,
        }
    }

    fn take(&self) -> Option<FrameBuffer> {
        let buf = self.inner.free().pop_front();
        if buf.is_none() {
            tracing::error!(frame_size = self.inner.frame_size, "frame pool permit without a free buffer");
        }
        buf
    }

    /// Return a buffer to the FREE state.
    pub fn release(&self, mut buf: FrameBuffer) {
        if buf.pool_id != self.inner.id {
            tracing::warn!(slot = buf.slot, "buffer released to a pool it does not belong to");
            return;
        }
        buf.len = 0;
        self.inner.free().push_back(buf);
        self.inner.permits.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn zero_timeout_on_empty_pool_returns_none() {
        let pool = FramePool::new(64, 1);
        let held = pool.acquire(Duration::ZERO).await.unwrap();
        assert_eq!(held.capacity(), 64);
        assert!(pool.acquire(Duration::ZERO).await.is_none());
        assert!(pool.acquire(Duration::from_millis(10)).await.is_none());
        pool.release(held);
        assert!(pool.acquire(Duration::ZERO).await.is_some());
    }

    #[tokio::test]
    async fn every_slot_handed_out_once() {
        let pool = FramePool::new(16, 8);
        let mut held = Vec::new();
        while let Some(buf) = pool.try_acquire() {
            held.push(buf);
        }
        let slots: HashSet<usize> = held.iter().map(|b| b.slot()).collect();
        assert_eq!(slots.len(), 8);
        assert_eq!(pool.available(), 0);

        let returned = held.pop().unwrap();
        let slot = returned.slot();
        pool.release(returned);
        let again = pool.try_acquire().unwrap();
        assert_eq!(again.slot(), slot);
        assert!(pool.try_acquire().is_none());
    }

    #[tokio::test]
    async fn blocked_acquire_wakes_on_release() {
        let pool = FramePool::new(16, 1);
        let held = pool.try_acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.release(held);

        let got = waiter.await.unwrap();
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn released_buffers_come_back_empty() {
        let pool = FramePool::new(8, 1);
        let mut buf = pool.try_acquire().unwrap();
        assert_eq!(buf.fill_from(b"0123456789"), 8);
        assert_eq!(buf.as_slice(), b"01234567");
        pool.release(buf);
        assert!(pool.try_acquire().unwrap().is_empty());
    }

    #[tokio::test]
    async fn foreign_buffers_are_not_adopted() {
        let rx = FramePool::new(8, 1);
        let tx = FramePool::new(8, 1);
        let buf = rx.try_acquire().unwrap();
        tx.release(buf);
        assert_eq!(tx.available(), 1);
        assert_eq!(rx.available(), 0);
    }

    #[tokio::test]
    async fn preload_adds_new_slots() {
        let pool = FramePool::new(8, 2);
        pool.preload(3);
        assert_eq!(pool.num_frames(), 5);
        assert_eq!(pool.available(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_owners_never_share_a_slot() {
        let pool = FramePool::new(8, 4);
        let owners = Arc::new(Mutex::new(HashSet::new()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let owners = owners.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let buf = pool.acquire(Duration::from_secs(1)).await.unwrap();
                    assert!(owners.lock().unwrap().insert(buf.slot()), "slot handed out twice");
                    tokio::task::yield_now().await;
                    owners.lock().unwrap().remove(&buf.slot());
                    pool.release(buf);
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(pool.available(), 4);
    }
}
