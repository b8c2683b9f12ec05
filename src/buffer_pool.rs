//! A pool of fixed-size byte buffers for the compression path.
//!
//! Every compression session needs an input and an output buffer. Allocating
//! them per response causes a lot of churn, so we keep returned buffers on a
//! free list and hand them out again.

use std::{
    mem,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::format_err;
use metrics::{counter, describe_counter};

use crate::Result;

/// The size of each pooled buffer.
pub const BUFFER_SIZE: usize = 10 * 1024;

/// How many idle buffers we keep around before freeing returned ones.
pub const MAX_IDLE_BUFFERS: usize = 256;

/// A shared pool of fixed-size buffers.
#[derive(Debug)]
pub struct BufferPool {
    /// The size of every buffer in this pool.
    buffer_size: usize,

    /// The maximum length of `free`.
    max_idle: usize,

    /// Buffers which are not currently checked out.
    free: Mutex<Vec<Box<[u8]>>>,

    /// Number of buffers currently checked out.
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a new, empty pool.
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<BufferPool> {
        describe_counter!(
            "dictproxy.buffers_allocated.total",
            "Pool buffers allocated because the free list was empty"
        );
        describe_counter!(
            "dictproxy.buffers_reused.total",
            "Pool buffers taken from the free list"
        );

        Arc::new(BufferPool {
            buffer_size,
            max_idle,
            free: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Check out a buffer. It is returned to the pool when dropped.
    ///
    /// Fails only if the free list is empty and we can't allocate.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledBuffer> {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(buf) => {
                counter!("dictproxy.buffers_reused.total", 1);
                buf
            }
            None => {
                counter!("dictproxy.buffers_allocated.total", 1);
                allocate(self.buffer_size)?
            }
        };
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(PooledBuffer {
            buf,
            pool: self.clone(),
        })
    }

    /// How many buffers are currently checked out?
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// How many buffers are sitting on the free list?
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Called by `PooledBuffer` exactly once per checkout.
    fn give_back(&self, buf: Box<[u8]>) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "returned more buffers than checked out");
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_idle {
            free.push(buf);
        }
    }
}

/// Allocate a zeroed buffer, reporting failure instead of aborting.
fn allocate(size: usize) -> Result<Box<[u8]>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size)
        .map_err(|err| format_err!("could not allocate {} byte buffer: {}", size, err))?;
    buf.resize(size, 0);
    Ok(buf.into_boxed_slice())
}

/// A buffer checked out of a [`BufferPool`]. Only one owner can hold it at a
/// time, and it goes back to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    /// Empty only while we're being dropped.
    buf: Box<[u8]>,

    /// Where we go home to.
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(mem::take(&mut self.buf));
    }
}
