use std::{
    mem,
    sync::{Arc, Mutex},
};

/// Max bytes held by one pool.
const MAX_BUFFERS_SIZE: usize = 1024 * 1024 * 1024;
/// When total pooled bytes exceed this, the largest buffers are dropped.
const TRIM_THRESHOLD: usize = MAX_BUFFERS_SIZE / 2;

/// Pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Buffers reused instead of allocated.
    pub hits: usize,
    /// Buffers newly allocated.
    pub misses: usize,
    /// Buffers dropped because of the size cap.
    pub drops: usize,
}

/// Reuses `Vec` allocations across kernel launches.
#[derive(Debug, Default)]
pub struct BufferPool<T> {
    pool: Vec<Vec<T>>,
    metrics: PoolMetrics,
}

pub type SharedPool<T> = Arc<Mutex<BufferPool<T>>>;

impl<T: Copy + Default> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            pool: Vec::new(),
            metrics: PoolMetrics::default(),
        }
    }

    pub fn shared() -> SharedPool<T> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// An empty `Vec` with at least `capacity`, reusing the smallest pooled
    /// buffer that fits.
    pub fn get_empty_buffer(&mut self, capacity: usize) -> Vec<T> {
        let found = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= capacity)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);
        match found {
            Some(idx) => {
                self.metrics.hits += 1;
                let mut buf = self.pool.swap_remove(idx);
                self.metrics.current_size = self
                    .metrics
                    .current_size
                    .saturating_sub(buf.capacity() * mem::size_of::<T>());
                buf.clear();
                buf
            }
            None => {
                self.metrics.misses += 1;
                Vec::with_capacity(capacity)
            }
        }
    }

    /// A `Vec` of `len` default elements.
    pub fn get_buffer(&mut self, len: usize) -> Vec<T> {
        let mut buf = self.get_empty_buffer(len);
        buf.resize(len, T::default());
        buf
    }

    pub fn recycle_buffer(&mut self, buf: Vec<T>) {
        let bytes = buf.capacity() * mem::size_of::<T>();
        if bytes == 0 {
            return;
        }
        if self.metrics.current_size + bytes <= MAX_BUFFERS_SIZE {
            self.metrics.current_size += bytes;
            self.pool.push(buf);
            self.trim_excess();
        } else {
            self.metrics.drops += 1;
        }
    }

    fn trim_excess(&mut self) {
        while self.metrics.current_size > TRIM_THRESHOLD {
            let Some((idx, bytes)) = self
                .pool
                .iter()
                .enumerate()
                .map(|(i, b)| (i, b.capacity() * mem::size_of::<T>()))
                .max_by_key(|(_, bytes)| *bytes)
            else {
                break;
            };
            self.pool.swap_remove(idx);
            self.metrics.current_size = self.metrics.current_size.saturating_sub(bytes);
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.metrics.clone()
    }
}

/// A pooled `Vec` that returns to its pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer<T: Copy + Default> {
    buf: Vec<T>,
    pool: Option<SharedPool<T>>,
}

impl<T: Copy + Default> PooledBuffer<T> {
    pub fn new(buf: Vec<T>, pool: SharedPool<T>) -> Self {
        Self {
            buf,
            pool: Some(pool),
        }
    }

    /// Take the buffer out without recycling it.
    pub fn into_inner(mut self) -> Vec<T> {
        self.pool = None;
        mem::take(&mut self.buf)
    }
}

impl<T: Copy + Default> std::ops::Deref for PooledBuffer<T> {
    type Target = Vec<T>;
    fn deref(&self) -> &Vec<T> {
        &self.buf
    }
}

impl<T: Copy + Default> std::ops::DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut Vec<T> {
        &mut self.buf
    }
}

impl<T: Copy + Default> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            let buf = mem::take(&mut self.buf);
            // A poisoned pool just loses the buffer.
            if let Ok(mut pool) = pool.lock() {
                pool.recycle_buffer(buf);
            }
        }
    }
}

/// The scratch pools of one compiled program, one per storage type.
#[derive(Debug, Clone, Default)]
pub struct TensorPools {
    pub f32: SharedPool<f32>,
    pub i64: SharedPool<i64>,
}

impl TensorPools {
    pub fn new() -> Self {
        Self {
            f32: BufferPool::shared(),
            i64: BufferPool::shared(),
        }
    }

    pub fn f32_buffer(&self, len: usize) -> crate::Result<PooledBuffer<f32>> {
        let buf = self.f32.lock()?.get_buffer(len);
        Ok(PooledBuffer::new(buf, self.f32.clone()))
    }

    pub fn i64_buffer(&self, len: usize) -> crate::Result<PooledBuffer<i64>> {
        let buf = self.i64.lock()?.get_buffer(len);
        Ok(PooledBuffer::new(buf, self.i64.clone()))
    }

    pub fn f32_metrics(&self) -> crate::Result<PoolMetrics> {
        Ok(self.f32.lock()?.metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pools = TensorPools::new();
        {
            let buf = pools.f32_buffer(16).unwrap();
            assert_eq!(buf.len(), 16);
        }
        let buf = pools.f32_buffer(8).unwrap();
        assert!(buf.capacity() >= 16);
        let metrics = pools.f32_metrics().unwrap();
        assert_eq!((metrics.hits, metrics.misses), (1, 1));
        assert_eq!(buf.into_inner().len(), 8);
    }

    #[test]
    fn smallest_fitting_buffer_wins() {
        let mut pool = BufferPool::<i64>::new();
        pool.recycle_buffer(Vec::with_capacity(64));
        pool.recycle_buffer(Vec::with_capacity(8));
        assert!(pool.get_empty_buffer(4).capacity() < 64);
        assert_eq!(pool.metrics().current_size, 64 * 8);
    }
}
