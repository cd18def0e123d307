//! Size-classed reusable byte buffers.
//!
//! Frame payloads up to 256 KiB are served from three fixed size classes so
//! the hot decode path does not allocate per frame. A checked-out buffer is
//! returned to its class when the [`PooledBuf`] is dropped.

use std::sync::{Arc, Mutex, OnceLock};

/// Small frame-payload class (4 KiB).
pub const SIZE_SMALL: usize = 4 * 1024;
/// Medium frame-payload class (32 KiB).
pub const SIZE_MEDIUM: usize = 32 * 1024;
/// Large frame-payload class (256 KiB). Payloads above this allocate fresh.
pub const SIZE_LARGE: usize = 256 * 1024;

/// Medium body-streaming class (32 KiB).
pub const STREAM_MEDIUM: usize = 32 * 1024;
/// Large body-streaming class (1 MiB).
pub const STREAM_LARGE: usize = 1024 * 1024;

/// How many idle buffers each class retains before extras are freed.
const MAX_IDLE_PER_CLASS: usize = 64;

/// The frame-payload size classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    /// The smallest class that fits `size`, or `None` above [`SIZE_LARGE`].
    pub fn for_size(size: usize) -> Option<SizeClass> {
        match size {
            s if s <= SIZE_SMALL => Some(SizeClass::Small),
            s if s <= SIZE_MEDIUM => Some(SizeClass::Medium),
            s if s <= SIZE_LARGE => Some(SizeClass::Large),
            _ => None,
        }
    }

    /// Buffer capacity for this class.
    pub fn capacity(self) -> usize {
        match self {
            SizeClass::Small => SIZE_SMALL,
            SizeClass::Medium => SIZE_MEDIUM,
            SizeClass::Large => SIZE_LARGE,
        }
    }
}

/// Pool of reusable buffers in three frame-payload size classes.
pub struct BufferPool {
    small: Mutex<Vec<Vec<u8>>>,
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            small: Mutex::new(Vec::new()),
            medium: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    /// Check out a buffer able to hold `len` bytes.
    ///
    /// Panics if `len` exceeds [`SIZE_LARGE`]; callers are expected to check
    /// the class first and allocate fresh buffers above it.
    pub fn get(self: &Arc<Self>, len: usize) -> PooledBuf {
        let class = SizeClass::for_size(len)
            .unwrap_or_else(|| panic!("requested pooled buffer of {} bytes", len));
        let mut buf = self
            .shelf(class)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; class.capacity()]);
        // Idle buffers keep their capacity; re-expose the full class width.
        buf.resize(class.capacity(), 0);
        PooledBuf {
            buf,
            len,
            class,
            pool: Arc::clone(self),
        }
    }

    fn put(&self, class: SizeClass, buf: Vec<u8>) {
        if buf.capacity() < class.capacity() {
            return;
        }
        let mut shelf = self.shelf(class).lock().unwrap_or_else(|e| e.into_inner());
        if shelf.len() < MAX_IDLE_PER_CLASS {
            shelf.push(buf);
        }
    }

    fn shelf(&self, class: SizeClass) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Medium => &self.medium,
            SizeClass::Large => &self.large,
        }
    }

    /// Number of idle buffers currently held in a class.
    pub fn idle(&self, class: SizeClass) -> usize {
        self.shelf(class)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer checked out of a [`BufferPool`].
///
/// Returned to its class exactly once, when dropped.
pub struct PooledBuf {
    buf: Vec<u8>,
    len: usize,
    class: SizeClass,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    /// The checked-out length (not the class capacity).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        self.pool.put(self.class, std::mem::take(&mut self.buf));
    }
}

impl std::ops::Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.len)
            .field("class", &self.class)
            .finish()
    }
}

/// Process-wide frame-payload pool used by the frame codec.
pub fn global_pool() -> &'static Arc<BufferPool> {
    static GLOBAL: OnceLock<Arc<BufferPool>> = OnceLock::new();
    GLOBAL.get_or_init(|| Arc::new(BufferPool::new()))
}

/// Two-class pool for body-streaming reads (32 KiB temporary reads, 1 MiB
/// streaming threshold buffers).
pub struct StreamBufferPool {
    medium: Mutex<Vec<Vec<u8>>>,
    large: Mutex<Vec<Vec<u8>>>,
}

impl StreamBufferPool {
    pub fn new() -> Self {
        Self {
            medium: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
        }
    }

    pub fn get_medium(&self) -> Vec<u8> {
        self.checkout(&self.medium, STREAM_MEDIUM)
    }

    pub fn get_large(&self) -> Vec<u8> {
        self.checkout(&self.large, STREAM_LARGE)
    }

    pub fn put_medium(&self, buf: Vec<u8>) {
        self.checkin(&self.medium, buf, STREAM_MEDIUM);
    }

    pub fn put_large(&self, buf: Vec<u8>) {
        self.checkin(&self.large, buf, STREAM_LARGE);
    }

    fn checkout(&self, shelf: &Mutex<Vec<Vec<u8>>>, size: usize) -> Vec<u8> {
        let mut buf = shelf
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; size]);
        buf.resize(size, 0);
        buf
    }

    fn checkin(&self, shelf: &Mutex<Vec<Vec<u8>>>, buf: Vec<u8>, size: usize) {
        if buf.capacity() < size {
            return;
        }
        let mut shelf = shelf.lock().unwrap_or_else(|e| e.into_inner());
        if shelf.len() < MAX_IDLE_PER_CLASS {
            shelf.push(buf);
        }
    }
}

impl Default for StreamBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_class_selection() {
        assert_eq!(SizeClass::for_size(0), Some(SizeClass::Small));
        assert_eq!(SizeClass::for_size(SIZE_SMALL), Some(SizeClass::Small));
        assert_eq!(SizeClass::for_size(SIZE_SMALL + 1), Some(SizeClass::Medium));
        assert_eq!(SizeClass::for_size(SIZE_MEDIUM), Some(SizeClass::Medium));
        assert_eq!(SizeClass::for_size(SIZE_LARGE), Some(SizeClass::Large));
        assert_eq!(SizeClass::for_size(SIZE_LARGE + 1), None);
    }

    #[test]
    fn test_checkout_length() {
        let pool = Arc::new(BufferPool::new());
        let buf = pool.get(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_slice().len(), 100);
    }

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = Arc::new(BufferPool::new());
        assert_eq!(pool.idle(SizeClass::Small), 0);

        let buf = pool.get(10);
        drop(buf);
        assert_eq!(pool.idle(SizeClass::Small), 1);

        // The next checkout reuses the idle buffer.
        let _buf = pool.get(20);
        assert_eq!(pool.idle(SizeClass::Small), 0);
    }

    #[test]
    fn test_classes_are_independent() {
        let pool = Arc::new(BufferPool::new());
        drop(pool.get(SIZE_SMALL));
        drop(pool.get(SIZE_MEDIUM));
        drop(pool.get(SIZE_LARGE));

        assert_eq!(pool.idle(SizeClass::Small), 1);
        assert_eq!(pool.idle(SizeClass::Medium), 1);
        assert_eq!(pool.idle(SizeClass::Large), 1);
    }

    #[test]
    fn test_idle_cap() {
        let pool = Arc::new(BufferPool::new());
        let bufs: Vec<_> = (0..(MAX_IDLE_PER_CLASS + 10)).map(|_| pool.get(8)).collect();
        drop(bufs);
        assert_eq!(pool.idle(SizeClass::Small), MAX_IDLE_PER_CLASS);
    }

    #[test]
    fn test_stream_pool_reuse() {
        let pool = StreamBufferPool::new();
        let buf = pool.get_medium();
        assert_eq!(buf.len(), STREAM_MEDIUM);
        pool.put_medium(buf);

        let buf = pool.get_large();
        assert_eq!(buf.len(), STREAM_LARGE);
        pool.put_large(buf);
    }
}
