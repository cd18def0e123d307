//! Buffer and worker pools shared by the drip client and server.

mod buffer;
mod worker;

pub use buffer::{
    global_pool, BufferPool, PooledBuf, SizeClass, StreamBufferPool, SIZE_LARGE, SIZE_MEDIUM,
    SIZE_SMALL, STREAM_LARGE, STREAM_MEDIUM,
};
pub use worker::WorkerPool;
