//! # cnet-queue
//!
//! Named FIFO queues and result counters for a processing run, backed by
//! Redis in production and by an in-memory broker in tests.

pub mod memory;
pub mod names;
pub mod queue;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use names::QueueNames;
pub use queue::TaskQueue;
pub use redis_broker::RedisBroker;
