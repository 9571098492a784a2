pub mod broker;
pub mod channel;
pub mod memory;
pub mod metrics;
pub mod payload;
pub mod pgqueue;
pub mod pool;
pub mod retry;
