//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod buffer_pool;
pub mod proxy_protocol;
pub mod shutdown;

pub use buffer_pool::{Buffer, BufferPool, PoolError};
pub use proxy_protocol::format_v1;
pub use shutdown::{shutdown_signal, BridgeGuard, ShutdownController};
