//! Connection Bridge
//!
//! Pairs an accepted client socket with a backend socket and relays bytes
//! between them through a single buffer per direction.
//!
//! - `context`: the two halves and the buffer handoff state machine
//! - `driver`: backend connect with failover, readiness dispatch
//! - `event_loop`: workers owning bridges fed by the listener

mod context;
mod driver;
mod event_loop;

pub use context::{BridgeContext, BridgeError, ConnectionHandler, HandlerToken, Side, Want};
pub use driver::{run_bridge, Forward, DEFAULT_CONNECT_TIMEOUT};
pub use event_loop::{AcceptSender, EventLoop, ACCEPT_QUEUE_CAPACITY};
