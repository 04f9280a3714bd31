//! Adapters Layer
//!
//! Inbound adapters accept client traffic; outbound adapters implement the
//! domain ports.

pub mod inbound;
pub mod outbound;
