mod dns_resolver;
mod memory_sticky_store;

pub use dns_resolver::{DnsResolver, DNS_CACHE_TTL};
pub use memory_sticky_store::{MemoryStickyStore, NullStickyStore};
