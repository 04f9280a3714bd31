mod address_resolver;
mod sticky_publisher;
mod sticky_store;

pub use address_resolver::AddressResolver;
pub use sticky_publisher::StickyPublisher;
pub use sticky_store::StickyStore;
