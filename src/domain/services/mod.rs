mod load_balancer;

pub use load_balancer::{LoadBalanceContext, LoadBalancer, RingCursor};
