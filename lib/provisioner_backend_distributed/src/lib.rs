mod adapter;
mod load_balancer;
mod tunneler;

pub use adapter::DistributedAdapter;
pub use load_balancer::HostPool;
pub use tunneler::SshTunneler;
