pub mod address;
pub mod port;
pub mod subnet;

pub use port::PortPool;
pub use subnet::SubnetPool;
