//! Chain replication: roles, the chain map, the next-hop client, and the
//! supervisor that drives produce and write repair through the chain.

pub mod client;
pub mod map;
pub mod role;
pub mod supervisor;

pub use client::ChainClient;
pub use map::{ChainEntry, ChainMap, HostPort};
pub use role::Role;
pub use supervisor::ChainSupervisor;
