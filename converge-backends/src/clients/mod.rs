//! Memory-backed clients for the backend services the shipped handlers
//! call:
//! - kv: hierarchical key-value tree (records, directories)
//! - identity: roles, projects, domains, and role grants
//! - compute: server inventory lookups

pub mod compute;
pub mod identity;
pub mod kv;

pub use compute::MemoryComputeClient;
pub use identity::MemoryIdentityClient;
pub use kv::MemoryKvClient;
