//! Cache tiers and backing-store implementations.

pub mod memory;
pub mod metrics;
pub mod moka;
pub mod redis;
pub mod remote;

pub use memory::{MemoryBackend, MemoryBackendConfig};
pub use metrics::MetricsStore;
pub use moka::{MokaStore, MokaStoreConfig};
pub use redis::RedisBackend;
pub use remote::RemoteStore;
