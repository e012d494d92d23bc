//! Remote shell sessions over pooled SSH transports.
//!
//! `pool` owns the authenticated transports (one per (host, port, username),
//! reference counted, idle-closed). `registry` owns the individual shell
//! channels opened on top of them.

pub mod params;
pub mod pool;
pub mod registry;

pub use params::{PoolKey, SafeParams, SshParams};
pub use pool::{SshError, TransportPool};
pub use registry::SshRegistry;
