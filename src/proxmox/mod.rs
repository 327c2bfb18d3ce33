pub mod agent;
pub mod client;
pub mod cluster;
pub mod error;
#[cfg(test)]
pub mod mock;
pub mod storage;
pub mod transport;
pub mod vm;

pub use client::{ObservedState, PowerState, ProxmoxClient, ResourceKind, ResourceRef};
pub use error::ProxmoxError;
pub use transport::{HttpTransport, Transport};
