pub mod common;
pub mod config;
pub mod storage;

#[cfg(test)]
mod utils;

pub use common::{ClusterError, ClusterResult};
pub use storage::atomic::AtomicOperationsManager;
pub use storage::cluster::{
    ClusterConfig, ClusterStatus, PaginatedCluster, PhysicalPosition, RawRecord, RecordStatus,
};
pub use storage::storage::PageCache;
