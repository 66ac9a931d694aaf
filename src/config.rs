//! This file provides the storage-level configuration for rcluster
//! Caution: if you change anyone below, make sure you have deleted
//! old cluster files before reopening them, or it may cause some unexpected errors.

pub const _NAME: &str = "rcluster";
pub const _VERSION: &str = "0.1.0";

pub const PAGE_SIZE_BYTES: usize = 64 * 1024; // 64 KB
pub const MAX_PAGE_CACHE_BYTES: usize = 100 * 1024 * 1024; // 100 MB

pub const MAX_WAL_SIZE: u64 = 10 * 1024 * 1024; // 10 MB
pub const WAL_FILE_NAME: &str = "cluster.wal";
pub const FILE_REGISTRY_NAME: &str = "files.json";

pub const DATA_FILE_EXT: &str = "pcl";
pub const MAP_FILE_EXT: &str = "cpm";

pub const ONE_KB: usize = 1024;
/// Pages whose largest appendable record is below this boundary (in KB)
/// are kept off the free lists entirely.
pub const LOWEST_FREELIST_BOUNDARY_KB: usize = 16;
pub const FREE_LIST_SIZE: usize = PAGE_SIZE_BYTES / ONE_KB - LOWEST_FREELIST_BOUNDARY_KB; // 48
