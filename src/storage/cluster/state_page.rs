use crate::common::{ClusterError, ClusterResult};
use crate::config::FREE_LIST_SIZE;
use crate::storage::storage::Page;

pub const HEADER_MAGIC: u32 = 0x554c4352; // 'RCLU' in little endian hex
pub const FORMAT_VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;
const RECORDS_SIZE_OFFSET: usize = 16;
const FREE_LIST_OFFSET: usize = 24;

/// Page 0 of the data file, pinned in cache for the cluster's lifetime.
/// Holds the aggregate counters and the head page of every free-space
/// bucket list.
pub struct ClusterStatePage {
    page: Page,
}

impl ClusterStatePage {
    pub fn new() -> Self {
        let mut state = Self { page: Page::new() };
        state.write_u32(MAGIC_OFFSET, HEADER_MAGIC);
        state.write_u32(VERSION_OFFSET, FORMAT_VERSION);
        state.set_size(0);
        state.set_records_size(0);
        for bucket in 0..FREE_LIST_SIZE {
            state.set_free_list_page(bucket, -1);
        }
        state
    }

    pub fn from_page(page: Page) -> ClusterResult<Self> {
        let state = Self { page };
        if state.read_u32(MAGIC_OFFSET) != HEADER_MAGIC {
            return Err(ClusterError::Storage(
                "invalid cluster file, wrong magic number".to_string(),
            ));
        }
        let version = state.read_u32(VERSION_OFFSET);
        if version != FORMAT_VERSION {
            return Err(ClusterError::Storage(format!(
                "unsupported cluster file version: {}",
                version
            )));
        }
        Ok(state)
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.page.data[offset..offset + 4].try_into().unwrap())
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.page.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.page.data[offset..offset + 8].try_into().unwrap())
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.page.data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Count of live records.
    pub fn get_size(&self) -> u64 {
        self.read_u64(SIZE_OFFSET)
    }

    pub fn set_size(&mut self, size: u64) {
        self.write_u64(SIZE_OFFSET, size);
    }

    /// Byte footprint of the live chunks, framing included.
    pub fn get_records_size(&self) -> u64 {
        self.read_u64(RECORDS_SIZE_OFFSET)
    }

    pub fn set_records_size(&mut self, records_size: u64) {
        self.write_u64(RECORDS_SIZE_OFFSET, records_size);
    }

    pub fn get_free_list_page(&self, bucket: usize) -> i64 {
        assert!(bucket < FREE_LIST_SIZE, "bucket {} out of range", bucket);
        self.read_u64(FREE_LIST_OFFSET + bucket * 8) as i64
    }

    pub fn set_free_list_page(&mut self, bucket: usize, page_index: i64) {
        assert!(bucket < FREE_LIST_SIZE, "bucket {} out of range", bucket);
        self.write_u64(FREE_LIST_OFFSET + bucket * 8, page_index as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state_page() {
        let state = ClusterStatePage::new();
        assert_eq!(state.get_size(), 0);
        assert_eq!(state.get_records_size(), 0);
        for bucket in 0..FREE_LIST_SIZE {
            assert_eq!(state.get_free_list_page(bucket), -1);
        }
    }

    #[test]
    fn test_counters_roundtrip() {
        let mut state = ClusterStatePage::new();
        state.set_size(42);
        state.set_records_size(1234);
        state.set_free_list_page(0, 7);
        state.set_free_list_page(FREE_LIST_SIZE - 1, 9);

        let state = ClusterStatePage::from_page(state.page.clone()).unwrap();
        assert_eq!(state.get_size(), 42);
        assert_eq!(state.get_records_size(), 1234);
        assert_eq!(state.get_free_list_page(0), 7);
        assert_eq!(state.get_free_list_page(FREE_LIST_SIZE - 1), 9);
    }

    #[test]
    fn test_magic_is_validated() {
        let page = Page::new();
        assert!(ClusterStatePage::from_page(page).is_err());
    }
}
