use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{error, info, warn};

use crate::common::{ClusterError, ClusterResult};
use crate::config::{
    DATA_FILE_EXT, FREE_LIST_SIZE, LOWEST_FREELIST_BOUNDARY_KB, MAP_FILE_EXT, ONE_KB,
};

use super::atomic::{AtomicOperation, AtomicOperationsManager, RecordId};
use super::compression::{Compression, compression_by_name};
use super::conflict::ConflictStrategy;
use super::encryption::{Encryption, encryption_by_name};
use super::stats::{ClusterOp, OpTimer, SessionStats};
use super::storage::PageCache;

pub mod config;
pub mod page;
pub mod position_map;
pub mod state_page;

pub use config::{ClusterAttribute, ClusterConfig, ClusterStatus};
pub use page::MAX_RECORD_SIZE;
pub use position_map::{MapEntry, PositionStatus};

use page::ClusterPage;
use position_map::PositionMap;
use state_page::ClusterStatePage;

// Chunk framing: the head chunk region starts with the record type byte
// and the declared payload length, every chunk ends with the is-head
// flag and the packed pointer to the next chunk.
const CHUNK_TAIL_SIZE: usize = 9;
const HEAD_PREFIX_SIZE: usize = 5;
const MAX_CHUNK_REGION: usize = MAX_RECORD_SIZE - CHUNK_TAIL_SIZE;

/// `(page_index << 16) | slot`, -1 terminates a chain.
fn pack_ptr(page_index: u64, record_slot: u32) -> i64 {
    ((page_index as i64) << 16) | (record_slot as i64 & 0xFFFF)
}

fn unpack_ptr(ptr: i64) -> (u64, u32) {
    ((ptr >> 16) as u64, (ptr & 0xFFFF) as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPosition {
    pub cluster_position: u64,
    pub record_type: u8,
    pub record_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub payload: Vec<u8>,
    pub record_version: u32,
    pub record_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    NotExistent,
    Present,
    Allocated,
    Removed,
}

struct ClusterInner {
    config: ClusterConfig,
    data_file_id: u64,
    data_file_name: String,
    position_map: PositionMap,
    compression: Arc<dyn Compression>,
    encryption: Arc<dyn Encryption>,
    conflict_strategy: ConflictStrategy,
}

/// A paginated record cluster: variable-length binary records keyed by a
/// monotonically assigned logical position, stored as chains of chunks in
/// the slotted pages of one data file, with a sidecar position map file.
/// Every mutation runs inside one atomic operation; readers only take the
/// shared lock.
pub struct PaginatedCluster {
    cache: Arc<PageCache>,
    atomic: Arc<AtomicOperationsManager>,
    stats: Option<Arc<SessionStats>>,
    inner: RwLock<ClusterInner>,
}

impl PaginatedCluster {
    /// Build the cluster descriptor. Does not touch the disk.
    pub fn new(
        cache: Arc<PageCache>,
        atomic: Arc<AtomicOperationsManager>,
        config: ClusterConfig,
    ) -> ClusterResult<Self> {
        if config.record_grow_factor < 1.0 {
            return Err(ClusterError::InvalidAttribute(
                "record grow factor must be at least 1".to_string(),
            ));
        }
        if config.record_overflow_grow_factor < 1.0 {
            return Err(ClusterError::InvalidAttribute(
                "record overflow grow factor must be at least 1".to_string(),
            ));
        }
        let compression = compression_by_name(&config.compression)?;
        let encryption = encryption_by_name(&config.encryption, config.encryption_key.as_deref())?;
        let conflict_strategy = ConflictStrategy::from_name(&config.conflict_strategy)?;
        let data_file_id = config.id as u64 * 2;
        let map_file_id = data_file_id + 1;
        let data_file_name = format!("{}.{}", config.name, DATA_FILE_EXT);
        let map_file_name = format!("{}.{}", config.name, MAP_FILE_EXT);
        Ok(Self {
            cache,
            atomic,
            stats: None,
            inner: RwLock::new(ClusterInner {
                config,
                data_file_id,
                data_file_name,
                position_map: PositionMap::new(map_file_id, map_file_name),
                compression,
                encryption,
                conflict_strategy,
            }),
        })
    }

    pub fn set_session_stats(&mut self, stats: Arc<SessionStats>) {
        self.stats = Some(stats);
    }

    pub fn id(&self) -> u32 {
        self.inner.read().unwrap().config.id
    }

    pub fn name(&self) -> String {
        self.inner.read().unwrap().config.name.clone()
    }

    pub fn config(&self) -> ClusterConfig {
        self.inner.read().unwrap().config.clone()
    }

    pub fn record_grow_factor(&self) -> f32 {
        self.inner.read().unwrap().config.record_grow_factor
    }

    pub fn record_overflow_grow_factor(&self) -> f32 {
        self.inner.read().unwrap().config.record_overflow_grow_factor
    }

    pub fn compression_name(&self) -> String {
        self.inner.read().unwrap().compression.name().to_string()
    }

    pub fn encryption_name(&self) -> String {
        self.inner.read().unwrap().encryption.name().to_string()
    }

    pub fn conflict_strategy(&self) -> ConflictStrategy {
        self.inner.read().unwrap().conflict_strategy
    }

    pub fn status(&self) -> ClusterStatus {
        self.inner.read().unwrap().config.status
    }

    fn timer(&self, op: ClusterOp) -> Option<OpTimer<'_>> {
        self.stats.as_deref().map(|stats| stats.start_timer(op))
    }

    // ----- lifecycle -----

    /// Allocate the data file with its pinned state page and the position
    /// map file. `start_size` extra empty pages are linked into the free
    /// lists up front.
    pub fn create(&self, start_size: u32) -> ClusterResult<()> {
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = self.do_create(&op, &inner, start_size);
        self.end_atomic(&inner.config.name, op, result, "create")
    }

    fn do_create(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        start_size: u32,
    ) -> ClusterResult<()> {
        self.cache.add_file(inner.data_file_id, &inner.data_file_name)?;
        let (page_index, _) = op.add_page(inner.data_file_id)?;
        assert_eq!(page_index, 0, "cluster state page must be the first page");
        let state = ClusterStatePage::new();
        op.write_page(inner.data_file_id, 0, state.page())?;
        self.cache.pin(inner.data_file_id, 0)?;
        inner.position_map.create(&self.cache, op)?;
        for _ in 0..start_size {
            let (page_index, _) = op.add_page(inner.data_file_id)?;
            let page = ClusterPage::new();
            op.write_page(inner.data_file_id, page_index, page.page())?;
            self.update_free_pages_index(op, inner, -1, page_index)?;
        }
        info!("Created cluster '{}'", inner.config.name);
        Ok(())
    }

    /// Open both files and re-pin the state page.
    pub fn open(&self) -> ClusterResult<()> {
        let inner = self.inner.read().unwrap();
        if !self.cache.is_open(inner.data_file_id) {
            self.cache.open_file(inner.data_file_id, &inner.data_file_name)?;
        }
        let state = self.read_state(&inner)?;
        self.cache.pin(inner.data_file_id, 0)?;
        inner.position_map.open(&self.cache)?;
        info!(
            "Opened cluster '{}' with {} records",
            inner.config.name,
            state.get_size()
        );
        Ok(())
    }

    pub fn close(&self, flush: bool) -> ClusterResult<()> {
        let inner = self.inner.write().unwrap();
        self.cache.close_file(inner.data_file_id, flush)?;
        inner.position_map.close(&self.cache, flush)?;
        info!("Closed cluster '{}'", inner.config.name);
        Ok(())
    }

    /// Flush both files to disk.
    pub fn synch(&self) -> ClusterResult<()> {
        let inner = self.inner.read().unwrap();
        self.cache.flush_file(inner.data_file_id)?;
        inner.position_map.flush(&self.cache)
    }

    pub fn delete(&self) -> ClusterResult<()> {
        let inner = self.inner.write().unwrap();
        self.cache.delete_file(inner.data_file_id)?;
        inner.position_map.delete(&self.cache)?;
        info!("Deleted cluster '{}'", inner.config.name);
        Ok(())
    }

    /// Drop every record and start over from position zero.
    pub fn truncate(&self) -> ClusterResult<()> {
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = (|| {
            op.truncate_file(inner.data_file_id, 1)?;
            let state = ClusterStatePage::new();
            op.write_page(inner.data_file_id, 0, state.page())?;
            inner.position_map.truncate(&op)
        })();
        self.end_atomic(&inner.config.name, op, result, "truncate")
    }

    // ----- CRUD -----

    /// Reserve a cluster position with no chunks written yet.
    pub fn allocate_position(&self, record_type: u8) -> ClusterResult<PhysicalPosition> {
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = inner.position_map.allocate(&self.cache, &op);
        let result = self.end_atomic(&inner.config.name, op, result, "allocate_position")?;
        Ok(PhysicalPosition {
            cluster_position: result,
            record_type,
            record_version: 0,
        })
    }

    pub fn create_record(
        &self,
        content: &[u8],
        record_version: u32,
        record_type: u8,
        allocated_position: Option<PhysicalPosition>,
    ) -> ClusterResult<PhysicalPosition> {
        let _timer = self.timer(ClusterOp::CreateRecord);
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = self.do_create_record(
            &op,
            &inner,
            content,
            record_version,
            record_type,
            allocated_position,
        );
        self.end_atomic(&inner.config.name, op, result, "create_record")
    }

    fn do_create_record(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        content: &[u8],
        record_version: u32,
        record_type: u8,
        allocated_position: Option<PhysicalPosition>,
    ) -> ClusterResult<PhysicalPosition> {
        let buf = self.build_entry_buffer(inner, content, record_type)?;
        let (head_page, head_slot, records_size_diff) = self.write_chain(
            op,
            inner,
            &buf,
            record_version,
            inner.config.record_grow_factor,
        )?;
        let entry = MapEntry {
            page_index: head_page,
            record_slot: head_slot,
        };
        let cluster_position = match allocated_position {
            Some(position) => {
                inner
                    .position_map
                    .update(&self.cache, op, position.cluster_position, entry)?;
                position.cluster_position
            }
            None => inner.position_map.add(&self.cache, op, entry)?,
        };
        self.update_cluster_state(op, inner, 1, records_size_diff as i64)?;
        self.track_rid(op, inner, cluster_position);
        Ok(PhysicalPosition {
            cluster_position,
            record_type,
            record_version,
        })
    }

    pub fn read_record(
        &self,
        cluster_position: u64,
        prefetch_pages: u64,
    ) -> ClusterResult<Option<RawRecord>> {
        let _timer = self.timer(ClusterOp::ReadRecord);
        let inner = self.inner.read().unwrap();
        let entry = match inner
            .position_map
            .get(&self.cache, cluster_position, prefetch_pages.max(1))?
        {
            Some(entry) => entry,
            None => return Ok(None),
        };
        self.read_full_entry(&inner, entry)
            .map_err(|e| self.wrap_error(&inner.config.name, "read_record", e))
    }

    /// Errors with `RecordNotFound` for an absent record, returns None
    /// when the stored version is not newer than `record_version`, and
    /// the full record otherwise.
    pub fn read_record_if_version_is_not_latest(
        &self,
        cluster_position: u64,
        record_version: u32,
    ) -> ClusterResult<Option<RawRecord>> {
        let _timer = self.timer(ClusterOp::ReadRecord);
        let inner = self.inner.read().unwrap();
        let entry = inner
            .position_map
            .get(&self.cache, cluster_position, 1)?
            .ok_or(ClusterError::RecordNotFound {
                position: cluster_position,
            })?;
        let record = self
            .read_full_entry(&inner, entry)
            .map_err(|e| self.wrap_error(&inner.config.name, "read_record", e))?
            .ok_or(ClusterError::RecordNotFound {
                position: cluster_position,
            })?;
        if record.record_version > record_version {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    pub fn update_record(
        &self,
        cluster_position: u64,
        content: &[u8],
        record_version: u32,
        record_type: u8,
    ) -> ClusterResult<bool> {
        let _timer = self.timer(ClusterOp::UpdateRecord);
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result =
            self.do_update_record(&op, &inner, cluster_position, content, record_version, record_type);
        self.end_atomic(&inner.config.name, op, result, "update_record")
    }

    pub fn delete_record(&self, cluster_position: u64) -> ClusterResult<bool> {
        let _timer = self.timer(ClusterOp::DeleteRecord);
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = self.do_delete_record(&op, &inner, cluster_position);
        self.end_atomic(&inner.config.name, op, result, "delete_record")
    }

    /// Unbind the position without freeing the chunks. The record count
    /// drops while the byte footprint intentionally stays: the chain is
    /// left in place for readers still walking it.
    pub fn hide_record(&self, cluster_position: u64) -> ClusterResult<bool> {
        let _timer = self.timer(ClusterOp::DeleteRecord);
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = (|| {
            if inner
                .position_map
                .get(&self.cache, cluster_position, 1)?
                .is_none()
            {
                return Ok(false);
            }
            inner.position_map.remove(&self.cache, &op, cluster_position)?;
            self.update_cluster_state(&op, &inner, -1, 0)?;
            self.track_rid(&op, &inner, cluster_position);
            Ok(true)
        })();
        self.end_atomic(&inner.config.name, op, result, "hide_record")
    }

    /// Write a new chain for a previously removed position and bring the
    /// position back to life.
    pub fn recycle_record(
        &self,
        cluster_position: u64,
        content: &[u8],
        record_version: u32,
        record_type: u8,
    ) -> ClusterResult<()> {
        let _timer = self.timer(ClusterOp::CreateRecord);
        let op = self.atomic.begin()?;
        let inner = self.inner.write().unwrap();
        let result = self.do_recycle_record(
            &op,
            &inner,
            cluster_position,
            content,
            record_version,
            record_type,
        );
        self.end_atomic(&inner.config.name, op, result, "recycle_record")
    }

    fn do_recycle_record(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        cluster_position: u64,
        content: &[u8],
        record_version: u32,
        record_type: u8,
    ) -> ClusterResult<()> {
        let status = inner.position_map.get_status(&self.cache, cluster_position)?;
        if status != PositionStatus::Removed {
            return Err(ClusterError::Storage(format!(
                "record {} was not deleted, cannot recycle it",
                cluster_position
            )));
        }
        let buf = self.build_entry_buffer(inner, content, record_type)?;
        let (head_page, head_slot, records_size_diff) = self.write_chain(
            op,
            inner,
            &buf,
            record_version,
            inner.config.record_grow_factor,
        )?;
        inner.position_map.resurrect(
            &self.cache,
            op,
            cluster_position,
            MapEntry {
                page_index: head_page,
                record_slot: head_slot,
            },
        )?;
        self.update_cluster_state(op, inner, 1, records_size_diff as i64)?;
        self.track_rid(op, inner, cluster_position);
        Ok(())
    }

    // ----- queries -----

    pub fn get_physical_position(
        &self,
        cluster_position: u64,
    ) -> ClusterResult<Option<PhysicalPosition>> {
        let inner = self.inner.read().unwrap();
        let entry = match inner.position_map.get(&self.cache, cluster_position, 1)? {
            Some(entry) => entry,
            None => return Ok(None),
        };
        let page = self.load_cluster_page(&inner, entry.page_index)?;
        if entry.record_slot >= page.slot_count() || page.is_deleted(entry.record_slot) {
            return Ok(None);
        }
        if page.get_record_byte_value(entry.record_slot, -(CHUNK_TAIL_SIZE as i32)) == 0 {
            return Ok(None);
        }
        Ok(Some(PhysicalPosition {
            cluster_position,
            record_type: page.get_record_byte_value(entry.record_slot, 0),
            record_version: page.get_record_version(entry.record_slot),
        }))
    }

    pub fn get_record_status(&self, cluster_position: u64) -> ClusterResult<RecordStatus> {
        let inner = self.inner.read().unwrap();
        let status = inner.position_map.get_status(&self.cache, cluster_position)?;
        Ok(match status {
            PositionStatus::NotExistent => RecordStatus::NotExistent,
            PositionStatus::Allocated => RecordStatus::Allocated,
            PositionStatus::Filled => RecordStatus::Present,
            PositionStatus::Removed => RecordStatus::Removed,
        })
    }

    /// Count of live records.
    pub fn get_entries(&self) -> ClusterResult<u64> {
        let inner = self.inner.read().unwrap();
        Ok(self.read_state(&inner)?.get_size())
    }

    /// Byte footprint of the live chunks, framing included.
    pub fn get_records_size(&self) -> ClusterResult<u64> {
        let inner = self.inner.read().unwrap();
        Ok(self.read_state(&inner)?.get_records_size())
    }

    pub fn get_first_position(&self) -> ClusterResult<Option<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.first_position(&self.cache)
    }

    pub fn get_last_position(&self) -> ClusterResult<Option<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.last_position(&self.cache)
    }

    pub fn get_next_position(&self, cluster_position: u64) -> ClusterResult<Option<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.next_position(&self.cache, cluster_position)
    }

    pub fn higher_positions(&self, cluster_position: u64) -> ClusterResult<Vec<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.higher_positions(&self.cache, cluster_position)
    }

    pub fn ceiling_positions(&self, cluster_position: u64) -> ClusterResult<Vec<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.ceiling_positions(&self.cache, cluster_position)
    }

    pub fn lower_positions(&self, cluster_position: u64) -> ClusterResult<Vec<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.lower_positions(&self.cache, cluster_position)
    }

    pub fn floor_positions(&self, cluster_position: u64) -> ClusterResult<Vec<u64>> {
        let inner = self.inner.read().unwrap();
        inner.position_map.floor_positions(&self.cache, cluster_position)
    }

    /// Iterate every live record in position order.
    pub fn absolute_iterator(&self) -> AbsoluteIterator<'_> {
        AbsoluteIterator {
            cluster: self,
            buffer: VecDeque::new(),
            next_from: Some(0),
        }
    }

    // ----- file swapping -----

    /// Atomically swap the data file content with a prepared file.
    pub fn replace_file(&self, source: &Path) -> ClusterResult<()> {
        let inner = self.inner.write().unwrap();
        self.cache.flush_file(inner.data_file_id)?;
        self.cache
            .replace_file_content_with(inner.data_file_id, source)
    }

    /// Atomically swap the position map content with a prepared file.
    pub fn replace_cluster_map_file(&self, source: &Path) -> ClusterResult<()> {
        let inner = self.inner.write().unwrap();
        self.cache.flush_file(inner.position_map.file_id())?;
        self.cache
            .replace_file_content_with(inner.position_map.file_id(), source)
    }

    // ----- attributes -----

    pub fn set(&self, attribute: &str, value: &str) -> ClusterResult<()> {
        let attribute = ClusterAttribute::from_name(attribute)?;
        let mut inner = self.inner.write().unwrap();
        match attribute {
            ClusterAttribute::Name => {
                let new_data_name = format!("{}.{}", value, DATA_FILE_EXT);
                let new_map_name = format!("{}.{}", value, MAP_FILE_EXT);
                self.cache.rename_file(inner.data_file_id, &new_data_name)?;
                inner.data_file_name = new_data_name;
                inner.position_map.rename(&self.cache, new_map_name)?;
                inner.config.name = value.to_string();
            }
            ClusterAttribute::RecordGrowFactor => {
                inner.config.record_grow_factor = Self::parse_grow_factor(value)?;
            }
            ClusterAttribute::RecordOverflowGrowFactor => {
                inner.config.record_overflow_grow_factor = Self::parse_grow_factor(value)?;
            }
            ClusterAttribute::ConflictStrategy => {
                let strategy = ConflictStrategy::from_name(value)?;
                inner.conflict_strategy = strategy;
                inner.config.conflict_strategy = strategy.name().to_string();
            }
            ClusterAttribute::Status => {
                inner.config.status = ClusterStatus::from_name(value)?;
            }
            ClusterAttribute::Encryption => {
                let state = self.read_state(&inner)?;
                if state.get_size() != 0 {
                    return Err(ClusterError::Storage(
                        "cannot change encryption on a non-empty cluster".to_string(),
                    ));
                }
                let encryption =
                    encryption_by_name(value, inner.config.encryption_key.as_deref())?;
                inner.encryption = encryption;
                inner.config.encryption = value.to_string();
            }
        }
        Ok(())
    }

    fn parse_grow_factor(value: &str) -> ClusterResult<f32> {
        let factor: f32 = value.parse().map_err(|_| {
            ClusterError::InvalidAttribute(format!("'{}' is not a valid grow factor", value))
        })?;
        if factor < 1.0 {
            return Err(ClusterError::InvalidAttribute(
                "grow factor must be at least 1".to_string(),
            ));
        }
        Ok(factor)
    }

    // ----- internals -----

    fn load_cluster_page(&self, inner: &ClusterInner, page_index: u64) -> ClusterResult<ClusterPage> {
        Ok(ClusterPage::from_page(
            self.cache.load_page(inner.data_file_id, page_index)?,
        ))
    }

    fn read_state(&self, inner: &ClusterInner) -> ClusterResult<ClusterStatePage> {
        ClusterStatePage::from_page(self.cache.load_page(inner.data_file_id, 0)?)
    }

    fn update_cluster_state(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        size_diff: i64,
        records_size_diff: i64,
    ) -> ClusterResult<()> {
        let mut state = self.read_state(inner)?;
        state.set_size((state.get_size() as i64 + size_diff) as u64);
        state.set_records_size((state.get_records_size() as i64 + records_size_diff) as u64);
        op.write_page(inner.data_file_id, 0, state.page())
    }

    fn track_rid(&self, op: &AtomicOperation, inner: &ClusterInner, cluster_position: u64) {
        if self.atomic.track_record_changes() {
            op.add_record_id(RecordId {
                cluster_id: inner.config.id,
                cluster_position,
            });
        }
    }

    /// The free-space bucket this page belongs on, or -1 for none.
    /// Empty pages go to the last bucket, which only ever holds empty
    /// pages so a maximum-size chunk always fits its members.
    fn calculate_free_page_index(page: &ClusterPage) -> i32 {
        if page.is_empty() {
            return FREE_LIST_SIZE as i32 - 1;
        }
        let index =
            (page.get_max_record_size() / ONE_KB) as i32 - LOWEST_FREELIST_BOUNDARY_KB as i32;
        if index < 0 {
            -1
        } else {
            index.min(FREE_LIST_SIZE as i32 - 2)
        }
    }

    /// First bucket whose pages are guaranteed to take `content_size`.
    fn start_bucket_for(content_size: usize) -> usize {
        let index = content_size.div_ceil(ONE_KB) as i32 - LOWEST_FREELIST_BOUNDARY_KB as i32;
        index.clamp(0, FREE_LIST_SIZE as i32 - 1) as usize
    }

    /// Scan the buckets for a page with room for `content_size` bytes,
    /// growing the file when every list is empty. A page found under a
    /// stale bucket is re-homed and the search restarts; the loop stays
    /// iterative so corrupted lists cannot blow the stack.
    fn find_free_page(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        content_size: usize,
    ) -> ClusterResult<(u64, i32)> {
        'search: loop {
            let state = self.read_state(inner)?;
            for bucket in Self::start_bucket_for(content_size)..FREE_LIST_SIZE {
                let head = state.get_free_list_page(bucket);
                if head < 0 {
                    continue;
                }
                let page = self.load_cluster_page(inner, head as u64)?;
                let actual = Self::calculate_free_page_index(&page);
                if actual != bucket as i32 {
                    warn!(
                        "Page {} sits in free bucket {} but belongs to {}, re-homing it",
                        head, bucket, actual
                    );
                    self.update_free_pages_index(op, inner, bucket as i32, head as u64)?;
                    continue 'search;
                }
                return Ok((head as u64, bucket as i32));
            }
            // no listed page has enough room, grow the file
            let (page_index, _) = op.add_page(inner.data_file_id)?;
            let page = ClusterPage::new();
            op.write_page(inner.data_file_id, page_index, page.page())?;
            return Ok((page_index, -1));
        }
    }

    /// Re-home a page whose free-space bucket changed: splice it out of
    /// the `prev_bucket` list and push it onto the head of its new one.
    fn update_free_pages_index(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        prev_bucket: i32,
        page_index: u64,
    ) -> ClusterResult<()> {
        let mut page = self.load_cluster_page(inner, page_index)?;
        let new_bucket = Self::calculate_free_page_index(&page);
        if new_bucket == prev_bucket {
            return Ok(());
        }
        let mut state = self.read_state(inner)?;
        if new_bucket >= 0 && state.get_free_list_page(new_bucket as usize) == page_index as i64 {
            // already heads its correct bucket; only a stale bucket head
            // still references it, drop that reference
            if prev_bucket >= 0
                && state.get_free_list_page(prev_bucket as usize) == page_index as i64
            {
                state.set_free_list_page(prev_bucket as usize, -1);
                op.write_page(inner.data_file_id, 0, state.page())?;
            }
            return Ok(());
        }
        // splice out of the current list
        let prev_ptr = page.get_prev_page();
        let next_ptr = page.get_next_page();
        if prev_ptr >= 0 {
            let mut prev = self.load_cluster_page(inner, prev_ptr as u64)?;
            prev.set_next_page(next_ptr);
            op.write_page(inner.data_file_id, prev_ptr as u64, prev.page())?;
        }
        if next_ptr >= 0 {
            let mut next = self.load_cluster_page(inner, next_ptr as u64)?;
            next.set_prev_page(prev_ptr);
            op.write_page(inner.data_file_id, next_ptr as u64, next.page())?;
        }
        if prev_bucket >= 0 && state.get_free_list_page(prev_bucket as usize) == page_index as i64 {
            state.set_free_list_page(prev_bucket as usize, next_ptr);
        }
        page.set_prev_page(-1);
        page.set_next_page(-1);
        // push onto the head of the new list
        if new_bucket >= 0 {
            let old_head = state.get_free_list_page(new_bucket as usize);
            if old_head >= 0 {
                let mut old = self.load_cluster_page(inner, old_head as u64)?;
                old.set_prev_page(page_index as i64);
                op.write_page(inner.data_file_id, old_head as u64, old.page())?;
            }
            page.set_next_page(old_head);
            state.set_free_list_page(new_bucket as usize, page_index as i64);
        }
        op.write_page(inner.data_file_id, page_index, page.page())?;
        op.write_page(inner.data_file_id, 0, state.page())
    }

    fn padded_size(len: usize, grow_factor: f32) -> usize {
        ((len as f64 * grow_factor as f64).ceil() as usize).clamp(len, MAX_RECORD_SIZE)
    }

    /// Place one chunk on a page chosen from the free lists.
    fn add_entry(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        record_version: u32,
        chunk: &[u8],
        placement_size: usize,
    ) -> ClusterResult<(u64, u32)> {
        let (page_index, bucket) = self.find_free_page(op, inner, placement_size)?;
        let mut page = self.load_cluster_page(inner, page_index)?;
        let record_slot = match page.append_record(record_version, chunk) {
            Some(slot) => slot,
            None => {
                error!(
                    "Free list state of page {} is corrupt: {}",
                    page_index,
                    page.dump_header()
                );
                return Err(ClusterError::IllegalState(format!(
                    "page {} claimed by free bucket {} cannot take {} bytes",
                    page_index,
                    bucket,
                    chunk.len()
                )));
            }
        };
        op.write_page(inner.data_file_id, page_index, page.page())?;
        self.update_free_pages_index(op, inner, bucket, page_index)?;
        Ok((page_index, record_slot))
    }

    fn build_entry_buffer(
        &self,
        inner: &ClusterInner,
        content: &[u8],
        record_type: u8,
    ) -> ClusterResult<Vec<u8>> {
        let packed = inner.compression.compress(content)?;
        let packed = inner.encryption.encrypt(&packed)?;
        let mut buf = Vec::with_capacity(HEAD_PREFIX_SIZE + packed.len());
        buf.push(record_type);
        buf.extend_from_slice(&(packed.len() as u32).to_le_bytes());
        buf.extend_from_slice(&packed);
        Ok(buf)
    }

    /// Slice the entry buffer into chunks, appending each to a page from
    /// the free lists and back-patching the previous chunk's pointer.
    /// Returns the head chunk location and the byte footprint written.
    fn write_chain(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        buf: &[u8],
        record_version: u32,
        grow_factor: f32,
    ) -> ClusterResult<(u64, u32, u64)> {
        let mut records_size_diff = 0u64;
        let mut head = (0u64, 0u32);
        let mut prev: Option<(u64, u32)> = None;
        let mut from = 0usize;
        loop {
            let to = (from + MAX_CHUNK_REGION).min(buf.len());
            let mut chunk = Vec::with_capacity(to - from + CHUNK_TAIL_SIZE);
            chunk.extend_from_slice(&buf[from..to]);
            chunk.push(if from == 0 { 1 } else { 0 });
            chunk.extend_from_slice(&(-1i64).to_le_bytes());

            let placement_size = Self::padded_size(chunk.len(), grow_factor);
            let placed = self.add_entry(op, inner, record_version, &chunk, placement_size)?;
            records_size_diff += chunk.len() as u64;

            match prev {
                Some((prev_page, prev_slot)) => {
                    let mut prev_cp = self.load_cluster_page(inner, prev_page)?;
                    prev_cp.set_record_long_value(prev_slot, -8, pack_ptr(placed.0, placed.1));
                    op.write_page(inner.data_file_id, prev_page, prev_cp.page())?;
                }
                None => head = placed,
            }
            prev = Some(placed);
            from = to;
            if from >= buf.len() {
                break;
            }
        }
        Ok((head.0, head.1, records_size_diff))
    }

    /// Walk a chain from its head chunk and reassemble the record.
    fn read_full_entry(
        &self,
        inner: &ClusterInner,
        entry: MapEntry,
    ) -> ClusterResult<Option<RawRecord>> {
        let mut buf = Vec::new();
        let mut next_ptr = pack_ptr(entry.page_index, entry.record_slot);
        let mut record_version = 0;
        let mut first = true;
        while next_ptr >= 0 {
            let (page_index, record_slot) = unpack_ptr(next_ptr);
            let page = self.load_cluster_page(inner, page_index)?;
            if record_slot >= page.slot_count() || page.is_deleted(record_slot) {
                if first {
                    // concurrently deleted or never bound
                    return Ok(None);
                }
                return Err(ClusterError::Storage(format!(
                    "chunk chain is broken at page {} slot {}",
                    page_index, record_slot
                )));
            }
            if first {
                if page.get_record_byte_value(record_slot, -(CHUNK_TAIL_SIZE as i32)) == 0 {
                    // the map points at a continuation chunk, not a record
                    return Ok(None);
                }
                record_version = page.get_record_version(record_slot);
            }
            let size = page.get_record_size(record_slot);
            buf.extend_from_slice(&page.get_record_binary_value(
                record_slot,
                0,
                size - CHUNK_TAIL_SIZE,
            ));
            next_ptr = page.get_record_long_value(record_slot, -8);
            first = false;
        }
        if buf.len() < HEAD_PREFIX_SIZE {
            return Err(ClusterError::Storage(
                "record content is broken: no head prefix".to_string(),
            ));
        }
        let record_type = buf[0];
        let declared = u32::from_le_bytes(buf[1..5].try_into().unwrap()) as usize;
        if buf.len() < HEAD_PREFIX_SIZE + declared {
            return Err(ClusterError::Storage(format!(
                "record content is broken: {} bytes declared, {} stored",
                declared,
                buf.len() - HEAD_PREFIX_SIZE
            )));
        }
        let payload = &buf[HEAD_PREFIX_SIZE..HEAD_PREFIX_SIZE + declared];
        let payload = inner.encryption.decrypt(payload)?;
        let payload = inner.compression.uncompress(&payload)?;
        Ok(Some(RawRecord {
            payload,
            record_version,
            record_type,
        }))
    }

    /// First pass walks the old chain in lock-step with the new chunks,
    /// reusing slots where sizes match; the second pass deletes whatever
    /// is left of the old chain.
    fn do_update_record(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        cluster_position: u64,
        content: &[u8],
        record_version: u32,
        record_type: u8,
    ) -> ClusterResult<bool> {
        let entry = match inner.position_map.get(&self.cache, cluster_position, 1)? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let buf = self.build_entry_buffer(inner, content, record_type)?;
        let grow_factor = inner.config.record_overflow_grow_factor;

        let mut next_record_ptr = pack_ptr(entry.page_index, entry.record_slot);
        let mut records_size_diff = 0i64;
        let mut head = (0u64, 0u32);
        let mut prev: Option<(u64, u32)> = None;
        let mut from = 0usize;
        loop {
            let to = (from + MAX_CHUNK_REGION).min(buf.len());
            let mut chunk = Vec::with_capacity(to - from + CHUNK_TAIL_SIZE);
            chunk.extend_from_slice(&buf[from..to]);
            chunk.push(if from == 0 { 1 } else { 0 });
            chunk.extend_from_slice(&(-1i64).to_le_bytes());

            let placed;
            if next_record_ptr >= 0 {
                let (cur_page, cur_slot) = unpack_ptr(next_record_ptr);
                let mut page = self.load_cluster_page(inner, cur_page)?;
                if cur_slot >= page.slot_count() || page.is_deleted(cur_slot) {
                    return Err(ClusterError::Storage(format!(
                        "chunk chain of record {} is broken at page {} slot {}",
                        cluster_position, cur_page, cur_slot
                    )));
                }
                let old_size = page.get_record_size(cur_slot);
                next_record_ptr = page.get_record_long_value(cur_slot, -8);
                if old_size == chunk.len() {
                    // same size, overwrite in place
                    page.replace_record(cur_slot, &chunk, record_version);
                    op.write_page(inner.data_file_id, cur_page, page.page())?;
                    placed = (cur_page, cur_slot);
                } else {
                    let bucket = Self::calculate_free_page_index(&page);
                    records_size_diff -= page.delete_record(cur_slot) as i64;
                    // prefer the page the old chunk lived on
                    if let Some(slot) = page.append_record(record_version, &chunk) {
                        op.write_page(inner.data_file_id, cur_page, page.page())?;
                        self.update_free_pages_index(op, inner, bucket, cur_page)?;
                        placed = (cur_page, slot);
                    } else {
                        op.write_page(inner.data_file_id, cur_page, page.page())?;
                        self.update_free_pages_index(op, inner, bucket, cur_page)?;
                        let placement_size = Self::padded_size(chunk.len(), grow_factor);
                        placed =
                            self.add_entry(op, inner, record_version, &chunk, placement_size)?;
                    }
                    records_size_diff += chunk.len() as i64;
                }
            } else {
                // the old chain ran out, place the rest on free pages
                let placement_size = Self::padded_size(chunk.len(), grow_factor);
                placed = self.add_entry(op, inner, record_version, &chunk, placement_size)?;
                records_size_diff += chunk.len() as i64;
            }
            match prev {
                Some((prev_page, prev_slot)) => {
                    let mut prev_cp = self.load_cluster_page(inner, prev_page)?;
                    prev_cp.set_record_long_value(prev_slot, -8, pack_ptr(placed.0, placed.1));
                    op.write_page(inner.data_file_id, prev_page, prev_cp.page())?;
                }
                None => head = placed,
            }
            prev = Some(placed);
            from = to;
            if from >= buf.len() {
                break;
            }
        }
        // second pass: the old chain was longer, delete the leftover tail
        while next_record_ptr >= 0 {
            let (page_index, record_slot) = unpack_ptr(next_record_ptr);
            let mut page = self.load_cluster_page(inner, page_index)?;
            if record_slot >= page.slot_count() || page.is_deleted(record_slot) {
                return Err(ClusterError::Storage(format!(
                    "chunk chain of record {} is broken at page {} slot {}",
                    cluster_position, page_index, record_slot
                )));
            }
            next_record_ptr = page.get_record_long_value(record_slot, -8);
            let bucket = Self::calculate_free_page_index(&page);
            records_size_diff -= page.delete_record(record_slot) as i64;
            op.write_page(inner.data_file_id, page_index, page.page())?;
            self.update_free_pages_index(op, inner, bucket, page_index)?;
        }
        if head != (entry.page_index, entry.record_slot) {
            inner.position_map.update(
                &self.cache,
                op,
                cluster_position,
                MapEntry {
                    page_index: head.0,
                    record_slot: head.1,
                },
            )?;
        }
        self.update_cluster_state(op, inner, 0, records_size_diff)?;
        self.track_rid(op, inner, cluster_position);
        Ok(true)
    }

    fn do_delete_record(
        &self,
        op: &AtomicOperation,
        inner: &ClusterInner,
        cluster_position: u64,
    ) -> ClusterResult<bool> {
        let entry = match inner.position_map.get(&self.cache, cluster_position, 1)? {
            Some(entry) => entry,
            None => return Ok(false),
        };
        let mut next_ptr = pack_ptr(entry.page_index, entry.record_slot);
        let mut removed_size = 0u64;
        let mut first = true;
        while next_ptr >= 0 {
            let (page_index, record_slot) = unpack_ptr(next_ptr);
            // observe first, then reload for the mutation
            let probe = self.load_cluster_page(inner, page_index)?;
            if record_slot >= probe.slot_count() || probe.is_deleted(record_slot) {
                if first {
                    return Ok(false);
                }
                return Err(ClusterError::Storage(format!(
                    "chunk chain of record {} is broken at page {} slot {}",
                    cluster_position, page_index, record_slot
                )));
            }
            next_ptr = probe.get_record_long_value(record_slot, -8);
            drop(probe);
            let mut page = self.load_cluster_page(inner, page_index)?;
            let bucket = Self::calculate_free_page_index(&page);
            removed_size += page.delete_record(record_slot) as u64;
            op.write_page(inner.data_file_id, page_index, page.page())?;
            self.update_free_pages_index(op, inner, bucket, page_index)?;
            first = false;
        }
        inner.position_map.remove(&self.cache, op, cluster_position)?;
        self.update_cluster_state(op, inner, -1, -(removed_size as i64))?;
        self.track_rid(op, inner, cluster_position);
        Ok(true)
    }

    /// End the atomic operation exactly once: commit on success, roll
    /// back on error and wrap the error with the cluster context.
    fn end_atomic<T>(
        &self,
        cluster_name: &str,
        op: AtomicOperation,
        result: ClusterResult<T>,
        operation: &'static str,
    ) -> ClusterResult<T> {
        match result {
            Ok(value) => {
                self.atomic.commit(op)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = self.atomic.rollback(op) {
                    error!(
                        "Rollback of {} on cluster '{}' failed: {}",
                        operation, cluster_name, rollback_error
                    );
                }
                Err(self.wrap_error(cluster_name, operation, e))
            }
        }
    }

    fn wrap_error(
        &self,
        cluster_name: &str,
        operation: &'static str,
        error: ClusterError,
    ) -> ClusterError {
        match error {
            ClusterError::Io(_) | ClusterError::RecordNotFound { .. } | ClusterError::Cluster { .. } => {
                error
            }
            other => ClusterError::Cluster {
                cluster: cluster_name.to_string(),
                operation,
                source: Box::new(other),
            },
        }
    }
}

/// Batched scan over all live records in position order.
pub struct AbsoluteIterator<'a> {
    cluster: &'a PaginatedCluster,
    buffer: VecDeque<u64>,
    next_from: Option<u64>,
}

impl Iterator for AbsoluteIterator<'_> {
    type Item = ClusterResult<PhysicalPosition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(position) = self.buffer.pop_front() {
                match self.cluster.get_physical_position(position) {
                    Ok(Some(physical)) => return Some(Ok(physical)),
                    Ok(None) => continue, // went away between batches
                    Err(e) => return Some(Err(e)),
                }
            }
            let from = self.next_from?;
            match self.cluster.ceiling_positions(from) {
                Ok(batch) if batch.is_empty() => {
                    self.next_from = None;
                    return None;
                }
                Ok(batch) => {
                    self.next_from = batch.last().map(|last| last + 1);
                    self.buffer.extend(batch);
                }
                Err(e) => {
                    self.next_from = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
