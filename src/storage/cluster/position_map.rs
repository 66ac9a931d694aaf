use crate::common::{ClusterError, ClusterResult};
use crate::config::PAGE_SIZE_BYTES;
use crate::storage::atomic::AtomicOperation;
use crate::storage::storage::PageCache;

use super::state_page::{FORMAT_VERSION, HEADER_MAGIC};

/// One entry: [status: u8][page_index: u64][record_slot: u32]
pub const MAP_ENTRY_SIZE: usize = 13;
pub const ENTRIES_PER_PAGE: usize = PAGE_SIZE_BYTES / MAP_ENTRY_SIZE;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const COUNT_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    NotExistent = 0,
    Allocated = 1,
    Filled = 2,
    Removed = 3,
}

impl PositionStatus {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => PositionStatus::NotExistent,
            1 => PositionStatus::Allocated,
            2 => PositionStatus::Filled,
            3 => PositionStatus::Removed,
            other => panic!("invalid position status byte: {}", other),
        }
    }
}

/// Location of a record's head chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    pub page_index: u64,
    pub record_slot: u32,
}

/// Dense allocator mapping logical cluster positions to (page, slot)
/// entries plus a status byte, backed by its own page file. Page 0 is a
/// header with the allocated-position count; positions are never reused.
pub struct PositionMap {
    file_id: u64,
    file_name: String,
}

impl PositionMap {
    pub fn new(file_id: u64, file_name: String) -> Self {
        Self { file_id, file_name }
    }

    pub fn file_id(&self) -> u64 {
        self.file_id
    }

    pub fn full_name(&self) -> &str {
        &self.file_name
    }

    fn locate(position: u64) -> (u64, usize) {
        let page_index = 1 + position / ENTRIES_PER_PAGE as u64;
        let offset = (position % ENTRIES_PER_PAGE as u64) as usize * MAP_ENTRY_SIZE;
        (page_index, offset)
    }

    pub fn create(&self, cache: &PageCache, op: &AtomicOperation) -> ClusterResult<()> {
        cache.add_file(self.file_id, &self.file_name)?;
        let (page_index, mut page) = op.add_page(self.file_id)?;
        assert_eq!(page_index, 0, "map header must be the first page");
        page.data[MAGIC_OFFSET..MAGIC_OFFSET + 4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        page.data[VERSION_OFFSET..VERSION_OFFSET + 4]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        page.data[COUNT_OFFSET..COUNT_OFFSET + 8].copy_from_slice(&0u64.to_le_bytes());
        op.write_page(self.file_id, 0, &page)
    }

    pub fn open(&self, cache: &PageCache) -> ClusterResult<()> {
        if !cache.is_open(self.file_id) {
            cache.open_file(self.file_id, &self.file_name)?;
        }
        let header = cache.load_page(self.file_id, 0)?;
        let magic = u32::from_le_bytes(header.data[MAGIC_OFFSET..MAGIC_OFFSET + 4].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(ClusterError::Storage(
                "invalid position map file, wrong magic number".to_string(),
            ));
        }
        Ok(())
    }

    pub fn close(&self, cache: &PageCache, flush: bool) -> ClusterResult<()> {
        cache.close_file(self.file_id, flush)
    }

    pub fn delete(&self, cache: &PageCache) -> ClusterResult<()> {
        cache.delete_file(self.file_id)
    }

    pub fn flush(&self, cache: &PageCache) -> ClusterResult<()> {
        cache.flush_file(self.file_id)
    }

    pub fn rename(&mut self, cache: &PageCache, new_name: String) -> ClusterResult<()> {
        cache.rename_file(self.file_id, &new_name)?;
        self.file_name = new_name;
        Ok(())
    }

    /// Drop every position and start allocating from zero again.
    pub fn truncate(&self, op: &AtomicOperation) -> ClusterResult<()> {
        op.truncate_file(self.file_id, 1)?;
        op.write_bytes(self.file_id, 0, COUNT_OFFSET, &0u64.to_le_bytes())
    }

    /// Number of positions handed out so far.
    pub fn count(&self, cache: &PageCache) -> ClusterResult<u64> {
        let header = cache.load_page(self.file_id, 0)?;
        Ok(u64::from_le_bytes(
            header.data[COUNT_OFFSET..COUNT_OFFSET + 8].try_into().unwrap(),
        ))
    }

    fn set_count(&self, op: &AtomicOperation, count: u64) -> ClusterResult<()> {
        op.write_bytes(self.file_id, 0, COUNT_OFFSET, &count.to_le_bytes())
    }

    fn read_raw(
        &self,
        cache: &PageCache,
        position: u64,
        prefetch_pages: u64,
    ) -> ClusterResult<(PositionStatus, MapEntry)> {
        let (page_index, offset) = Self::locate(position);
        let page = cache.load_page_prefetch(self.file_id, page_index, prefetch_pages)?;
        let status = PositionStatus::from_byte(page.data[offset]);
        let entry_page =
            u64::from_le_bytes(page.data[offset + 1..offset + 9].try_into().unwrap());
        let entry_slot =
            u32::from_le_bytes(page.data[offset + 9..offset + 13].try_into().unwrap());
        Ok((
            status,
            MapEntry {
                page_index: entry_page,
                record_slot: entry_slot,
            },
        ))
    }

    fn write_raw(
        &self,
        op: &AtomicOperation,
        position: u64,
        status: PositionStatus,
        entry: MapEntry,
    ) -> ClusterResult<()> {
        let (page_index, offset) = Self::locate(position);
        let mut raw = [0u8; MAP_ENTRY_SIZE];
        raw[0] = status as u8;
        raw[1..9].copy_from_slice(&entry.page_index.to_le_bytes());
        raw[9..13].copy_from_slice(&entry.record_slot.to_le_bytes());
        op.write_bytes(self.file_id, page_index, offset, &raw)
    }

    fn ensure_entry_page(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        page_index: u64,
    ) -> ClusterResult<()> {
        while cache.filled_up_to(self.file_id)? <= page_index {
            op.add_page(self.file_id)?;
        }
        Ok(())
    }

    /// Reserve the next position with no data pointer yet.
    pub fn allocate(&self, cache: &PageCache, op: &AtomicOperation) -> ClusterResult<u64> {
        let position = self.count(cache)?;
        let (page_index, _) = Self::locate(position);
        self.ensure_entry_page(cache, op, page_index)?;
        self.write_raw(
            op,
            position,
            PositionStatus::Allocated,
            MapEntry {
                page_index: 0,
                record_slot: 0,
            },
        )?;
        self.set_count(op, position + 1)?;
        Ok(position)
    }

    /// Allocate a position and immediately bind it to `entry`.
    pub fn add(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        entry: MapEntry,
    ) -> ClusterResult<u64> {
        let position = self.count(cache)?;
        let (page_index, _) = Self::locate(position);
        self.ensure_entry_page(cache, op, page_index)?;
        self.write_raw(op, position, PositionStatus::Filled, entry)?;
        self.set_count(op, position + 1)?;
        Ok(position)
    }

    /// Move an allocated or filled position to a new (page, slot).
    pub fn update(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        position: u64,
        entry: MapEntry,
    ) -> ClusterResult<()> {
        let count = self.count(cache)?;
        if position >= count {
            return Err(ClusterError::Storage(format!(
                "position {} was never allocated",
                position
            )));
        }
        let (status, _) = self.read_raw(cache, position, 1)?;
        match status {
            PositionStatus::Allocated | PositionStatus::Filled => {
                self.write_raw(op, position, PositionStatus::Filled, entry)
            }
            _ => Err(ClusterError::Storage(format!(
                "cannot update position {} with status {:?}",
                position, status
            ))),
        }
    }

    /// Mark a position removed. The position is not reused.
    pub fn remove(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        position: u64,
    ) -> ClusterResult<()> {
        if position >= self.count(cache)? {
            return Err(ClusterError::Storage(format!(
                "position {} was never allocated",
                position
            )));
        }
        let (status, entry) = self.read_raw(cache, position, 1)?;
        if status != PositionStatus::Filled {
            return Err(ClusterError::Storage(format!(
                "cannot remove position {} with status {:?}",
                position, status
            )));
        }
        self.write_raw(op, position, PositionStatus::Removed, entry)
    }

    /// Bring a removed position back to life at a new (page, slot).
    pub fn resurrect(
        &self,
        cache: &PageCache,
        op: &AtomicOperation,
        position: u64,
        entry: MapEntry,
    ) -> ClusterResult<()> {
        let count = self.count(cache)?;
        if position >= count {
            return Err(ClusterError::Storage(format!(
                "position {} was never allocated",
                position
            )));
        }
        let (status, _) = self.read_raw(cache, position, 1)?;
        if status != PositionStatus::Removed {
            return Err(ClusterError::Storage(format!(
                "record {} was not deleted, cannot resurrect it",
                position
            )));
        }
        self.write_raw(op, position, PositionStatus::Filled, entry)
    }

    /// The (page, slot) of a filled position, None otherwise. The page
    /// count hint is forwarded to the cache as a prefetch for scans.
    pub fn get(
        &self,
        cache: &PageCache,
        position: u64,
        page_count_hint: u64,
    ) -> ClusterResult<Option<MapEntry>> {
        if position >= self.count(cache)? {
            return Ok(None);
        }
        let (status, entry) = self.read_raw(cache, position, page_count_hint)?;
        Ok(match status {
            PositionStatus::Filled => Some(entry),
            _ => None,
        })
    }

    pub fn get_status(&self, cache: &PageCache, position: u64) -> ClusterResult<PositionStatus> {
        if position >= self.count(cache)? {
            return Ok(PositionStatus::NotExistent);
        }
        let (status, _) = self.read_raw(cache, position, 1)?;
        Ok(status)
    }

    // scan towards the end, one map page at a time
    fn next_filled(&self, cache: &PageCache, from: u64) -> ClusterResult<Option<u64>> {
        let count = self.count(cache)?;
        let mut position = from;
        while position < count {
            let (page_index, _) = Self::locate(position);
            let page = cache.load_page(self.file_id, page_index)?;
            let page_first = (position / ENTRIES_PER_PAGE as u64) * ENTRIES_PER_PAGE as u64;
            let page_end = (page_first + ENTRIES_PER_PAGE as u64).min(count);
            while position < page_end {
                let offset = (position % ENTRIES_PER_PAGE as u64) as usize * MAP_ENTRY_SIZE;
                if page.data[offset] == PositionStatus::Filled as u8 {
                    return Ok(Some(position));
                }
                position += 1;
            }
        }
        Ok(None)
    }

    // scan towards the start, one map page at a time
    fn prev_filled(&self, cache: &PageCache, from: u64) -> ClusterResult<Option<u64>> {
        let count = self.count(cache)?;
        if count == 0 {
            return Ok(None);
        }
        let mut position = from.min(count - 1);
        loop {
            let (page_index, _) = Self::locate(position);
            let page = cache.load_page(self.file_id, page_index)?;
            let page_first = (position / ENTRIES_PER_PAGE as u64) * ENTRIES_PER_PAGE as u64;
            loop {
                let offset = (position % ENTRIES_PER_PAGE as u64) as usize * MAP_ENTRY_SIZE;
                if page.data[offset] == PositionStatus::Filled as u8 {
                    return Ok(Some(position));
                }
                if position == page_first {
                    break;
                }
                position -= 1;
            }
            if page_first == 0 {
                return Ok(None);
            }
            position = page_first - 1;
        }
    }

    // all filled positions of one map page within [from, to]
    fn filled_between(
        &self,
        cache: &PageCache,
        from: u64,
        to: u64,
    ) -> ClusterResult<Vec<u64>> {
        let (page_index, _) = Self::locate(from);
        let page = cache.load_page(self.file_id, page_index)?;
        let mut positions = Vec::new();
        for position in from..=to {
            let offset = (position % ENTRIES_PER_PAGE as u64) as usize * MAP_ENTRY_SIZE;
            if page.data[offset] == PositionStatus::Filled as u8 {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    pub fn first_position(&self, cache: &PageCache) -> ClusterResult<Option<u64>> {
        self.next_filled(cache, 0)
    }

    pub fn last_position(&self, cache: &PageCache) -> ClusterResult<Option<u64>> {
        self.prev_filled(cache, u64::MAX)
    }

    pub fn next_position(&self, cache: &PageCache, position: u64) -> ClusterResult<Option<u64>> {
        self.next_filled(cache, position + 1)
    }

    /// Filled positions strictly above `position`, at most the rest of
    /// the map page holding the first match.
    pub fn higher_positions(
        &self,
        cache: &PageCache,
        position: u64,
    ) -> ClusterResult<Vec<u64>> {
        self.positions_from(cache, position.saturating_add(1))
    }

    /// Filled positions at or above `position`, same page bound.
    pub fn ceiling_positions(
        &self,
        cache: &PageCache,
        position: u64,
    ) -> ClusterResult<Vec<u64>> {
        self.positions_from(cache, position)
    }

    fn positions_from(&self, cache: &PageCache, from: u64) -> ClusterResult<Vec<u64>> {
        let count = self.count(cache)?;
        let first = match self.next_filled(cache, from)? {
            Some(first) => first,
            None => return Ok(Vec::new()),
        };
        let page_first = (first / ENTRIES_PER_PAGE as u64) * ENTRIES_PER_PAGE as u64;
        let page_end = (page_first + ENTRIES_PER_PAGE as u64).min(count);
        self.filled_between(cache, first, page_end - 1)
    }

    /// Filled positions strictly below `position`, at most the part of
    /// the map page holding the closest match, ascending.
    pub fn lower_positions(
        &self,
        cache: &PageCache,
        position: u64,
    ) -> ClusterResult<Vec<u64>> {
        if position == 0 {
            return Ok(Vec::new());
        }
        self.positions_down_from(cache, position - 1)
    }

    /// Filled positions at or below `position`, same page bound.
    pub fn floor_positions(
        &self,
        cache: &PageCache,
        position: u64,
    ) -> ClusterResult<Vec<u64>> {
        self.positions_down_from(cache, position)
    }

    fn positions_down_from(&self, cache: &PageCache, from: u64) -> ClusterResult<Vec<u64>> {
        let last = match self.prev_filled(cache, from)? {
            Some(last) => last,
            None => return Ok(Vec::new()),
        };
        let page_first = (last / ENTRIES_PER_PAGE as u64) * ENTRIES_PER_PAGE as u64;
        self.filled_between(cache, page_first, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::atomic::AtomicOperationsManager;
    use crate::utils::test_dir;
    use std::sync::Arc;

    fn setup(annot: &str) -> (Arc<PageCache>, AtomicOperationsManager, PositionMap) {
        let dir = test_dir(annot);
        let cache = Arc::new(PageCache::new(&dir).unwrap());
        let manager = AtomicOperationsManager::new(cache.clone()).unwrap();
        let map = PositionMap::new(1, "positions.cpm".to_string());
        let op = manager.begin().unwrap();
        map.create(&cache, &op).unwrap();
        manager.commit(op).unwrap();
        (cache, manager, map)
    }

    #[test]
    fn test_allocate_then_fill() {
        let (cache, manager, map) = setup("map_allocate");
        let op = manager.begin().unwrap();
        let p0 = map.allocate(&cache, &op).unwrap();
        let p1 = map.allocate(&cache, &op).unwrap();
        assert_eq!((p0, p1), (0, 1));
        assert_eq!(
            map.get_status(&cache, p0).unwrap(),
            PositionStatus::Allocated
        );
        assert!(map.get(&cache, p0, 1).unwrap().is_none());

        let entry = MapEntry {
            page_index: 4,
            record_slot: 2,
        };
        map.update(&cache, &op, p0, entry).unwrap();
        manager.commit(op).unwrap();

        assert_eq!(map.get(&cache, p0, 1).unwrap(), Some(entry));
        assert_eq!(map.get_status(&cache, p0).unwrap(), PositionStatus::Filled);
    }

    #[test]
    fn test_positions_are_monotonic_and_not_reused() {
        let (cache, manager, map) = setup("map_monotonic");
        let op = manager.begin().unwrap();
        let entry = MapEntry {
            page_index: 1,
            record_slot: 0,
        };
        let p0 = map.add(&cache, &op, entry).unwrap();
        let p1 = map.add(&cache, &op, entry).unwrap();
        map.remove(&cache, &op, p0).unwrap();
        let p2 = map.add(&cache, &op, entry).unwrap();
        manager.commit(op).unwrap();

        assert!(p0 < p1 && p1 < p2);
        assert_eq!(map.get_status(&cache, p0).unwrap(), PositionStatus::Removed);
    }

    #[test]
    fn test_remove_and_resurrect() {
        let (cache, manager, map) = setup("map_resurrect");
        let entry = MapEntry {
            page_index: 1,
            record_slot: 0,
        };
        let op = manager.begin().unwrap();
        let position = map.add(&cache, &op, entry).unwrap();
        // resurrect on a live position must fail
        assert!(map.resurrect(&cache, &op, position, entry).is_err());
        map.remove(&cache, &op, position).unwrap();
        assert!(map.get(&cache, position, 1).unwrap().is_none());
        // remove twice must fail
        assert!(map.remove(&cache, &op, position).is_err());

        let reborn = MapEntry {
            page_index: 9,
            record_slot: 5,
        };
        map.resurrect(&cache, &op, position, reborn).unwrap();
        manager.commit(op).unwrap();
        assert_eq!(map.get(&cache, position, 1).unwrap(), Some(reborn));
    }

    #[test]
    fn test_navigation() {
        let (cache, manager, map) = setup("map_navigation");
        let entry = MapEntry {
            page_index: 1,
            record_slot: 0,
        };
        let op = manager.begin().unwrap();
        for _ in 0..6 {
            map.add(&cache, &op, entry).unwrap();
        }
        for removed in [0u64, 2, 5] {
            map.remove(&cache, &op, removed).unwrap();
        }
        manager.commit(op).unwrap();

        assert_eq!(map.first_position(&cache).unwrap(), Some(1));
        assert_eq!(map.last_position(&cache).unwrap(), Some(4));
        assert_eq!(map.next_position(&cache, 1).unwrap(), Some(3));
        assert_eq!(map.next_position(&cache, 4).unwrap(), None);

        assert_eq!(map.higher_positions(&cache, 1).unwrap(), vec![3, 4]);
        assert_eq!(map.ceiling_positions(&cache, 1).unwrap(), vec![1, 3, 4]);
        assert_eq!(map.lower_positions(&cache, 3).unwrap(), vec![1]);
        assert_eq!(map.floor_positions(&cache, 3).unwrap(), vec![1, 3]);
        assert_eq!(map.lower_positions(&cache, 0).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_beyond_range_is_not_existent() {
        let (cache, _manager, map) = setup("map_beyond");
        assert_eq!(
            map.get_status(&cache, 100).unwrap(),
            PositionStatus::NotExistent
        );
        assert!(map.get(&cache, 100, 1).unwrap().is_none());
    }

    #[test]
    fn test_truncate_resets_positions() {
        let (cache, manager, map) = setup("map_truncate");
        let entry = MapEntry {
            page_index: 1,
            record_slot: 0,
        };
        let op = manager.begin().unwrap();
        for _ in 0..3 {
            map.add(&cache, &op, entry).unwrap();
        }
        manager.commit(op).unwrap();

        let op = manager.begin().unwrap();
        map.truncate(&op).unwrap();
        manager.commit(op).unwrap();

        assert_eq!(map.count(&cache).unwrap(), 0);
        let op = manager.begin().unwrap();
        assert_eq!(map.add(&cache, &op, entry).unwrap(), 0);
        manager.commit(op).unwrap();
    }
}
