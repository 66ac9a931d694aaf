use crate::config::{FILE_REGISTRY_NAME, MAX_PAGE_CACHE_BYTES, PAGE_SIZE_BYTES};
use crate::common::{ClusterError, ClusterResult};
use cache::LRUCache;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

mod cache;

#[derive(Clone)]
pub struct Page {
    pub data: Vec<u8>,
    need_flush: bool,
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE_BYTES],
            need_flush: true,
        }
    }

    pub fn max_size() -> usize {
        PAGE_SIZE_BYTES
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

/// Manager of one page file: reads and writes go through an LRU cache,
/// dirty pages are written back on eviction and on flush.
pub struct StorageManager {
    file: Mutex<File>,
    file_path: Mutex<PathBuf>,
    file_page_num: Mutex<u64>, // number of pages in file
    pages: Mutex<LRUCache>,    // cache of pages which has the latest data
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        let _ = self.flush(); // don't forget to flush
    }
}

impl StorageManager {
    /// Create a new page file. The file must not exist yet.
    pub fn create<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ClusterError::Storage(format!(
                    "file {} already exists",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            file: Mutex::new(file),
            file_path: Mutex::new(path.to_path_buf()),
            file_page_num: Mutex::new(0),
            pages: Mutex::new(LRUCache::new(MAX_PAGE_CACHE_BYTES / PAGE_SIZE_BYTES)),
        })
    }

    /// Open an existing page file.
    pub fn open<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_page_num = file.metadata()?.len() / PAGE_SIZE_BYTES as u64;
        Ok(Self {
            file: Mutex::new(file),
            file_path: Mutex::new(path.to_path_buf()),
            file_page_num: Mutex::new(file_page_num),
            pages: Mutex::new(LRUCache::new(MAX_PAGE_CACHE_BYTES / PAGE_SIZE_BYTES)),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.file_path.lock().unwrap().clone()
    }

    pub fn max_page_index(&self) -> Option<u64> {
        let file_page_num = *self.file_page_num.lock().unwrap();
        let max_file_page_index = if file_page_num >= 1 {
            Some(file_page_num - 1)
        } else {
            None
        };
        let max_cached_page_index = self.pages.lock().unwrap().max_key();

        match (max_file_page_index, max_cached_page_index) {
            (None, None) => None,
            (Some(f), None) => Some(f),
            (None, Some(c)) => Some(c),
            (Some(f), Some(c)) => Some(f.max(c)),
        } // return the max page index of file and cache(None means empty file and cache)
    }

    /// Number of pages the file is filled up to (file plus not yet flushed tail).
    pub fn page_count(&self) -> u64 {
        match self.max_page_index() {
            Some(idx) => idx + 1,
            None => 0,
        }
    }

    fn is_page_index_valid(&self, page_index: u64) -> ClusterResult<()> {
        match self.max_page_index() {
            Some(max_index) if page_index <= max_index => Ok(()),
            _ => Err(ClusterError::Storage(format!(
                "page index {} out of bounds in {}",
                page_index,
                self.file_path.lock().unwrap().display()
            ))),
        }
    }

    fn write_back_evicted_page(
        &self,
        evicted: Option<(u64, Arc<RwLock<Page>>)>,
    ) -> ClusterResult<()> {
        if let Some((evicted_page_index, evicted_page)) = evicted {
            let mut evicted_page = evicted_page.write().map_err(|_| {
                ClusterError::Storage("Poisoned RwLock in page cache".to_string())
            })?;
            if evicted_page.need_flush {
                let mut file_page_num = self.file_page_num.lock().unwrap();
                let mut file = self.file.lock().unwrap();
                if evicted_page_index >= *file_page_num {
                    let required_file_size = (evicted_page_index + 1) * PAGE_SIZE_BYTES as u64;
                    file.set_len(required_file_size)?; // extend file (fills with zeros)
                    *file_page_num = evicted_page_index + 1;
                }
                let offset = evicted_page_index * PAGE_SIZE_BYTES as u64;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&evicted_page.data)?;
                file.sync_data()?;
                evicted_page.need_flush = false;
            }
        }
        Ok(())
    }

    pub fn read_page(&self, page_index: u64) -> ClusterResult<Page> {
        self.is_page_index_valid(page_index)?;

        if let Some(page_arc) = self.pages.lock().unwrap().get(&page_index) {
            let page = page_arc.read().unwrap().clone();
            return Ok(page);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(page_index * PAGE_SIZE_BYTES as u64))?;
        let mut buffer = vec![0u8; PAGE_SIZE_BYTES];
        file.read_exact(&mut buffer)?;
        drop(file);
        let page = Page {
            data: buffer,
            need_flush: false,
        };
        let evicted = self
            .pages
            .lock()
            .unwrap()
            .insert(page_index, Arc::new(RwLock::new(page.clone())));
        self.write_back_evicted_page(evicted)?;
        Ok(page)
    }

    /// Warm the cache with up to `count` pages starting at `page_index`.
    /// Purely a read-ahead hint, capped at the end of the file.
    pub fn prefetch(&self, page_index: u64, count: u64) -> ClusterResult<()> {
        let page_count = self.page_count();
        let end = (page_index + count.max(1)).min(page_count);
        for index in page_index..end {
            if self.pages.lock().unwrap().contains(&index) {
                continue;
            }
            self.read_page(index)?;
        }
        Ok(())
    }

    pub fn write_page(&self, page: &Page, page_index: u64) -> ClusterResult<()> {
        self.is_page_index_valid(page_index)?;
        let mut page = page.clone();
        page.need_flush = true;
        let page_arc = Arc::new(RwLock::new(page));
        let evicted = self.pages.lock().unwrap().insert(page_index, page_arc);
        self.write_back_evicted_page(evicted)?;
        Ok(())
    }

    pub fn new_page(&self) -> ClusterResult<(u64, Page)> {
        let new_page_index = match self.max_page_index() {
            Some(max_index) => max_index + 1,
            None => 0,
        };
        let new_page = Page::new();
        let evicted = self
            .pages
            .lock()
            .unwrap()
            .insert(new_page_index, Arc::new(RwLock::new(new_page.clone())));
        self.write_back_evicted_page(evicted)?;
        Ok((new_page_index, new_page))
    }

    /// Cut the file down to `keep_pages` pages, dropping the cached tail.
    pub fn truncate_to(&self, keep_pages: u64) -> ClusterResult<()> {
        let page_count = self.page_count();
        {
            let mut pages = self.pages.lock().unwrap();
            for index in keep_pages..page_count {
                pages.remove(&index);
            }
        }
        let mut file_page_num = self.file_page_num.lock().unwrap();
        if *file_page_num > keep_pages {
            self.file
                .lock()
                .unwrap()
                .set_len(keep_pages * PAGE_SIZE_BYTES as u64)?;
            *file_page_num = keep_pages;
        }
        Ok(())
    }

    pub fn pin(&self, page_index: u64) {
        self.pages.lock().unwrap().pin(page_index);
    }

    pub fn flush(&self) -> ClusterResult<()> {
        if self.pages.lock().unwrap().is_empty() {
            return Ok(());
        };

        let max_page_index = match self.max_page_index() {
            Some(idx) => idx,
            None => return Ok(()),
        };

        let required_file_size = (max_page_index + 1) * PAGE_SIZE_BYTES as u64;
        let file_page_num = max_page_index + 1;

        let current_file_size = *self.file_page_num.lock().unwrap() * PAGE_SIZE_BYTES as u64;
        if current_file_size < required_file_size {
            self.file.lock().unwrap().set_len(required_file_size)?; // extend file (fills with zeros)
        }
        for (page_index, page_arc) in &self.pages.lock().unwrap().map {
            let mut page = page_arc.write().map_err(|_| {
                ClusterError::Storage("Poisoned RwLock in page cache".to_string())
            })?;
            if !page.need_flush {
                continue;
            }
            let offset = page_index * PAGE_SIZE_BYTES as u64;
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&page.data)?;
            page.need_flush = false;
        }
        self.file.lock().unwrap().sync_data()?; // ensure data is written to the disk
        *self.file_page_num.lock().unwrap() = file_page_num; // update pages number in the file
        Ok(())
    }

    /// Rename the backing file on disk.
    pub fn rename_to<P: AsRef<Path>>(&self, new_path: P) -> ClusterResult<()> {
        self.flush()?;
        let mut path = self.file_path.lock().unwrap();
        fs::rename(&*path, new_path.as_ref())?;
        *path = new_path.as_ref().to_path_buf();
        Ok(())
    }

    /// Atomically replace the file content with the content of `source`.
    /// The cached pages are dropped; `source` is consumed by the rename.
    pub fn replace_content_with<P: AsRef<Path>>(&self, source: P) -> ClusterResult<()> {
        let path = self.file_path.lock().unwrap().clone();
        self.pages.lock().unwrap().clear();
        fs::rename(source.as_ref(), &path)?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let new_page_num = file.metadata()?.len() / PAGE_SIZE_BYTES as u64;
        *self.file.lock().unwrap() = file;
        *self.file_page_num.lock().unwrap() = new_page_num;
        Ok(())
    }
}

/// Registry of the page files of one storage directory, keyed by a stable
/// caller supplied file id. The id to file name mapping is persisted so
/// crash recovery can resolve WAL entries before any cluster is opened.
pub struct PageCache {
    dir: PathBuf,
    files: RwLock<HashMap<u64, Arc<StorageManager>>>,
    names: Mutex<HashMap<u64, String>>,
}

impl PageCache {
    pub fn new<P: AsRef<Path>>(dir: P) -> ClusterResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let registry_path = dir.join(FILE_REGISTRY_NAME);
        let names = if registry_path.exists() {
            let raw = fs::read_to_string(&registry_path)?;
            serde_json::from_str(&raw)
                .map_err(|e| ClusterError::Storage(format!("invalid file registry: {}", e)))?
        } else {
            HashMap::new()
        };
        Ok(Self {
            dir,
            files: RwLock::new(HashMap::new()),
            names: Mutex::new(names),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist_registry(&self, names: &HashMap<u64, String>) -> ClusterResult<()> {
        let raw = serde_json::to_string_pretty(names)
            .map_err(|e| ClusterError::Storage(format!("cannot encode file registry: {}", e)))?;
        fs::write(self.dir.join(FILE_REGISTRY_NAME), raw)?;
        Ok(())
    }

    fn manager(&self, file_id: u64) -> ClusterResult<Arc<StorageManager>> {
        self.files
            .read()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| ClusterError::Storage(format!("file {} is not open", file_id)))
    }

    /// Create and register a new page file.
    pub fn add_file(&self, file_id: u64, file_name: &str) -> ClusterResult<()> {
        let mut files = self.files.write().unwrap();
        if files.contains_key(&file_id) {
            return Err(ClusterError::Storage(format!(
                "file id {} is already in use",
                file_id
            )));
        }
        let manager = StorageManager::create(self.dir.join(file_name))?;
        files.insert(file_id, Arc::new(manager));
        drop(files);
        let mut names = self.names.lock().unwrap();
        names.insert(file_id, file_name.to_string());
        self.persist_registry(&names)
    }

    /// Open an already existing page file under a stable id.
    pub fn open_file(&self, file_id: u64, file_name: &str) -> ClusterResult<()> {
        let mut files = self.files.write().unwrap();
        if files.contains_key(&file_id) {
            return Err(ClusterError::Storage(format!(
                "file id {} is already open",
                file_id
            )));
        }
        let manager = StorageManager::open(self.dir.join(file_name))?;
        files.insert(file_id, Arc::new(manager));
        drop(files);
        let mut names = self.names.lock().unwrap();
        if names.get(&file_id).map(String::as_str) != Some(file_name) {
            names.insert(file_id, file_name.to_string());
            self.persist_registry(&names)?;
        }
        Ok(())
    }

    /// Open a file whose name is known from the persisted registry.
    pub fn open_registered(&self, file_id: u64) -> ClusterResult<()> {
        let name = self.file_name(file_id)?;
        self.open_file(file_id, &name)
    }

    pub fn is_open(&self, file_id: u64) -> bool {
        self.files.read().unwrap().contains_key(&file_id)
    }

    pub fn file_name(&self, file_id: u64) -> ClusterResult<String> {
        self.names
            .lock()
            .unwrap()
            .get(&file_id)
            .cloned()
            .ok_or_else(|| ClusterError::Storage(format!("file {} is not registered", file_id)))
    }

    pub fn registered_files(&self) -> Vec<(u64, String)> {
        self.names
            .lock()
            .unwrap()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    pub fn close_file(&self, file_id: u64, flush: bool) -> ClusterResult<()> {
        let manager = {
            let mut files = self.files.write().unwrap();
            files.remove(&file_id)
        };
        if let Some(manager) = manager {
            if flush {
                manager.flush()?;
            }
        }
        Ok(())
    }

    pub fn delete_file(&self, file_id: u64) -> ClusterResult<()> {
        let manager = self.files.write().unwrap().remove(&file_id);
        let path = match manager {
            Some(manager) => manager.path(),
            None => {
                let name = self.file_name(file_id)?;
                self.dir.join(name)
            }
        };
        if path.exists() {
            fs::remove_file(path)?;
        }
        let mut names = self.names.lock().unwrap();
        names.remove(&file_id);
        self.persist_registry(&names)
    }

    pub fn rename_file(&self, file_id: u64, new_name: &str) -> ClusterResult<()> {
        let manager = self.manager(file_id)?;
        manager.rename_to(self.dir.join(new_name))?;
        let mut names = self.names.lock().unwrap();
        names.insert(file_id, new_name.to_string());
        self.persist_registry(&names)
    }

    pub fn replace_file_content_with(&self, file_id: u64, source: &Path) -> ClusterResult<()> {
        self.manager(file_id)?.replace_content_with(source)
    }

    pub fn load_page(&self, file_id: u64, page_index: u64) -> ClusterResult<Page> {
        self.manager(file_id)?.read_page(page_index)
    }

    /// Load a page and read ahead `prefetch` pages for sequential scans.
    pub fn load_page_prefetch(
        &self,
        file_id: u64,
        page_index: u64,
        prefetch: u64,
    ) -> ClusterResult<Page> {
        let manager = self.manager(file_id)?;
        if prefetch > 1 {
            manager.prefetch(page_index, prefetch)?;
        }
        manager.read_page(page_index)
    }

    /// Write a page bypassing the write ahead log. Only the atomic
    /// operation layer and recovery may call this.
    pub fn write_page_raw(&self, file_id: u64, page_index: u64, page: &Page) -> ClusterResult<()> {
        self.manager(file_id)?.write_page(page, page_index)
    }

    pub fn add_page_raw(&self, file_id: u64) -> ClusterResult<(u64, Page)> {
        self.manager(file_id)?.new_page()
    }

    pub fn truncate_file_raw(&self, file_id: u64, keep_pages: u64) -> ClusterResult<()> {
        self.manager(file_id)?.truncate_to(keep_pages)
    }

    pub fn filled_up_to(&self, file_id: u64) -> ClusterResult<u64> {
        Ok(self.manager(file_id)?.page_count())
    }

    pub fn pin(&self, file_id: u64, page_index: u64) -> ClusterResult<()> {
        self.manager(file_id)?.pin(page_index);
        Ok(())
    }

    pub fn flush_file(&self, file_id: u64) -> ClusterResult<()> {
        self.manager(file_id)?.flush()
    }

    pub fn flush_all(&self) -> ClusterResult<()> {
        let managers: Vec<Arc<StorageManager>> =
            self.files.read().unwrap().values().cloned().collect();
        for manager in managers {
            manager.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_dir;

    #[test]
    fn test_page_roundtrip_through_file() {
        let dir = test_dir("storage_roundtrip");
        let cache = PageCache::new(&dir).unwrap();
        cache.add_file(1, "a.pcl").unwrap();

        let (idx, mut page) = cache.add_page_raw(1).unwrap();
        assert_eq!(idx, 0);
        page.data[0..4].copy_from_slice(&[1, 2, 3, 4]);
        cache.write_page_raw(1, 0, &page).unwrap();
        cache.flush_file(1).unwrap();

        // reopen and read back from disk
        cache.close_file(1, true).unwrap();
        cache.open_file(1, "a.pcl").unwrap();
        let page = cache.load_page(1, 0).unwrap();
        assert_eq!(&page.data[0..4], &[1, 2, 3, 4]);
        assert_eq!(cache.filled_up_to(1).unwrap(), 1);
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = test_dir("storage_registry");
        {
            let cache = PageCache::new(&dir).unwrap();
            cache.add_file(7, "seven.pcl").unwrap();
        }
        let cache = PageCache::new(&dir).unwrap();
        assert_eq!(cache.file_name(7).unwrap(), "seven.pcl");
        cache.open_registered(7).unwrap();
        assert_eq!(cache.filled_up_to(7).unwrap(), 0);
    }

    #[test]
    fn test_truncate_drops_tail_pages() {
        let dir = test_dir("storage_truncate");
        let cache = PageCache::new(&dir).unwrap();
        cache.add_file(1, "t.pcl").unwrap();
        for _ in 0..3 {
            cache.add_page_raw(1).unwrap();
        }
        assert_eq!(cache.filled_up_to(1).unwrap(), 3);
        cache.truncate_file_raw(1, 1).unwrap();
        assert_eq!(cache.filled_up_to(1).unwrap(), 1);
        assert!(cache.load_page(1, 2).is_err());
    }

    #[test]
    fn test_replace_file_content() {
        let dir = test_dir("storage_replace");
        let cache = PageCache::new(&dir).unwrap();
        cache.add_file(1, "main.pcl").unwrap();
        let (_, mut page) = cache.add_page_raw(1).unwrap();
        page.data[0] = 0xAA;
        cache.write_page_raw(1, 0, &page).unwrap();
        cache.flush_file(1).unwrap();

        // build the replacement through a second registered file
        cache.add_file(2, "tmp.pcl").unwrap();
        let (_, mut page) = cache.add_page_raw(2).unwrap();
        page.data[0] = 0xBB;
        cache.write_page_raw(2, 0, &page).unwrap();
        cache.flush_file(2).unwrap();
        cache.close_file(2, true).unwrap();

        let tmp_path = dir.join("tmp.pcl");
        cache.replace_file_content_with(1, &tmp_path).unwrap();
        let page = cache.load_page(1, 0).unwrap();
        assert_eq!(page.data[0], 0xBB);
    }

    #[test]
    fn test_rename_file_keeps_content() {
        let dir = test_dir("storage_rename");
        let cache = PageCache::new(&dir).unwrap();
        cache.add_file(1, "old.pcl").unwrap();
        let (_, mut page) = cache.add_page_raw(1).unwrap();
        page.data[10] = 42;
        cache.write_page_raw(1, 0, &page).unwrap();

        cache.rename_file(1, "new.pcl").unwrap();
        assert!(dir.join("new.pcl").exists());
        assert!(!dir.join("old.pcl").exists());
        assert_eq!(cache.file_name(1).unwrap(), "new.pcl");
        assert_eq!(cache.load_page(1, 0).unwrap().data[10], 42);
    }
}
