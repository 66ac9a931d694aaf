use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::common::{ClusterError, ClusterResult};
use crate::config::MAX_WAL_SIZE;

use super::wal_entry::WalEntry;

const HEADER_MAGIC: u32 = 0x554c4352; // 'RCLU' in little endian hex

/// Write-ahead log of one storage directory.
/// A thread safe structure to handle concurrent appends to the log file.
/// The log file structure:
/// [HEADER_MAGIC (4 bytes)][WalEntry 1(not fixed size)][WalEntry 2]...
pub struct Wal {
    path: PathBuf,
    log_file: Mutex<fs::File>,
    length: AtomicU64,
}

impl Wal {
    fn init_header(log_file: &mut fs::File) -> ClusterResult<()> {
        log_file.write_all(&HEADER_MAGIC.to_le_bytes())?;
        Ok(())
    }

    fn check_header(log_file: &mut fs::File) -> ClusterResult<()> {
        let mut header = [0u8; 4];
        log_file.read_exact(&mut header)?;
        let magic = u32::from_le_bytes(header);
        if magic != HEADER_MAGIC {
            return Err(ClusterError::Wal("Invalid WAL header".to_string()));
        }
        Ok(())
    }

    pub fn new<P: AsRef<Path>>(path: P) -> ClusterResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            // not exists, create new file with header
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&path)?;
            Self::init_header(&mut file)?;
        }
        let mut log_file = fs::OpenOptions::new().read(true).append(true).open(&path)?;
        // check if file head valid
        if let Err(err) = Self::check_header(&mut log_file) {
            // invalid header, re-initialize
            warn!("WAL header invalid: {}, re-initializing WAL file", err);
            drop(log_file);
            fs::remove_file(&path)?;
            let mut file = fs::File::create(&path)?;
            Self::init_header(&mut file)?;
            log_file = fs::OpenOptions::new().read(true).append(true).open(&path)?;
        }
        let length = log_file.metadata()?.len();
        Ok(Wal {
            path,
            log_file: Mutex::new(log_file),
            length: AtomicU64::new(length),
        })
    }

    /// Append one entry. Returns true when the log grew past its size
    /// budget and the caller should checkpoint.
    pub fn append(&self, entry: &WalEntry) -> ClusterResult<bool> {
        let entry_bytes = entry.to_bytes();
        let mut log_file = self.log_file.lock().unwrap();
        log_file.write_all(&entry_bytes)?;
        let new_length = self
            .length
            .fetch_add(entry_bytes.len() as u64, Ordering::SeqCst)
            + entry_bytes.len() as u64;
        Ok(new_length > MAX_WAL_SIZE)
    }

    pub fn flush(&self) -> ClusterResult<()> {
        let mut log_file = self.log_file.lock().unwrap();
        log_file.flush()?;
        log_file.sync_all()?;
        Ok(())
    }

    /// Decode every entry currently in the log.
    pub fn read_all(&self) -> ClusterResult<Vec<WalEntry>> {
        let mut file = self.log_file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        if buf.len() < 4 {
            return Ok(Vec::new());
        }
        Ok(WalEntry::from_bytes(&buf[4..]).collect())
    }

    /// Rewrite the log keeping only `entries`, through a temp file rename
    /// so a crash in between leaves one of the two consistent logs.
    pub fn rewrite(&self, entries: &[WalEntry]) -> ClusterResult<()> {
        let mut file = self.log_file.lock().unwrap();
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut new_log_file = fs::File::create(&tmp_path)?;
            Self::init_header(&mut new_log_file)?;
            for entry in entries {
                new_log_file.write_all(&entry.to_bytes())?;
            }
            new_log_file.flush()?;
            new_log_file.sync_all()?;
        }
        // THIS MUST BE AN ATOMIC OPERATION
        fs::rename(&tmp_path, &self.path)?;
        *file = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        self.length.store(file.metadata()?.len(), Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::test_dir;

    #[test]
    fn test_wal_append_and_read_back() {
        let dir = test_dir("wal_append");
        let wal = Wal::new(dir.join("test.wal")).unwrap();
        wal.append(&WalEntry::Begin { op_id: 1 }).unwrap();
        wal.append(&WalEntry::Commit { op_id: 1 }).unwrap();
        wal.flush().unwrap();

        let entries = wal.read_all().unwrap();
        assert_eq!(
            entries,
            vec![WalEntry::Begin { op_id: 1 }, WalEntry::Commit { op_id: 1 }]
        );
    }

    #[test]
    fn test_wal_survives_reopen() {
        let dir = test_dir("wal_reopen");
        let path = dir.join("test.wal");
        {
            let wal = Wal::new(&path).unwrap();
            wal.append(&WalEntry::Begin { op_id: 9 }).unwrap();
            wal.flush().unwrap();
        }
        let wal = Wal::new(&path).unwrap();
        assert_eq!(wal.read_all().unwrap(), vec![WalEntry::Begin { op_id: 9 }]);
    }

    #[test]
    fn test_wal_rewrite_compacts() {
        let dir = test_dir("wal_rewrite");
        let wal = Wal::new(dir.join("test.wal")).unwrap();
        for op_id in 1..=5 {
            wal.append(&WalEntry::Begin { op_id }).unwrap();
            wal.append(&WalEntry::Commit { op_id }).unwrap();
        }
        wal.rewrite(&[WalEntry::Begin { op_id: 6 }]).unwrap();
        assert_eq!(wal.read_all().unwrap(), vec![WalEntry::Begin { op_id: 6 }]);

        // appends keep working after the swap
        wal.append(&WalEntry::Commit { op_id: 6 }).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_wal_invalid_header_reinitialized() {
        let dir = test_dir("wal_badheader");
        let path = dir.join("test.wal");
        std::fs::write(&path, b"garbage").unwrap();
        let wal = Wal::new(&path).unwrap();
        assert!(wal.read_all().unwrap().is_empty());
    }
}
