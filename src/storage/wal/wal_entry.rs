use std::iter;

/// entries recorded in WAL
/// The bytes layout of one entry:
/// [total_size: u64][operation_type: u8][operation_data...][crc: u32]
#[derive(Debug, Clone, PartialEq)]
pub enum WalEntry {
    Begin {
        op_id: u64,
    },
    Commit {
        op_id: u64,
    },
    Rollback {
        op_id: u64,
    },
    UpdatePage {
        op_id: u64,
        file_id: u64,
        page_index: u64,
        offset: u64,
        old_data: Vec<u8>,
        new_data: Vec<u8>,
    },
    NewPage {
        op_id: u64,
        file_id: u64,
        page_index: u64, // the page index should always be the biggest one
    },
    TruncateFile {
        op_id: u64,
        file_id: u64,
        new_page_count: u64,
        old_pages: Vec<(u64, Vec<u8>)>, // cut off pages, for undo
    },
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend(&(data.len() as u64).to_le_bytes());
    buf.extend(data);
}

fn read_u64(buf: &[u8], offset: &mut usize) -> u64 {
    let value = u64::from_le_bytes(buf[*offset..*offset + 8].try_into().unwrap());
    *offset += 8;
    value
}

fn read_bytes(buf: &[u8], offset: &mut usize) -> Vec<u8> {
    let len = read_u64(buf, offset) as usize;
    let data = buf[*offset..*offset + len].to_vec();
    *offset += len;
    data
}

impl WalEntry {
    pub fn op_id(&self) -> u64 {
        match self {
            WalEntry::Begin { op_id }
            | WalEntry::Commit { op_id }
            | WalEntry::Rollback { op_id }
            | WalEntry::UpdatePage { op_id, .. }
            | WalEntry::NewPage { op_id, .. }
            | WalEntry::TruncateFile { op_id, .. } => *op_id,
        }
    }

    /// Serialize the WAL entry to bytes, crc last
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        // 1. total_size placeholder
        buf.extend(&0u64.to_le_bytes());
        // 2. operation
        match self {
            WalEntry::Begin { op_id } => {
                buf.push(0u8);
                buf.extend(&op_id.to_le_bytes());
            }
            WalEntry::Commit { op_id } => {
                buf.push(1u8);
                buf.extend(&op_id.to_le_bytes());
            }
            WalEntry::Rollback { op_id } => {
                buf.push(2u8);
                buf.extend(&op_id.to_le_bytes());
            }
            WalEntry::UpdatePage {
                op_id,
                file_id,
                page_index,
                offset,
                old_data,
                new_data,
            } => {
                buf.push(3u8);
                buf.extend(&op_id.to_le_bytes());
                buf.extend(&file_id.to_le_bytes());
                buf.extend(&page_index.to_le_bytes());
                buf.extend(&offset.to_le_bytes());
                put_bytes(&mut buf, old_data);
                put_bytes(&mut buf, new_data);
            }
            WalEntry::NewPage {
                op_id,
                file_id,
                page_index,
            } => {
                buf.push(4u8);
                buf.extend(&op_id.to_le_bytes());
                buf.extend(&file_id.to_le_bytes());
                buf.extend(&page_index.to_le_bytes());
            }
            WalEntry::TruncateFile {
                op_id,
                file_id,
                new_page_count,
                old_pages,
            } => {
                buf.push(5u8);
                buf.extend(&op_id.to_le_bytes());
                buf.extend(&file_id.to_le_bytes());
                buf.extend(&new_page_count.to_le_bytes());
                buf.extend(&(old_pages.len() as u64).to_le_bytes());
                for (page_index, data) in old_pages {
                    buf.extend(&page_index.to_le_bytes());
                    put_bytes(&mut buf, data);
                }
            }
        }
        // 3. append crc placeholder
        buf.extend(&0u32.to_le_bytes());
        // 4. calculate total size
        let total_size = buf.len() as u64;
        buf[0..8].copy_from_slice(&total_size.to_le_bytes());
        // 5. calculate crc
        let crc_begin = total_size as usize - 4;
        let crc = crc32fast::hash(&buf[..crc_begin]);
        buf[crc_begin..crc_begin + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// An iterator deserializing all WAL entries from a byte slice.
    /// Stops at the first truncated or corrupted entry.
    pub fn from_bytes(mut buf: &[u8]) -> impl Iterator<Item = Self> + '_ {
        iter::from_fn(move || {
            if buf.len() < 8 {
                return None;
            }
            let total_size =
                u64::from_le_bytes(buf[..8].try_into().unwrap()) as usize;
            if total_size < 13 || buf.len() < total_size {
                return None;
            }
            let entry_buf = &buf[..total_size];
            // verify crc
            let crc_index = total_size - 4;
            let expected_crc =
                u32::from_le_bytes(entry_buf[crc_index..].try_into().unwrap());
            let actual_crc = crc32fast::hash(&entry_buf[..crc_index]);
            if expected_crc != actual_crc {
                return None;
            }
            // parse entry
            let entry_type = entry_buf[8];
            let mut offset = 9;
            let entry = match entry_type {
                0 => WalEntry::Begin {
                    op_id: read_u64(entry_buf, &mut offset),
                },
                1 => WalEntry::Commit {
                    op_id: read_u64(entry_buf, &mut offset),
                },
                2 => WalEntry::Rollback {
                    op_id: read_u64(entry_buf, &mut offset),
                },
                3 => {
                    let op_id = read_u64(entry_buf, &mut offset);
                    let file_id = read_u64(entry_buf, &mut offset);
                    let page_index = read_u64(entry_buf, &mut offset);
                    let page_offset = read_u64(entry_buf, &mut offset);
                    let old_data = read_bytes(entry_buf, &mut offset);
                    let new_data = read_bytes(entry_buf, &mut offset);
                    WalEntry::UpdatePage {
                        op_id,
                        file_id,
                        page_index,
                        offset: page_offset,
                        old_data,
                        new_data,
                    }
                }
                4 => {
                    let op_id = read_u64(entry_buf, &mut offset);
                    let file_id = read_u64(entry_buf, &mut offset);
                    let page_index = read_u64(entry_buf, &mut offset);
                    WalEntry::NewPage {
                        op_id,
                        file_id,
                        page_index,
                    }
                }
                5 => {
                    let op_id = read_u64(entry_buf, &mut offset);
                    let file_id = read_u64(entry_buf, &mut offset);
                    let new_page_count = read_u64(entry_buf, &mut offset);
                    let pages = read_u64(entry_buf, &mut offset) as usize;
                    let mut old_pages = Vec::with_capacity(pages);
                    for _ in 0..pages {
                        let page_index = read_u64(entry_buf, &mut offset);
                        let data = read_bytes(entry_buf, &mut offset);
                        old_pages.push((page_index, data));
                    }
                    WalEntry::TruncateFile {
                        op_id,
                        file_id,
                        new_page_count,
                        old_pages,
                    }
                }
                _ => {
                    panic!("A crc-passed WAL entry has invalid entry type: {}", entry_type);
                }
            };
            // move buffer forward
            buf = &buf[total_size..];
            Some(entry)
        })
    }
}
