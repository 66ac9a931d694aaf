mod wal;
pub use wal::Wal;

mod wal_entry;
pub use wal_entry::WalEntry;
