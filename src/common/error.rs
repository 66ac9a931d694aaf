use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("WAL Error: {0}")]
    Wal(String),

    #[error("Error in cluster '{cluster}' during {operation}: {source}")]
    Cluster {
        cluster: String,
        operation: &'static str,
        #[source]
        source: Box<ClusterError>,
    },

    #[error("Record {position} not found")]
    RecordNotFound { position: u64 },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),
}
