use super::error::ClusterError;

pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
