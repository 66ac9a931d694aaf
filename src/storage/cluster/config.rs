use serde::{Deserialize, Serialize};

use crate::common::{ClusterError, ClusterResult};
use crate::storage::compression::NOTHING_COMPRESSION;
use crate::storage::conflict::ConflictStrategy;
use crate::storage::encryption::NOTHING_ENCRYPTION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Online,
    Offline,
}

impl ClusterStatus {
    pub fn name(&self) -> &'static str {
        match self {
            ClusterStatus::Online => "ONLINE",
            ClusterStatus::Offline => "OFFLINE",
        }
    }

    pub fn from_name(name: &str) -> ClusterResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "ONLINE" => Ok(ClusterStatus::Online),
            "OFFLINE" => Ok(ClusterStatus::Offline),
            other => Err(ClusterError::InvalidAttribute(format!(
                "unknown cluster status '{}'",
                other
            ))),
        }
    }
}

/// The persisted descriptor of one cluster. The embedding storage keeps
/// it in the root configuration; the cluster itself only reads and
/// updates the in-memory copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: u32,
    pub name: String,
    pub record_grow_factor: f32,
    pub record_overflow_grow_factor: f32,
    pub compression: String,
    pub encryption: String,
    pub encryption_key: Option<Vec<u8>>,
    pub conflict_strategy: String,
    pub status: ClusterStatus,
}

impl ClusterConfig {
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            record_grow_factor: 1.2,
            record_overflow_grow_factor: 1.2,
            compression: NOTHING_COMPRESSION.to_string(),
            encryption: NOTHING_ENCRYPTION.to_string(),
            encryption_key: None,
            conflict_strategy: ConflictStrategy::default().name().to_string(),
            status: ClusterStatus::Online,
        }
    }
}

/// The runtime-changeable attributes of `PaginatedCluster::set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAttribute {
    Name,
    RecordGrowFactor,
    RecordOverflowGrowFactor,
    ConflictStrategy,
    Status,
    Encryption,
}

impl ClusterAttribute {
    pub fn from_name(name: &str) -> ClusterResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "NAME" => Ok(ClusterAttribute::Name),
            "RECORD_GROW_FACTOR" => Ok(ClusterAttribute::RecordGrowFactor),
            "RECORD_OVERFLOW_GROW_FACTOR" => Ok(ClusterAttribute::RecordOverflowGrowFactor),
            "CONFLICTSTRATEGY" => Ok(ClusterAttribute::ConflictStrategy),
            "STATUS" => Ok(ClusterAttribute::Status),
            "ENCRYPTION" => Ok(ClusterAttribute::Encryption),
            other => Err(ClusterError::InvalidAttribute(format!(
                "runtime change of attribute '{}' is not supported",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_json_roundtrip() {
        let mut config = ClusterConfig::new(3, "accounts");
        config.encryption_key = Some(vec![1, 2, 3]);
        let raw = serde_json::to_string(&config).unwrap();
        let decoded: ClusterConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded.id, 3);
        assert_eq!(decoded.name, "accounts");
        assert_eq!(decoded.encryption_key, Some(vec![1, 2, 3]));
        assert_eq!(decoded.status, ClusterStatus::Online);
    }

    #[test]
    fn test_attribute_lookup() {
        assert_eq!(
            ClusterAttribute::from_name("conflictstrategy").unwrap(),
            ClusterAttribute::ConflictStrategy
        );
        assert!(ClusterAttribute::from_name("COMPRESSION").is_err());
    }
}
