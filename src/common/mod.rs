pub mod error;
pub use error::ClusterError;

pub mod result;
pub use result::ClusterResult;
