pub mod backend;
pub mod diff;
pub mod keys;
pub mod reconciler;

pub use backend::{BackendClusterConfig, StorageBackend};
pub use reconciler::{MappingUpdate, Reconciler};
