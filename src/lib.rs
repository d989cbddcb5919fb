pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod registry;
pub mod server;
pub mod storage;
pub mod sync;

pub use config::SyncerConfig;
pub use error::{SyncError, SyncResult};
pub use model::{InstanceRecord, InstanceStatus, MappingEntry, ServiceRecord, Snapshot};
pub use registry::{FileRegistry, MemoryRegistry, RegistrySource};
pub use server::{configure_cluster, Server};
pub use storage::{BackendClusterConfig, Reconciler};
