pub mod catalog;
pub mod error;
pub mod options;
pub mod path;
pub mod record;
pub mod resource;
pub mod status;

pub use catalog::{InMemoryResourceCatalog, ProvisionedDatabase, ResourceCatalog};
pub use error::TransferError;
pub use options::TransferOptions;
pub use path::{validate_path, PathKind};
pub use record::{DispatchPlan, NewTransfer, ResourceTransfer, TransferMode};
pub use resource::{ConnectionDescriptor, EnvVar, ResourceConfig, ResourceKind, VolumeDefinition};
pub use status::TransferStatus;
