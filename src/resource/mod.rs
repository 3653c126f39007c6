pub mod backend;
pub mod local;
pub mod reboot;
pub mod store;
pub mod types;

pub use backend::{BackendCapabilities, BackendKind, ResourceTree, TreeSet};
pub use local::LocalTree;
pub use reboot::{FlushReport, PendingDeletion, RebootQueue};
pub use store::{ConfigStore, InstalledProgram, KeyAccess};
pub use types::{AttrValue, Attributes, NodeKind, ResourceNode};
