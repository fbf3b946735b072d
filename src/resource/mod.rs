pub mod manager;
pub mod mime;
pub mod model;
pub mod operation;
pub mod permission;
pub mod storage;

pub use manager::ResourceManager;
pub use mime::{MimeGuessResolver, MimeResolver};
pub use model::{
    FileMeta, NewResource, NodeId, PermissionSet, ResourceError, ResourceKind, ResourceNode,
    ResourceOp, Role, User, WorkspaceId,
};
pub use operation::{FileOperation, OperationOutcome, UploadFile};
pub use permission::{InheritedPermissions, PermissionManager, PermissionResolver};
pub use storage::{MemoryBackend, PostgresBackend, ResourceRepository};
