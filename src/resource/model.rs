use crate::content::StorageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type NodeId = i64;
pub type WorkspaceId = i64;

/// 资源树节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    pub id: NodeId,
    pub parent_id: Option<NodeId>,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub mime_type: Option<String>,
    pub kind: ResourceKind,
    pub owner_id: String,
    pub previous_id: Option<NodeId>,
    pub next_id: Option<NodeId>,
    pub permissions: PermissionSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, ResourceKind::Directory)
    }

    pub fn file_meta(&self) -> Option<&FileMeta> {
        match &self.kind {
            ResourceKind::File(meta) => Some(meta),
            ResourceKind::Directory => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceKind {
    Directory,
    File(FileMeta),
}

impl ResourceKind {
    /// 数据库中 resource_type 列的取值
    pub fn type_name(&self) -> &'static str {
        match self {
            ResourceKind::Directory => "directory",
            ResourceKind::File(_) => "file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub size: u64,
    pub storage_key: StorageKey,
}

/// 尚未持久化的资源记录
#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub mime_type: Option<String>,
    pub kind: ResourceKind,
    pub owner_id: String,
    pub permissions: PermissionSet,
}

impl NewResource {
    pub fn directory(
        workspace_id: WorkspaceId,
        name: &str,
        owner_id: &str,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            workspace_id,
            name: name.to_string(),
            mime_type: None,
            kind: ResourceKind::Directory,
            owner_id: owner_id.to_string(),
            permissions,
        }
    }

    pub fn file(
        workspace_id: WorkspaceId,
        name: &str,
        mime_type: String,
        meta: FileMeta,
        owner_id: &str,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            workspace_id,
            name: name.to_string(),
            mime_type: Some(mime_type),
            kind: ResourceKind::File(meta),
            owner_id: owner_id.to_string(),
            permissions,
        }
    }
}

/// Unix 模式 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(pub i16);

impl PermissionSet {
    pub fn owner(&self) -> i16 {
        (self.0 >> 6) & 0o7
    }

    pub fn other(&self) -> i16 {
        self.0 & 0o7
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        PermissionSet(DEFAULT_FILE_PERM)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Role {
    Admin,
    Author,
    Guest,
}

impl Role {
    pub fn parse(raw: &str) -> Role {
        match raw.to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "author" | "user" => Role::Author,
            _ => Role::Guest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ResourceOp {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("压缩包无法解析: {0}")]
    CorruptArchive(String),

    #[error("解压失败: {0}")]
    ExtractionFailure(String),

    #[error("存储错误: {0}")]
    StorageFailure(String),

    #[error("资源不存在: {0}")]
    NotFound(String),

    #[error("提交失败: {0}")]
    CommitFailure(String),

    #[error("权限错误: {0}")]
    PermissionError(String),

    #[error("无效操作: {0}")]
    InvalidOperation(String),

    #[error("数据库错误: {0}")]
    RepositoryError(String),
}

// 权限常量
pub const PERM_READ: i16 = 0o4;
pub const PERM_WRITE: i16 = 0o2;

// 默认权限
pub const DEFAULT_DIR_PERM: i16 = 0o755; // rwxr-xr-x
pub const DEFAULT_FILE_PERM: i16 = 0o644; // rw-r--r--
