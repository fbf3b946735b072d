use crate::content::StorageKey;
use crate::import::batch::{PendingId, StagedImport};
use crate::resource::model::{FileMeta, NodeId, ResourceError, ResourceNode};
use async_trait::async_trait;
use log::warn;
use std::collections::HashMap;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResourceRepository: Send + Sync {
    /// 获取节点信息
    async fn get_node(&self, id: NodeId) -> Result<ResourceNode, ResourceError>;

    /// 按兄弟链顺序列出子节点
    async fn list_children(&self, parent: NodeId) -> Result<Vec<ResourceNode>, ResourceError>;

    /// 父节点下 next 为空的那个子节点
    async fn find_last_sibling_of(
        &self,
        parent: NodeId,
    ) -> Result<Option<ResourceNode>, ResourceError>;

    /// 独占父节点的兄弟链，调用方在整个导入期间持有
    async fn lock_parent(&self, parent: NodeId) -> Result<ParentLock, ResourceError>;

    /// 在一个事务内写入整批记录，返回按暂存编号索引的新节点
    async fn commit(
        &self,
        staged: StagedImport,
    ) -> Result<HashMap<PendingId, ResourceNode>, ResourceError>;

    /// 替换文件节点的内容，返回更新后的节点和被替换下来的存储键
    async fn replace_content(
        &self,
        id: NodeId,
        meta: FileMeta,
        mime_type: String,
    ) -> Result<(ResourceNode, StorageKey), ResourceError>;

    /// 删除节点及其子树并修复兄弟链，返回被删除文件的存储键
    async fn delete(&self, id: NodeId) -> Result<Vec<StorageKey>, ResourceError>;
}

/// 从链头沿 next 指针排列兄弟节点，断链的节点按 id 追加在末尾
pub fn order_siblings(nodes: Vec<ResourceNode>) -> Vec<ResourceNode> {
    let mut by_id: HashMap<NodeId, ResourceNode> = nodes.into_iter().map(|n| (n.id, n)).collect();
    let mut ordered = Vec::with_capacity(by_id.len());

    let mut cursor = by_id
        .values()
        .filter(|n| n.previous_id.is_none())
        .map(|n| n.id)
        .min();

    while let Some(id) = cursor {
        match by_id.remove(&id) {
            Some(node) => {
                cursor = node.next_id;
                ordered.push(node);
            }
            None => break,
        }
    }

    if !by_id.is_empty() {
        warn!("兄弟链不完整，{} 个节点不在链上", by_id.len());
        let mut rest: Vec<ResourceNode> = by_id.into_values().collect();
        rest.sort_by_key(|n| n.id);
        ordered.extend(rest);
    }

    ordered
}

pub mod lock;
pub mod memory;
pub mod postgres_backend;

pub use lock::{ParentLock, ParentLocks};
pub use memory::MemoryBackend;
pub use postgres_backend::PostgresBackend;
