use crate::content::StorageKey;
use crate::import::batch::{NodeRef, PendingId, StagedImport};
use crate::resource::model::{
    FileMeta, NewResource, NodeId, PermissionSet, ResourceError, ResourceKind, ResourceNode, WorkspaceId,
};
use crate::resource::storage::{order_siblings, ParentLock, ParentLocks, ResourceRepository};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: BTreeMap<NodeId, ResourceNode>,
    last_id: NodeId,
}

impl MemoryState {
    fn insert(&mut self, parent_id: Option<NodeId>, resource: NewResource) -> NodeId {
        self.last_id += 1;
        let now = Utc::now();
        let id = self.last_id;
        self.nodes.insert(
            id,
            ResourceNode {
                id,
                parent_id,
                workspace_id: resource.workspace_id,
                name: resource.name,
                mime_type: resource.mime_type,
                kind: resource.kind,
                owner_id: resource.owner_id,
                previous_id: None,
                next_id: None,
                permissions: resource.permissions,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut ResourceNode, ResourceError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| ResourceError::CommitFailure(format!("节点 {} 不存在", id)))
    }

    fn children_of(&self, parent: NodeId) -> impl Iterator<Item = &ResourceNode> {
        self.nodes
            .values()
            .filter(move |n| n.parent_id == Some(parent))
    }
}

/// 进程内的资源仓库，提交时先在副本上应用整批修改，成功后整体替换
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    locks: ParentLocks,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建工作区根目录
    pub fn create_root(
        &self,
        workspace_id: WorkspaceId,
        name: &str,
        owner_id: &str,
        permissions: PermissionSet,
    ) -> ResourceNode {
        let mut state = self.state();
        let id = state.insert(
            None,
            NewResource::directory(workspace_id, name, owner_id, permissions),
        );
        info!("创建根目录: {} ({})", name, id);
        state.nodes[&id].clone()
    }

    pub fn len(&self) -> usize {
        self.state().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().nodes.is_empty()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, staged: StagedImport) -> Result<HashMap<PendingId, ResourceNode>, ResourceError> {
        let mut state = self.state();
        let mut draft = state.clone();

        // 暂存时记下的链尾必须仍然是链尾
        for link in &staged.tail_links {
            let tail = draft.nodes.get(&link.existing).ok_or_else(|| {
                ResourceError::CommitFailure(format!("兄弟节点 {} 不存在", link.existing))
            })?;
            if tail.parent_id != Some(link.parent) || tail.next_id.is_some() {
                return Err(ResourceError::CommitFailure(format!(
                    "父节点 {} 的兄弟链已被修改",
                    link.parent
                )));
            }
        }

        // 没有链尾记录的父节点在暂存时是空目录，提交时也必须仍然为空
        for parent in staged.untailed_parents() {
            if draft.children_of(parent).next().is_some() {
                return Err(ResourceError::CommitFailure(format!(
                    "父节点 {} 在导入期间新增了子节点",
                    parent
                )));
            }
        }

        let mut ids: HashMap<PendingId, NodeId> = HashMap::new();
        for record in &staged.records {
            let parent_id = record.parent.resolve(&ids)?;
            match draft.nodes.get(&parent_id) {
                Some(parent) if parent.is_dir() => {}
                Some(_) => {
                    return Err(ResourceError::CommitFailure(format!(
                        "父节点 {} 不是目录",
                        parent_id
                    )))
                }
                None => {
                    return Err(ResourceError::CommitFailure(format!(
                        "父节点 {} 不存在",
                        parent_id
                    )))
                }
            }
            let id = draft.insert(Some(parent_id), record.resource.clone());
            ids.insert(record.id, id);
        }

        for record in &staged.records {
            let id = NodeRef::Pending(record.id).resolve(&ids)?;
            let previous = record.previous.map(|r| r.resolve(&ids)).transpose()?;
            let next = record.next.map(|r| r.resolve(&ids)).transpose()?;
            let node = draft.node_mut(id)?;
            node.previous_id = previous;
            node.next_id = next;
        }

        for link in &staged.tail_links {
            let first = NodeRef::Pending(link.first).resolve(&ids)?;
            let tail = draft.node_mut(link.existing)?;
            tail.next_id = Some(first);
            tail.updated_at = Utc::now();
        }

        let mut created = HashMap::with_capacity(ids.len());
        for (pending, id) in &ids {
            let node = draft.nodes.get(id).cloned().ok_or_else(|| {
                ResourceError::CommitFailure(format!("节点 {} 写入后丢失", id))
            })?;
            created.insert(*pending, node);
        }

        *state = draft;
        debug!("内存仓库提交 {} 个节点", created.len());
        Ok(created)
    }

    fn swap_content(
        &self,
        id: NodeId,
        meta: FileMeta,
        mime_type: String,
    ) -> Result<(ResourceNode, StorageKey), ResourceError> {
        let mut state = self.state();
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or_else(|| ResourceError::NotFound(format!("节点不存在: {}", id)))?;

        let old_key = match &mut node.kind {
            ResourceKind::File(current) => std::mem::replace(current, meta).storage_key,
            ResourceKind::Directory => {
                return Err(ResourceError::InvalidOperation(format!(
                    "{} 是目录",
                    node.name
                )))
            }
        };
        node.mime_type = Some(mime_type);
        node.updated_at = Utc::now();

        debug!("替换节点 {} 的内容，原存储键: {}", id, old_key);
        Ok((node.clone(), old_key))
    }

    fn remove(&self, id: NodeId) -> Result<Vec<StorageKey>, ResourceError> {
        let mut state = self.state();
        let node = state
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(format!("节点不存在: {}", id)))?;

        if node.parent_id.is_none() {
            return Err(ResourceError::InvalidOperation("不能删除根目录".to_string()));
        }

        // 把前后两个兄弟直接接起来
        if let Some(previous) = node.previous_id.and_then(|p| state.nodes.get_mut(&p)) {
            previous.next_id = node.next_id;
        }
        if let Some(next) = node.next_id.and_then(|n| state.nodes.get_mut(&n)) {
            next.previous_id = node.previous_id;
        }

        let mut keys = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if let Some(removed) = state.nodes.remove(&current) {
                if let ResourceKind::File(meta) = removed.kind {
                    keys.push(meta.storage_key);
                }
                pending.extend(state.children_of(current).map(|n| n.id));
            }
        }

        debug!("删除节点 {} 及其子树，涉及 {} 个文件", id, keys.len());
        Ok(keys)
    }
}

#[async_trait]
impl ResourceRepository for MemoryBackend {
    async fn get_node(&self, id: NodeId) -> Result<ResourceNode, ResourceError> {
        self.state()
            .nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(format!("节点不存在: {}", id)))
    }

    async fn list_children(&self, parent: NodeId) -> Result<Vec<ResourceNode>, ResourceError> {
        let children: Vec<ResourceNode> = self.state().children_of(parent).cloned().collect();
        Ok(order_siblings(children))
    }

    async fn find_last_sibling_of(
        &self,
        parent: NodeId,
    ) -> Result<Option<ResourceNode>, ResourceError> {
        let state = self.state();
        let mut tails = state.children_of(parent).filter(|n| n.next_id.is_none());
        let last = tails.next().cloned();
        if tails.next().is_some() {
            warn!("父节点 {} 下有多个链尾", parent);
        }
        Ok(last)
    }

    async fn lock_parent(&self, parent: NodeId) -> Result<ParentLock, ResourceError> {
        Ok(self.locks.acquire(parent).await)
    }

    async fn commit(
        &self,
        staged: StagedImport,
    ) -> Result<HashMap<PendingId, ResourceNode>, ResourceError> {
        self.apply(staged)
    }

    async fn replace_content(
        &self,
        id: NodeId,
        meta: FileMeta,
        mime_type: String,
    ) -> Result<(ResourceNode, StorageKey), ResourceError> {
        self.swap_content(id, meta, mime_type)
    }

    async fn delete(&self, id: NodeId) -> Result<Vec<StorageKey>, ResourceError> {
        self.remove(id)
    }
}
