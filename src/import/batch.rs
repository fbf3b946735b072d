//! 导入批次：把一次导入中创建的所有资源记录暂存起来，最后在一个事务里提交。
//!
//! 批次是显式传递的值，嵌套的 begin/commit 只做计数，最外层的 commit 才真正写库。

use crate::content::StorageKey;
use crate::resource::model::{NewResource, NodeId, ResourceError, ResourceNode};
use crate::resource::storage::ResourceRepository;
use log::{debug, error, info};
use std::collections::HashMap;

/// 批次内的暂存编号，提交前用来互相引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Existing(NodeId),
    Pending(PendingId),
}

impl NodeRef {
    /// 提交时把暂存编号换成真正的节点 id
    pub fn resolve(&self, ids: &HashMap<PendingId, NodeId>) -> Result<NodeId, ResourceError> {
        match self {
            NodeRef::Existing(id) => Ok(*id),
            NodeRef::Pending(pending) => ids.get(pending).copied().ok_or_else(|| {
                ResourceError::CommitFailure(format!("引用了尚未写入的记录 {:?}", pending))
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingResource {
    pub id: PendingId,
    pub parent: NodeRef,
    pub resource: NewResource,
    pub previous: Option<NodeRef>,
    pub next: Option<NodeRef>,
}

/// existing 原本是 parent 的最后一个子节点，提交时把它的 next 指向 first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailLink {
    pub parent: NodeId,
    pub existing: NodeId,
    pub first: PendingId,
}

/// 交给仓库一次性写入的内容。记录按暂存顺序排列，父节点总在子节点之前
#[derive(Debug, Clone, Default)]
pub struct StagedImport {
    pub records: Vec<PendingResource>,
    pub tail_links: Vec<TailLink>,
}

impl StagedImport {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.tail_links.is_empty()
    }

    /// 被追加子节点、但没有链尾记录的已有父节点
    pub fn untailed_parents(&self) -> Vec<NodeId> {
        let mut parents: Vec<NodeId> = self
            .records
            .iter()
            .filter_map(|r| match r.parent {
                NodeRef::Existing(id) => Some(id),
                NodeRef::Pending(_) => None,
            })
            .filter(|id| !self.tail_links.iter().any(|l| l.parent == *id))
            .collect();
        parents.sort_unstable();
        parents.dedup();
        parents
    }

    /// 所有被修改兄弟链的已有父节点
    pub fn existing_parents(&self) -> Vec<NodeId> {
        let mut parents: Vec<NodeId> = self
            .records
            .iter()
            .filter_map(|r| match r.parent {
                NodeRef::Existing(id) => Some(id),
                NodeRef::Pending(_) => None,
            })
            .chain(self.tail_links.iter().map(|l| l.parent))
            .collect();
        parents.sort_unstable();
        parents.dedup();
        parents
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Committed,
    Discarded,
}

#[derive(Debug)]
pub enum CommitOutcome {
    /// 嵌套的 commit，只减少计数
    Deferred,
    Flushed(CommittedBatch),
}

#[derive(Debug, Default)]
pub struct CommittedBatch {
    nodes: HashMap<PendingId, ResourceNode>,
}

impl CommittedBatch {
    pub fn node(&self, id: PendingId) -> Option<&ResourceNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 按给定顺序取出已提交的节点
    pub fn nodes_for(&self, ids: &[PendingId]) -> Result<Vec<ResourceNode>, ResourceError> {
        ids.iter()
            .map(|id| {
                self.nodes.get(id).cloned().ok_or_else(|| {
                    ResourceError::CommitFailure(format!("提交结果中缺少记录 {:?}", id))
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct ImportBatch {
    depth: u32,
    state: BatchState,
    staged: StagedImport,
    stored_keys: Vec<StorageKey>,
}

impl ImportBatch {
    /// 打开延迟写入窗口
    pub fn begin() -> Self {
        debug!("开始导入批次");
        Self {
            depth: 1,
            state: BatchState::Open,
            staged: StagedImport::default(),
            stored_keys: Vec::new(),
        }
    }

    pub fn begin_nested(&mut self) -> Result<(), ResourceError> {
        self.ensure_open()?;
        self.depth += 1;
        debug!("嵌套批次，当前层数: {}", self.depth);
        Ok(())
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.staged.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.records.is_empty()
    }

    pub fn record(&self, id: PendingId) -> Option<&PendingResource> {
        self.staged.records.get(id.0)
    }

    pub fn tail_links(&self) -> &[TailLink] {
        &self.staged.tail_links
    }

    /// 暂存一条记录，父节点可以是已存在的节点或本批次中更早暂存的目录
    pub fn stage(&mut self, parent: NodeRef, resource: NewResource) -> Result<PendingId, ResourceError> {
        self.ensure_open()?;

        if let NodeRef::Pending(pending) = parent {
            if pending.0 >= self.staged.records.len() {
                return Err(ResourceError::InvalidOperation(format!(
                    "父记录 {:?} 不在批次中",
                    pending
                )));
            }
        }

        let id = PendingId(self.staged.records.len());
        debug!("暂存资源 {:?}: {}", id, resource.name);
        self.staged.records.push(PendingResource {
            id,
            parent,
            resource,
            previous: None,
            next: None,
        });
        Ok(id)
    }

    /// 按给定顺序把同级记录串成链
    pub fn link_siblings(&mut self, ids: &[PendingId]) -> Result<(), ResourceError> {
        self.ensure_open()?;

        for pair in ids.windows(2) {
            let (current, following) = (pair[0], pair[1]);
            self.record_mut(current)?.next = Some(NodeRef::Pending(following));
            self.record_mut(following)?.previous = Some(NodeRef::Pending(current));
        }
        Ok(())
    }

    /// 把 first 接在父节点原有的最后一个子节点之后
    pub fn link_after(
        &mut self,
        parent: NodeId,
        existing: NodeId,
        first: PendingId,
    ) -> Result<(), ResourceError> {
        self.ensure_open()?;

        self.record_mut(first)?.previous = Some(NodeRef::Existing(existing));
        self.staged.tail_links.push(TailLink {
            parent,
            existing,
            first,
        });
        Ok(())
    }

    /// 记录本批次写入的物理文件，放弃批次时需要删除
    pub fn track_stored(&mut self, key: StorageKey) {
        self.stored_keys.push(key);
    }

    /// 关闭一层窗口，最外层才把全部记录交给仓库
    pub async fn commit<R>(&mut self, repository: &R) -> Result<CommitOutcome, ResourceError>
    where
        R: ResourceRepository + ?Sized,
    {
        self.ensure_open()?;

        if self.depth > 1 {
            self.depth -= 1;
            debug!("嵌套提交推迟，剩余层数: {}", self.depth);
            return Ok(CommitOutcome::Deferred);
        }

        let staged = std::mem::take(&mut self.staged);
        self.depth = 0;

        if staged.is_empty() {
            self.state = BatchState::Committed;
            return Ok(CommitOutcome::Flushed(CommittedBatch::default()));
        }

        let count = staged.records.len();
        match repository.commit(staged).await {
            Ok(nodes) => {
                self.state = BatchState::Committed;
                self.stored_keys.clear();
                info!("批次提交成功，共 {} 条记录", count);
                Ok(CommitOutcome::Flushed(CommittedBatch { nodes }))
            }
            Err(e) => {
                self.state = BatchState::Discarded;
                error!("批次提交失败: {}", e);
                Err(match e {
                    ResourceError::CommitFailure(msg) => ResourceError::CommitFailure(msg),
                    other => ResourceError::CommitFailure(other.to_string()),
                })
            }
        }
    }

    /// 丢弃暂存内容，返回需要清理的物理文件
    pub fn discard(&mut self) -> Vec<StorageKey> {
        debug!(
            "丢弃批次: {} 条记录, {} 个文件",
            self.staged.records.len(),
            self.stored_keys.len()
        );
        self.state = BatchState::Discarded;
        self.depth = 0;
        self.staged = StagedImport::default();
        std::mem::take(&mut self.stored_keys)
    }

    fn ensure_open(&self) -> Result<(), ResourceError> {
        if self.state != BatchState::Open {
            return Err(ResourceError::InvalidOperation(format!(
                "批次已关闭: {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn record_mut(&mut self, id: PendingId) -> Result<&mut PendingResource, ResourceError> {
        self.staged
            .records
            .get_mut(id.0)
            .ok_or_else(|| ResourceError::InvalidOperation(format!("记录 {:?} 不在批次中", id)))
    }
}
