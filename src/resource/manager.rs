use crate::content::key::extension_of;
use crate::content::ContentStore;
use crate::import::archive::ArchiveExtractor;
use crate::import::batch::{CommitOutcome, CommittedBatch, ImportBatch, NodeRef, PendingId};
use crate::import::importer::{attach_after_last_sibling, TreeImporter};
use crate::resource::mime::{MimeGuessResolver, MimeResolver};
use crate::resource::model::{
    FileMeta, NewResource, NodeId, ResourceError, ResourceNode, ResourceOp, User,
};
use crate::resource::operation::{FileOperation, OperationOutcome};
use crate::resource::permission::{InheritedPermissions, PermissionManager, PermissionResolver};
use crate::resource::storage::ResourceRepository;
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::Arc;

pub struct ResourceManager<R, S> {
    repository: R,
    content: S,
    extractor: ArchiveExtractor,
    mime: Arc<dyn MimeResolver>,
    permissions: Arc<dyn PermissionResolver>,
}

impl<R, S> ResourceManager<R, S>
where
    R: ResourceRepository,
    S: ContentStore,
{
    pub fn new(repository: R, content: S, extractor: ArchiveExtractor) -> Self {
        Self {
            repository,
            content,
            extractor,
            mime: Arc::new(MimeGuessResolver),
            permissions: Arc::new(InheritedPermissions),
        }
    }

    pub fn with_mime_resolver(mut self, mime: Arc<dyn MimeResolver>) -> Self {
        self.mime = mime;
        self
    }

    pub fn with_permission_resolver(mut self, permissions: Arc<dyn PermissionResolver>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn content(&self) -> &S {
        &self.content
    }

    pub fn extractor(&self) -> &ArchiveExtractor {
        &self.extractor
    }

    /// 解压压缩包并把其中的目录树导入到 parent_id 下，返回按顺序排列的顶层节点
    pub async fn import_archive(
        &self,
        archive_path: &Path,
        parent_id: NodeId,
        actor: &User,
    ) -> Result<Vec<ResourceNode>, ResourceError> {
        info!(
            "导入压缩包: {}, 目标目录: {}, 用户名: {}",
            archive_path.display(),
            parent_id,
            actor.username
        );

        let parent = self.target_directory(parent_id, actor).await?;
        let _lock = self.repository.lock_parent(parent.id).await?;

        let scratch = self.extractor.extract(archive_path).await?;
        let importer = TreeImporter::new(
            &self.repository,
            &self.content,
            self.mime.as_ref(),
            &actor.id,
            self.permissions.permissions_for(&parent),
        );

        let mut batch = ImportBatch::begin();
        let result = importer
            .import_directory(scratch.path(), &parent, &mut batch)
            .await;

        let scratch_path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!("清理临时目录 {} 失败: {}", scratch_path.display(), e);
        }

        let top_level = match result {
            Ok(ids) => ids,
            Err(e) => {
                error!("导入 {} 失败: {}", archive_path.display(), e);
                self.abort(&mut batch).await;
                return Err(e);
            }
        };

        let committed = self.flush(&mut batch).await?;
        let nodes = committed.nodes_for(&top_level)?;
        info!(
            "成功导入 {}，共 {} 个节点，顶层 {} 个",
            archive_path.display(),
            committed.len(),
            nodes.len()
        );
        Ok(nodes)
    }

    /// 上传单个文件；zip 文件且 uncompress 为 true 时按压缩包导入
    pub async fn create_file(
        &self,
        source_path: &Path,
        name: &str,
        parent_id: NodeId,
        actor: &User,
        uncompress: bool,
    ) -> Result<Vec<ResourceNode>, ResourceError> {
        let is_zip = extension_of(name).map_or(false, |ext| ext.eq_ignore_ascii_case("zip"));
        if uncompress && is_zip {
            debug!("{} 是压缩包，转为导入", name);
            return self.import_archive(source_path, parent_id, actor).await;
        }

        info!("创建文件: {}, 目标目录: {}, 用户名: {}", name, parent_id, actor.username);

        let parent = self.target_directory(parent_id, actor).await?;
        let _lock = self.repository.lock_parent(parent.id).await?;

        let mut batch = ImportBatch::begin();
        let staged = self
            .stage_upload(source_path, name, &parent, actor, &mut batch)
            .await;
        let id = match staged {
            Ok(id) => id,
            Err(e) => {
                self.abort(&mut batch).await;
                return Err(e);
            }
        };

        let committed = self.flush(&mut batch).await?;
        committed.nodes_for(&[id])
    }

    /// 以新的存储键复制文件到目标目录末尾
    pub async fn copy_file(
        &self,
        node_id: NodeId,
        target_parent_id: NodeId,
        actor: &User,
    ) -> Result<ResourceNode, ResourceError> {
        info!(
            "复制文件: {} -> 目录 {}, 用户名: {}",
            node_id, target_parent_id, actor.username
        );

        let source = self.repository.get_node(node_id).await?;
        PermissionManager::check(actor, &source, &ResourceOp::Read)?;
        if source.file_meta().is_none() {
            return Err(ResourceError::InvalidOperation(format!(
                "只能复制文件: {}",
                source.name
            )));
        }

        let parent = self.target_directory(target_parent_id, actor).await?;
        let _lock = self.repository.lock_parent(parent.id).await?;

        let mut batch = ImportBatch::begin();
        let id = match self.stage_copy(&source, &parent, actor, &mut batch).await {
            Ok(id) => id,
            Err(e) => {
                self.abort(&mut batch).await;
                return Err(e);
            }
        };

        let committed = self.flush(&mut batch).await?;
        committed
            .node(id)
            .cloned()
            .ok_or_else(|| ResourceError::CommitFailure(format!("复制结果缺少记录 {:?}", id)))
    }

    /// 用 source_path 的内容替换文件，节点位置和名称不变，旧的物理文件随后删除
    pub async fn update_file(
        &self,
        node_id: NodeId,
        source_path: &Path,
        actor: &User,
    ) -> Result<ResourceNode, ResourceError> {
        info!("更新文件: {}, 用户名: {}", node_id, actor.username);

        let node = self.repository.get_node(node_id).await?;
        if node.file_meta().is_none() {
            return Err(ResourceError::InvalidOperation(format!(
                "{} 是目录",
                node.name
            )));
        }
        PermissionManager::check(actor, &node, &ResourceOp::Update)?;

        let (storage_key, size) = self.content.store_file(source_path, &node.name).await?;
        let meta = FileMeta {
            size,
            storage_key: storage_key.clone(),
        };

        let (updated, old_key) = match self
            .repository
            .replace_content(node.id, meta, self.mime.guess(&node.name))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("更新文件 {} 失败: {}", node.name, e);
                if let Err(cleanup) = self.content.delete(&storage_key).await {
                    error!("清理文件 {} 失败: {}", storage_key, cleanup);
                }
                return Err(e);
            }
        };

        if let Err(e) = self.content.delete(&old_key).await {
            warn!("删除旧文件 {} 失败: {}", old_key, e);
        }

        info!("文件 {} 已更新，{} 字节", updated.name, size);
        Ok(updated)
    }

    /// 删除节点及其子树，返回清理的文件数。物理文件删除失败只记录日志
    pub async fn delete_node(&self, node_id: NodeId, actor: &User) -> Result<usize, ResourceError> {
        info!("删除节点: {}, 用户名: {}", node_id, actor.username);

        let node = self.repository.get_node(node_id).await?;
        let parent_id = node
            .parent_id
            .ok_or_else(|| ResourceError::InvalidOperation("不能删除根目录".to_string()))?;
        PermissionManager::check(actor, &node, &ResourceOp::Delete)?;

        let _lock = self.repository.lock_parent(parent_id).await?;
        let keys = self.repository.delete(node.id).await?;

        for key in &keys {
            if let Err(e) = self.content.delete(key).await {
                warn!("删除物理文件 {} 失败: {}", key, e);
            }
        }

        info!("成功删除节点 {}，清理 {} 个文件", node.name, keys.len());
        Ok(keys.len())
    }

    /// 读取文件内容
    pub async fn open_file(
        &self,
        node_id: NodeId,
        actor: &User,
    ) -> Result<(ResourceNode, Vec<u8>), ResourceError> {
        let node = self.repository.get_node(node_id).await?;
        PermissionManager::check(actor, &node, &ResourceOp::Read)?;

        let meta = node
            .file_meta()
            .ok_or_else(|| ResourceError::InvalidOperation(format!("{} 是目录", node.name)))?;
        let bytes = self.content.read(&meta.storage_key).await?;

        debug!("读取文件 {}，{} 字节", node.name, bytes.len());
        Ok((node, bytes))
    }

    /// 列出目录内容
    pub async fn list_dir(
        &self,
        parent_id: NodeId,
        actor: &User,
    ) -> Result<Vec<ResourceNode>, ResourceError> {
        let parent = self.repository.get_node(parent_id).await?;
        if !parent.is_dir() {
            return Err(ResourceError::InvalidOperation(format!(
                "{} 不是目录",
                parent.name
            )));
        }
        PermissionManager::check(actor, &parent, &ResourceOp::Read)?;

        self.repository.list_children(parent.id).await
    }

    /// 按操作类型分发
    pub async fn handle(
        &self,
        operation: FileOperation,
        actor: &User,
    ) -> Result<OperationOutcome, ResourceError> {
        debug!("处理操作 {}，用户名: {}", operation.name(), actor.username);

        match operation {
            FileOperation::Copy(copy) => {
                let node = self
                    .copy_file(copy.node_id, copy.target_parent_id, actor)
                    .await?;
                Ok(OperationOutcome::Copied { node })
            }
            FileOperation::Delete(delete) => {
                let removed_files = self.delete_node(delete.node_id, actor).await?;
                Ok(OperationOutcome::Deleted {
                    node_id: delete.node_id,
                    removed_files,
                })
            }
            FileOperation::List(list) => {
                let nodes = self.list_dir(list.parent_id, actor).await?;
                Ok(OperationOutcome::Listed { nodes })
            }
        }
    }

    async fn target_directory(
        &self,
        parent_id: NodeId,
        actor: &User,
    ) -> Result<ResourceNode, ResourceError> {
        let parent = self.repository.get_node(parent_id).await?;
        if !parent.is_dir() {
            return Err(ResourceError::InvalidOperation(format!(
                "目标 {} 不是目录",
                parent.name
            )));
        }
        PermissionManager::check(actor, &parent, &ResourceOp::Create)?;
        Ok(parent)
    }

    async fn stage_upload(
        &self,
        source_path: &Path,
        name: &str,
        parent: &ResourceNode,
        actor: &User,
        batch: &mut ImportBatch,
    ) -> Result<PendingId, ResourceError> {
        let (storage_key, size) = self.content.store_file(source_path, name).await?;
        batch.track_stored(storage_key.clone());

        let file = NewResource::file(
            parent.workspace_id,
            name,
            self.mime.guess(name),
            FileMeta { size, storage_key },
            &actor.id,
            self.permissions.permissions_for(parent),
        );
        let id = batch.stage(NodeRef::Existing(parent.id), file)?;
        attach_after_last_sibling(&self.repository, parent.id, id, batch).await?;
        Ok(id)
    }

    async fn stage_copy(
        &self,
        source: &ResourceNode,
        parent: &ResourceNode,
        actor: &User,
        batch: &mut ImportBatch,
    ) -> Result<PendingId, ResourceError> {
        let meta = source
            .file_meta()
            .ok_or_else(|| ResourceError::InvalidOperation(format!("只能复制文件: {}", source.name)))?;

        let storage_key = self.content.copy(&meta.storage_key).await?;
        batch.track_stored(storage_key.clone());

        let mime_type = source
            .mime_type
            .clone()
            .unwrap_or_else(|| self.mime.guess(&source.name));
        let file = NewResource::file(
            parent.workspace_id,
            &source.name,
            mime_type,
            FileMeta {
                size: meta.size,
                storage_key,
            },
            &actor.id,
            self.permissions.permissions_for(parent),
        );
        let id = batch.stage(NodeRef::Existing(parent.id), file)?;
        attach_after_last_sibling(&self.repository, parent.id, id, batch).await?;
        Ok(id)
    }

    async fn flush(&self, batch: &mut ImportBatch) -> Result<CommittedBatch, ResourceError> {
        match batch.commit(&self.repository).await {
            Ok(CommitOutcome::Flushed(committed)) => Ok(committed),
            Ok(CommitOutcome::Deferred) => Err(ResourceError::InvalidOperation(format!(
                "批次仍有 {} 层未关闭",
                batch.depth()
            ))),
            Err(e) => {
                self.abort(batch).await;
                Err(e)
            }
        }
    }

    /// 放弃批次并删除已经写入的物理文件
    async fn abort(&self, batch: &mut ImportBatch) {
        let keys = batch.discard();
        if keys.is_empty() {
            return;
        }

        warn!("批次已放弃，清理 {} 个已写入的文件", keys.len());
        for key in &keys {
            if let Err(e) = self.content.delete(key).await {
                error!("清理文件 {} 失败: {}", key, e);
            }
        }
    }
}
