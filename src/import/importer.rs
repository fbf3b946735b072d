use crate::content::ContentStore;
use crate::import::batch::{ImportBatch, NodeRef, PendingId};
use crate::resource::mime::MimeResolver;
use crate::resource::model::{
    FileMeta, NewResource, NodeId, PermissionSet, ResourceError, ResourceNode, WorkspaceId,
};
use crate::resource::storage::ResourceRepository;
use futures::future::{BoxFuture, FutureExt};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs;

enum EntryKind {
    File,
    Directory,
}

struct DirEntryInfo {
    name: String,
    path: PathBuf,
    kind: EntryKind,
}

/// 遍历解压后的目录树，为每个文件和目录暂存一条资源记录
pub struct TreeImporter<'a, R: ?Sized, S: ?Sized> {
    repository: &'a R,
    content: &'a S,
    mime: &'a dyn MimeResolver,
    owner_id: &'a str,
    permissions: PermissionSet,
}

impl<'a, R, S> TreeImporter<'a, R, S>
where
    R: ResourceRepository + ?Sized,
    S: ContentStore + ?Sized,
{
    pub fn new(
        repository: &'a R,
        content: &'a S,
        mime: &'a dyn MimeResolver,
        owner_id: &'a str,
        permissions: PermissionSet,
    ) -> Self {
        Self {
            repository,
            content,
            mime,
            owner_id,
            permissions,
        }
    }

    /// 导入 dir 下的全部内容到 parent，返回按名称排序的顶层记录
    pub async fn import_directory(
        &self,
        dir: &Path,
        parent: &ResourceNode,
        batch: &mut ImportBatch,
    ) -> Result<Vec<PendingId>, ResourceError> {
        let top_level = self
            .walk(
                dir.to_path_buf(),
                NodeRef::Existing(parent.id),
                parent.workspace_id,
                batch,
            )
            .await?;

        // 只有顶层需要接到父节点已有的兄弟链之后
        if let Some(first) = top_level.first() {
            attach_after_last_sibling(self.repository, parent.id, *first, batch).await?;
        }

        Ok(top_level)
    }

    fn walk<'b>(
        &'b self,
        dir: PathBuf,
        parent: NodeRef,
        workspace_id: WorkspaceId,
        batch: &'b mut ImportBatch,
    ) -> BoxFuture<'b, Result<Vec<PendingId>, ResourceError>> {
        async move {
            let entries = read_sorted_entries(&dir).await?;
            let mut created = Vec::with_capacity(entries.len());

            for entry in entries {
                match entry.kind {
                    EntryKind::File => {
                        let id = self.stage_file(&entry, parent, workspace_id, batch).await?;
                        created.push(id);
                    }
                    EntryKind::Directory => {
                        let directory = NewResource::directory(
                            workspace_id,
                            &entry.name,
                            self.owner_id,
                            self.permissions,
                        );
                        let id = batch.stage(parent, directory)?;
                        created.push(id);

                        // 子目录的内容只在子目录内部成链
                        self.walk(entry.path, NodeRef::Pending(id), workspace_id, batch)
                            .await?;
                    }
                }
            }

            batch.link_siblings(&created)?;
            debug!("目录 {} 暂存了 {} 个条目", dir.display(), created.len());
            Ok(created)
        }
        .boxed()
    }

    async fn stage_file(
        &self,
        entry: &DirEntryInfo,
        parent: NodeRef,
        workspace_id: WorkspaceId,
        batch: &mut ImportBatch,
    ) -> Result<PendingId, ResourceError> {
        let (storage_key, size) = self.content.store_file(&entry.path, &entry.name).await?;
        batch.track_stored(storage_key.clone());

        let file = NewResource::file(
            workspace_id,
            &entry.name,
            self.mime.guess(&entry.name),
            FileMeta { size, storage_key },
            self.owner_id,
            self.permissions,
        );
        batch.stage(parent, file)
    }
}

/// 把 first 接到 parent 当前最后一个子节点之后；父节点没有子节点时什么都不做
pub async fn attach_after_last_sibling<R>(
    repository: &R,
    parent: NodeId,
    first: PendingId,
    batch: &mut ImportBatch,
) -> Result<(), ResourceError>
where
    R: ResourceRepository + ?Sized,
{
    if let Some(last) = repository.find_last_sibling_of(parent).await? {
        debug!("新节点接在 {} ({}) 之后", last.name, last.id);
        batch.link_after(parent, last.id, first)?;
    }
    Ok(())
}

async fn read_sorted_entries(dir: &Path) -> Result<Vec<DirEntryInfo>, ResourceError> {
    let read_error = |e: std::io::Error| {
        ResourceError::ExtractionFailure(format!("读取目录 {} 失败: {}", dir.display(), e))
    };

    let mut reader = fs::read_dir(dir).await.map_err(read_error)?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await.map_err(read_error)? {
        let file_type = entry.file_type().await.map_err(read_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let kind = if file_type.is_file() {
            EntryKind::File
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else {
            warn!("跳过非常规文件: {}", entry.path().display());
            continue;
        };

        entries.push(DirEntryInfo {
            name,
            path: entry.path(),
            kind,
        });
    }

    // 不依赖操作系统的列目录顺序
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
