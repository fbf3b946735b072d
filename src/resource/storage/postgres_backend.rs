use crate::content::StorageKey;
use crate::import::batch::{NodeRef, PendingId, StagedImport};
use crate::resource::model::{
    FileMeta, NodeId, PermissionSet, ResourceError, ResourceKind, ResourceNode, WorkspaceId,
};
use crate::resource::storage::{order_siblings, ParentLock, ParentLocks, ResourceRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;

const NODE_COLUMNS: &str = "id, parent_id, workspace_id, name, mime_type, resource_type, size, \
     hash_name, owner_id, previous_id, next_id, permissions, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    id: i64,
    parent_id: Option<i64>,
    workspace_id: i64,
    name: String,
    mime_type: Option<String>,
    resource_type: String,
    size: Option<i64>,
    hash_name: Option<String>,
    owner_id: String,
    previous_id: Option<i64>,
    next_id: Option<i64>,
    permissions: i16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl NodeRow {
    fn into_node(self) -> Result<ResourceNode, ResourceError> {
        let kind = match self.resource_type.as_str() {
            "directory" => ResourceKind::Directory,
            "file" => {
                let hash_name = self.hash_name.ok_or_else(|| {
                    ResourceError::RepositoryError(format!("文件节点 {} 缺少存储键", self.id))
                })?;
                let size = u64::try_from(self.size.unwrap_or(0)).map_err(|_| {
                    ResourceError::RepositoryError(format!("文件节点 {} 的大小无效", self.id))
                })?;
                ResourceKind::File(FileMeta {
                    size,
                    storage_key: StorageKey::parse(&hash_name)?,
                })
            }
            other => {
                return Err(ResourceError::RepositoryError(format!(
                    "未知的资源类型: {}",
                    other
                )))
            }
        };

        Ok(ResourceNode {
            id: self.id,
            parent_id: self.parent_id,
            workspace_id: self.workspace_id,
            name: self.name,
            mime_type: self.mime_type,
            kind,
            owner_id: self.owner_id,
            previous_id: self.previous_id,
            next_id: self.next_id,
            permissions: PermissionSet(self.permissions),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub struct PostgresBackend {
    pool: PgPool,
    locks: ParentLocks,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: ParentLocks::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 查找工作区根目录
    pub async fn find_root(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<ResourceNode>, ResourceError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {} FROM resource_nodes WHERE workspace_id = $1 AND parent_id IS NULL \
             ORDER BY id LIMIT 1",
            NODE_COLUMNS
        ))
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询根目录失败: {}", e)))?;

        row.map(NodeRow::into_node).transpose()
    }

    async fn fetch_nodes(
        tx: &mut Transaction<'_, Postgres>,
        ids: &[NodeId],
    ) -> Result<Vec<ResourceNode>, ResourceError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {} FROM resource_nodes WHERE id = ANY($1)",
            NODE_COLUMNS
        ))
        .bind(ids.to_vec())
        .fetch_all(tx)
        .await
        .map_err(|e| ResourceError::CommitFailure(format!("读取新节点失败: {}", e)))?;

        rows.into_iter().map(NodeRow::into_node).collect()
    }

    /// 事务级咨询锁，事务结束时自动释放
    async fn lock_chain(
        tx: &mut Transaction<'_, Postgres>,
        parent: NodeId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(parent)
            .execute(tx)
            .await?;
        Ok(())
    }

    /// 锁定节点行并读取它的前后兄弟；等锁期间节点被移动或删除时报错
    async fn lock_links(
        tx: &mut Transaction<'_, Postgres>,
        id: NodeId,
        parent_id: NodeId,
    ) -> Result<(Option<NodeId>, Option<NodeId>), ResourceError> {
        let row: Option<(Option<i64>, Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT parent_id, previous_id, next_id FROM resource_nodes WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("锁定节点失败: {}", e)))?;

        match row {
            Some((Some(parent), previous_id, next_id)) if parent == parent_id => {
                Ok((previous_id, next_id))
            }
            Some(_) => Err(ResourceError::RepositoryError(format!(
                "节点 {} 在等待锁期间被移动",
                id
            ))),
            None => Err(ResourceError::NotFound(format!("节点不存在: {}", id))),
        }
    }

    async fn verify_chain(
        tx: &mut Transaction<'_, Postgres>,
        staged: &StagedImport,
    ) -> Result<(), ResourceError> {
        for parent in staged.existing_parents() {
            Self::lock_chain(tx, parent)
                .await
                .map_err(|e| ResourceError::CommitFailure(format!("锁定父节点失败: {}", e)))?;
        }

        for link in &staged.tail_links {
            let tail: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
                "SELECT parent_id, next_id FROM resource_nodes WHERE id = $1 FOR UPDATE",
            )
            .bind(link.existing)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ResourceError::CommitFailure(format!("检查兄弟链失败: {}", e)))?;

            match tail {
                Some((Some(parent), None)) if parent == link.parent => {}
                _ => {
                    return Err(ResourceError::CommitFailure(format!(
                        "父节点 {} 的兄弟链已被修改",
                        link.parent
                    )))
                }
            }
        }

        for parent in staged.untailed_parents() {
            let has_children: bool = sqlx::query_scalar(
                "SELECT EXISTS(SELECT 1 FROM resource_nodes WHERE parent_id = $1)",
            )
            .bind(parent)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| ResourceError::CommitFailure(format!("检查父节点失败: {}", e)))?;

            if has_children {
                return Err(ResourceError::CommitFailure(format!(
                    "父节点 {} 在导入期间新增了子节点",
                    parent
                )));
            }
        }

        Ok(())
    }

    async fn write_staged(
        tx: &mut Transaction<'_, Postgres>,
        staged: &StagedImport,
    ) -> Result<HashMap<PendingId, NodeId>, ResourceError> {
        let mut ids: HashMap<PendingId, NodeId> = HashMap::with_capacity(staged.records.len());

        for record in &staged.records {
            let parent_id = record.parent.resolve(&ids)?;
            let resource = &record.resource;
            let (size, hash_name) = match &resource.kind {
                ResourceKind::Directory => (None, None),
                ResourceKind::File(meta) => {
                    let size = i64::try_from(meta.size).map_err(|_| {
                        ResourceError::CommitFailure(format!("文件过大: {}", resource.name))
                    })?;
                    (Some(size), Some(meta.storage_key.as_str().to_string()))
                }
            };

            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO resource_nodes
                    (parent_id, workspace_id, name, mime_type, resource_type, size, hash_name, owner_id, permissions)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING id
                "#,
            )
            .bind(parent_id)
            .bind(resource.workspace_id)
            .bind(&resource.name)
            .bind(&resource.mime_type)
            .bind(resource.kind.type_name())
            .bind(size)
            .bind(hash_name)
            .bind(&resource.owner_id)
            .bind(resource.permissions.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                ResourceError::CommitFailure(format!("写入资源 {} 失败: {}", resource.name, e))
            })?;

            ids.insert(record.id, id);
        }

        for record in &staged.records {
            let id = NodeRef::Pending(record.id).resolve(&ids)?;
            let previous = record.previous.map(|r| r.resolve(&ids)).transpose()?;
            let next = record.next.map(|r| r.resolve(&ids)).transpose()?;

            if previous.is_none() && next.is_none() {
                continue;
            }

            sqlx::query("UPDATE resource_nodes SET previous_id = $1, next_id = $2 WHERE id = $3")
                .bind(previous)
                .bind(next)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ResourceError::CommitFailure(format!("更新兄弟链失败: {}", e)))?;
        }

        for link in &staged.tail_links {
            let first = NodeRef::Pending(link.first).resolve(&ids)?;
            sqlx::query("UPDATE resource_nodes SET next_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(first)
                .bind(link.existing)
                .execute(&mut *tx)
                .await
                .map_err(|e| ResourceError::CommitFailure(format!("连接原有链尾失败: {}", e)))?;
        }

        Ok(ids)
    }
}

#[async_trait]
impl ResourceRepository for PostgresBackend {
    async fn get_node(&self, id: NodeId) -> Result<ResourceNode, ResourceError> {
        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {} FROM resource_nodes WHERE id = $1",
            NODE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询节点失败: {}", e)))?;

        match row {
            Some(row) => row.into_node(),
            None => Err(ResourceError::NotFound(format!("节点不存在: {}", id))),
        }
    }

    async fn list_children(&self, parent: NodeId) -> Result<Vec<ResourceNode>, ResourceError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {} FROM resource_nodes WHERE parent_id = $1",
            NODE_COLUMNS
        ))
        .bind(parent)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询子节点失败: {}", e)))?;

        let nodes = rows
            .into_iter()
            .map(NodeRow::into_node)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(order_siblings(nodes))
    }

    async fn find_last_sibling_of(
        &self,
        parent: NodeId,
    ) -> Result<Option<ResourceNode>, ResourceError> {
        let rows = sqlx::query_as::<_, NodeRow>(&format!(
            "SELECT {} FROM resource_nodes WHERE parent_id = $1 AND next_id IS NULL \
             ORDER BY id DESC LIMIT 2",
            NODE_COLUMNS
        ))
        .bind(parent)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询链尾失败: {}", e)))?;

        if rows.len() > 1 {
            warn!("父节点 {} 下有多个链尾", parent);
        }
        rows.into_iter().next().map(NodeRow::into_node).transpose()
    }

    async fn lock_parent(&self, parent: NodeId) -> Result<ParentLock, ResourceError> {
        Ok(self.locks.acquire(parent).await)
    }

    async fn commit(
        &self,
        staged: StagedImport,
    ) -> Result<HashMap<PendingId, ResourceNode>, ResourceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResourceError::CommitFailure(format!("开启事务失败: {}", e)))?;

        Self::verify_chain(&mut tx, &staged).await?;
        let ids = Self::write_staged(&mut tx, &staged).await?;

        let node_ids: Vec<NodeId> = ids.values().copied().collect();
        let mut by_id: HashMap<NodeId, ResourceNode> = Self::fetch_nodes(&mut tx, &node_ids)
            .await?
            .into_iter()
            .map(|n| (n.id, n))
            .collect();

        tx.commit().await.map_err(|e| {
            error!("提交事务失败: {}", e);
            ResourceError::CommitFailure(format!("提交事务失败: {}", e))
        })?;

        let mut created = HashMap::with_capacity(ids.len());
        for (pending, id) in ids {
            let node = by_id.remove(&id).ok_or_else(|| {
                ResourceError::CommitFailure(format!("节点 {} 写入后丢失", id))
            })?;
            created.insert(pending, node);
        }

        info!("写入 {} 个资源节点", created.len());
        Ok(created)
    }

    async fn replace_content(
        &self,
        id: NodeId,
        meta: FileMeta,
        mime_type: String,
    ) -> Result<(ResourceNode, StorageKey), ResourceError> {
        let size = i64::try_from(meta.size)
            .map_err(|_| ResourceError::InvalidOperation(format!("文件过大: {} 字节", meta.size)))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("开启事务失败: {}", e)))?;

        let current: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT resource_type, hash_name FROM resource_nodes WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut tx)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询节点失败: {}", e)))?;

        let old_key = match current {
            Some((resource_type, Some(hash_name))) if resource_type == "file" => {
                StorageKey::parse(&hash_name)?
            }
            Some(_) => {
                return Err(ResourceError::InvalidOperation(format!(
                    "节点 {} 不是文件",
                    id
                )))
            }
            None => return Err(ResourceError::NotFound(format!("节点不存在: {}", id))),
        };

        let row = sqlx::query_as::<_, NodeRow>(&format!(
            "UPDATE resource_nodes SET size = $1, hash_name = $2, mime_type = $3, updated_at = NOW() \
             WHERE id = $4 RETURNING {}",
            NODE_COLUMNS
        ))
        .bind(size)
        .bind(meta.storage_key.as_str())
        .bind(&mime_type)
        .bind(id)
        .fetch_one(&mut tx)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("更新文件 {} 失败: {}", id, e)))?;

        tx.commit()
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("提交事务失败: {}", e)))?;

        debug!("节点 {} 的内容已替换，原存储键: {}", id, old_key);
        Ok((row.into_node()?, old_key))
    }

    async fn delete(&self, id: NodeId) -> Result<Vec<StorageKey>, ResourceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("开启事务失败: {}", e)))?;

        let parent_id: Option<Option<i64>> =
            sqlx::query_scalar("SELECT parent_id FROM resource_nodes WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut tx)
                .await
                .map_err(|e| ResourceError::RepositoryError(format!("查询节点失败: {}", e)))?;

        let parent_id = parent_id
            .ok_or_else(|| ResourceError::NotFound(format!("节点不存在: {}", id)))?
            .ok_or_else(|| ResourceError::InvalidOperation("不能删除根目录".to_string()))?;

        // 持有父节点的咨询锁之后才能读取前后兄弟
        Self::lock_chain(&mut tx, parent_id)
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("锁定父节点失败: {}", e)))?;

        let (previous_id, next_id) = Self::lock_links(&mut tx, id, parent_id).await?;

        let hash_names: Vec<String> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE subtree AS (
                SELECT id, hash_name FROM resource_nodes WHERE id = $1
                UNION ALL
                SELECT c.id, c.hash_name FROM resource_nodes c JOIN subtree s ON c.parent_id = s.id
            )
            SELECT hash_name FROM subtree WHERE hash_name IS NOT NULL
            "#,
        )
        .bind(id)
        .fetch_all(&mut tx)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("查询子树失败: {}", e)))?;

        // 把前后两个兄弟直接接起来
        if let Some(previous) = previous_id {
            sqlx::query("UPDATE resource_nodes SET next_id = $1, updated_at = NOW() WHERE id = $2")
                .bind(next_id)
                .bind(previous)
                .execute(&mut tx)
                .await
                .map_err(|e| ResourceError::RepositoryError(format!("修复兄弟链失败: {}", e)))?;
        }
        if let Some(next) = next_id {
            sqlx::query(
                "UPDATE resource_nodes SET previous_id = $1, updated_at = NOW() WHERE id = $2",
            )
            .bind(previous_id)
            .bind(next)
            .execute(&mut tx)
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("修复兄弟链失败: {}", e)))?;
        }

        // 子树由 parent_id 的级联删除带走
        sqlx::query("DELETE FROM resource_nodes WHERE id = $1")
            .bind(id)
            .execute(&mut tx)
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("删除节点失败: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("提交事务失败: {}", e)))?;

        debug!("删除节点 {}，涉及 {} 个文件", id, hash_names.len());
        hash_names
            .iter()
            .map(|name| StorageKey::parse(name))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbInitializer;
    use crate::resource::model::DEFAULT_DIR_PERM;
    use sqlx::postgres::PgPoolOptions;
    use std::time::Duration;

    async fn connect() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL 未设置");
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .unwrap();
        DbInitializer::new(pool.clone())
            .init_resource_tables()
            .await
            .unwrap();
        pool
    }

    async fn insert_dir(pool: &PgPool, workspace: WorkspaceId, parent: Option<NodeId>, name: &str) -> NodeId {
        sqlx::query_scalar(
            "INSERT INTO resource_nodes (parent_id, workspace_id, name, resource_type, owner_id, permissions) \
             VALUES ($1, $2, $3, 'directory', 'owner', $4) RETURNING id",
        )
        .bind(parent)
        .bind(workspace)
        .bind(name)
        .bind(DEFAULT_DIR_PERM)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore = "需要 DATABASE_URL 指向可写的 Postgres"]
    async fn delete_waits_for_concurrent_append_before_relinking() {
        let pool = connect().await;
        let workspace = Utc::now().timestamp_micros();
        let root = insert_dir(&pool, workspace, None, "/").await;
        let a = insert_dir(&pool, workspace, Some(root), "a").await;
        let tail = insert_dir(&pool, workspace, Some(root), "tail").await;
        sqlx::query("UPDATE resource_nodes SET next_id = $1 WHERE id = $2")
            .bind(tail)
            .bind(a)
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("UPDATE resource_nodes SET previous_id = $1 WHERE id = $2")
            .bind(a)
            .bind(tail)
            .execute(&pool)
            .await
            .unwrap();

        // 另一个连接持有父节点的锁，在 tail 之后追加 n 但尚未提交
        let mut appender = pool.begin().await.unwrap();
        PostgresBackend::lock_chain(&mut appender, root).await.unwrap();
        let n: NodeId = sqlx::query_scalar(
            "INSERT INTO resource_nodes (parent_id, workspace_id, name, resource_type, owner_id, permissions, previous_id) \
             VALUES ($1, $2, 'n', 'directory', 'owner', $3, $4) RETURNING id",
        )
        .bind(root)
        .bind(workspace)
        .bind(DEFAULT_DIR_PERM)
        .bind(tail)
        .fetch_one(&mut appender)
        .await
        .unwrap();
        sqlx::query("UPDATE resource_nodes SET next_id = $1 WHERE id = $2")
            .bind(n)
            .bind(tail)
            .execute(&mut appender)
            .await
            .unwrap();

        let backend = PostgresBackend::new(pool.clone());
        let deleting = tokio::spawn(async move { backend.delete(tail).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        appender.commit().await.unwrap();
        deleting.await.unwrap().unwrap();

        let children = PostgresBackend::new(pool.clone())
            .list_children(root)
            .await
            .unwrap();
        let ids: Vec<NodeId> = children.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![a, n]);
        assert_eq!(children[0].next_id, Some(n));
        assert_eq!(children[1].previous_id, Some(a));
        assert_eq!(children[1].next_id, None);

        sqlx::query("DELETE FROM resource_nodes WHERE id = $1")
            .bind(root)
            .execute(&pool)
            .await
            .unwrap();
    }
}
