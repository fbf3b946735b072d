use crate::resource::model::{ResourceError, WorkspaceId, DEFAULT_DIR_PERM};
use log::{error, info};
use sqlx::PgPool;

pub const DEFAULT_WORKSPACE: WorkspaceId = 1;

pub struct DbInitializer {
    pool: PgPool,
}

impl DbInitializer {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 初始化资源节点表
    pub async fn init_resource_tables(&self) -> Result<(), ResourceError> {
        // previous_id / next_id 不加外键，批量写入时链接在插入之后才补上
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_nodes (
                id BIGSERIAL PRIMARY KEY,
                parent_id BIGINT REFERENCES resource_nodes(id) ON DELETE CASCADE,
                workspace_id BIGINT NOT NULL,
                name TEXT NOT NULL,
                mime_type VARCHAR,
                resource_type VARCHAR NOT NULL CHECK (resource_type IN ('directory', 'file')),
                size BIGINT,
                hash_name VARCHAR,
                owner_id VARCHAR NOT NULL,
                previous_id BIGINT,
                next_id BIGINT,
                permissions SMALLINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("创建资源表失败: {}", e)))?;

        // 创建索引
        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_resource_parent ON resource_nodes(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_resource_tail ON resource_nodes(parent_id) WHERE next_id IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_resource_workspace ON resource_nodes(workspace_id)",
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| ResourceError::RepositoryError(format!("创建索引失败: {}", e)))?;
        }

        Ok(())
    }

    /// 确保工作区根目录存在
    pub async fn init_workspace_root(&self, workspace_id: WorkspaceId) -> Result<(), ResourceError> {
        let root_exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM resource_nodes WHERE workspace_id = $1 AND parent_id IS NULL)",
        )
        .bind(workspace_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ResourceError::RepositoryError(format!("检查根目录失败: {}", e)))?;

        if !root_exists {
            // 创建根目录
            sqlx::query(
                r#"
                INSERT INTO resource_nodes (parent_id, workspace_id, name, resource_type, owner_id, permissions)
                VALUES (NULL, $1, '/', 'directory', 'system', $2)
                "#,
            )
            .bind(workspace_id)
            .bind(DEFAULT_DIR_PERM)
            .execute(&self.pool)
            .await
            .map_err(|e| ResourceError::RepositoryError(format!("创建根目录失败: {}", e)))?;
            info!("已创建工作区 {} 的根目录", workspace_id);
        }

        Ok(())
    }
}

/// 初始化所有数据库表
pub async fn initialize_db(pool: PgPool) -> Result<(), ResourceError> {
    info!("开始初始化数据库...");
    let initializer = DbInitializer::new(pool);

    initializer.init_resource_tables().await.map_err(|e| {
        error!("资源表初始化失败: {:?}", e);
        e
    })?;

    initializer
        .init_workspace_root(DEFAULT_WORKSPACE)
        .await
        .map_err(|e| {
            error!("根目录初始化失败: {:?}", e);
            e
        })?;

    info!("数据库初始化完成");
    Ok(())
}
