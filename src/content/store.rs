use crate::content::key::{extension_of, StorageKey};
use crate::resource::model::ResourceError;
use async_trait::async_trait;
use chrono::Local;
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

// 存储键冲突时最多重新生成的次数
const MAX_KEY_ATTEMPTS: usize = 8;

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// 写入字节并返回新的存储键
    async fn store(&self, bytes: &[u8], original_name: &str) -> Result<StorageKey, ResourceError>;

    /// 以新的键复制已有内容，保留扩展名
    async fn copy(&self, key: &StorageKey) -> Result<StorageKey, ResourceError>;

    /// 删除物理文件，键不存在时不报错
    async fn delete(&self, key: &StorageKey) -> Result<(), ResourceError>;

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, ResourceError>;

    async fn exists(&self, key: &StorageKey) -> Result<bool, ResourceError>;

    /// 把磁盘上的文件写入存储，返回存储键和字节数
    async fn store_file(
        &self,
        source: &Path,
        original_name: &str,
    ) -> Result<(StorageKey, u64), ResourceError>;
}

/// 按日期分桶的本地文件系统存储
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ResourceError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            ResourceError::StorageFailure(format!("无法创建存储目录 {}: {}", root.display(), e))
        })?;
        info!("文件存储目录: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn today_bucket() -> String {
        Local::now().format("%Y-%m-%d").to_string()
    }

    /// 在当天的分桶中占用一个全新的键，create_new 保证不会覆盖已有文件
    async fn reserve(&self, extension: Option<&str>) -> Result<(StorageKey, File), ResourceError> {
        let bucket = Self::today_bucket();
        let dir = self.root.join(&bucket);

        for _ in 0..MAX_KEY_ATTEMPTS {
            fs::create_dir_all(&dir).await.map_err(|e| {
                ResourceError::StorageFailure(format!("无法创建分桶目录 {}: {}", dir.display(), e))
            })?;

            let key = StorageKey::generate(&bucket, extension);
            let path = self.path_of(&key);
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((key, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("存储键冲突，重新生成: {}", key);
                }
                // 分桶目录可能刚被并发的删除操作移除
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!("分桶目录已不存在，重新创建: {}", dir.display());
                }
                Err(e) => {
                    return Err(ResourceError::StorageFailure(format!(
                        "无法创建文件 {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        Err(ResourceError::StorageFailure(format!(
            "连续 {} 次无法分配存储键",
            MAX_KEY_ATTEMPTS
        )))
    }

    async fn discard_partial(&self, key: &StorageKey) {
        if let Err(e) = fs::remove_file(self.path_of(key)).await {
            warn!("清理未写完的文件 {} 失败: {}", key, e);
        }
    }

    /// 分桶目录为空时一并删除
    async fn remove_empty_bucket(&self, key: &StorageKey) {
        let Some(bucket) = key.bucket() else {
            return;
        };
        let dir = self.root.join(bucket);

        let is_empty = match fs::read_dir(&dir).await {
            Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
            Err(_) => false,
        };

        if is_empty {
            match fs::remove_dir(&dir).await {
                Ok(()) => debug!("删除空的分桶目录: {}", dir.display()),
                Err(e) => debug!("分桶目录 {} 未删除: {}", dir.display(), e),
            }
        }
    }
}

async fn write_synced(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn copy_synced(source: &mut File, target: &mut File) -> io::Result<u64> {
    let written = tokio::io::copy(source, target).await?;
    target.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl ContentStore for FsContentStore {
    async fn store(&self, bytes: &[u8], original_name: &str) -> Result<StorageKey, ResourceError> {
        let (key, mut file) = self.reserve(extension_of(original_name)).await?;

        if let Err(e) = write_synced(&mut file, bytes).await {
            self.discard_partial(&key).await;
            return Err(ResourceError::StorageFailure(format!(
                "写入 {} 失败: {}",
                key, e
            )));
        }

        debug!("存储文件 {} -> {} ({} 字节)", original_name, key, bytes.len());
        Ok(key)
    }

    async fn copy(&self, key: &StorageKey) -> Result<StorageKey, ResourceError> {
        let source_path = self.path_of(key);
        let mut source = File::open(&source_path).await.map_err(|e| {
            ResourceError::StorageFailure(format!("源文件 {} 无法打开: {}", key, e))
        })?;

        let (new_key, mut target) = self.reserve(key.extension()).await?;

        if let Err(e) = copy_synced(&mut source, &mut target).await {
            self.discard_partial(&new_key).await;
            return Err(ResourceError::StorageFailure(format!(
                "复制 {} 失败: {}",
                key, e
            )));
        }

        debug!("复制文件 {} -> {}", key, new_key);
        Ok(new_key)
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), ResourceError> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => debug!("删除文件: {}", key),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("文件已不存在，跳过删除: {}", key);
            }
            Err(e) => {
                return Err(ResourceError::StorageFailure(format!(
                    "删除 {} 失败: {}",
                    key, e
                )))
            }
        }

        self.remove_empty_bucket(key).await;
        Ok(())
    }

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, ResourceError> {
        match fs::read(self.path_of(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ResourceError::NotFound(format!("存储键不存在: {}", key)))
            }
            Err(e) => Err(ResourceError::StorageFailure(format!(
                "读取 {} 失败: {}",
                key, e
            ))),
        }
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, ResourceError> {
        fs::try_exists(self.path_of(key))
            .await
            .map_err(|e| ResourceError::StorageFailure(format!("检查 {} 失败: {}", key, e)))
    }

    async fn store_file(
        &self,
        source: &Path,
        original_name: &str,
    ) -> Result<(StorageKey, u64), ResourceError> {
        let mut input = File::open(source).await.map_err(|e| {
            ResourceError::StorageFailure(format!("读取文件 {} 失败: {}", source.display(), e))
        })?;

        let (key, mut target) = self.reserve(extension_of(original_name)).await?;

        match copy_synced(&mut input, &mut target).await {
            Ok(size) => {
                debug!("存储文件 {} -> {} ({} 字节)", original_name, key, size);
                Ok((key, size))
            }
            Err(e) => {
                self.discard_partial(&key).await;
                Err(ResourceError::StorageFailure(format!(
                    "写入 {} 失败: {}",
                    key, e
                )))
            }
        }
    }
}
