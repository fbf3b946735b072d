use crate::resource::model::ResourceError;
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use zip::ZipArchive;

/// 已打开的压缩包
pub struct ArchiveHandle {
    path: PathBuf,
    archive: ZipArchive<File>,
}

impl ArchiveHandle {
    pub fn len(&self) -> usize {
        self.archive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archive.len() == 0
    }
}

/// 把压缩包解压到独立的临时目录
#[derive(Debug, Clone)]
pub struct ArchiveExtractor {
    scratch_root: PathBuf,
}

impl ArchiveExtractor {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn open(path: &Path) -> Result<ArchiveHandle, ResourceError> {
        let file = File::open(path).map_err(|e| {
            ResourceError::CorruptArchive(format!("无法打开压缩包 {}: {}", path.display(), e))
        })?;
        let archive = ZipArchive::new(file).map_err(|e| {
            ResourceError::CorruptArchive(format!("无法解析压缩包 {}: {}", path.display(), e))
        })?;

        debug!("打开压缩包 {}，共 {} 个条目", path.display(), archive.len());
        Ok(ArchiveHandle {
            path: path.to_path_buf(),
            archive,
        })
    }

    /// 解压全部条目，保留相对路径。越出目标目录的条目被跳过，条目记录的 unix 权限位不生效
    pub fn extract_all(handle: &mut ArchiveHandle, destination: &Path) -> Result<(), ResourceError> {
        if handle.is_empty() {
            warn!("压缩包 {} 中没有任何条目", handle.path.display());
            return Ok(());
        }
        debug!("解压 {} 个条目到 {}", handle.len(), destination.display());

        for index in 0..handle.len() {
            let mut entry = handle
                .archive
                .by_index(index)
                .map_err(|e| extraction_failure(&handle.path, "读取条目", e))?;

            let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
                warn!("跳过越界的条目: {}", entry.name());
                continue;
            };
            let target = destination.join(&relative);

            let written = if entry.is_dir() {
                fs::create_dir_all(&target)
            } else {
                write_entry(&mut entry, &target)
            };
            written.map_err(|e| {
                extraction_failure(&handle.path, &relative.display().to_string(), e)
            })?;
        }

        Ok(())
    }

    /// 新建一个唯一命名的临时目录，离开作用域时自动删除
    pub fn scratch_dir(&self) -> Result<TempDir, ResourceError> {
        fs::create_dir_all(&self.scratch_root).map_err(|e| {
            ResourceError::ExtractionFailure(format!(
                "无法创建临时目录 {}: {}",
                self.scratch_root.display(),
                e
            ))
        })?;

        tempfile::Builder::new()
            .prefix("import-")
            .tempdir_in(&self.scratch_root)
            .map_err(|e| ResourceError::ExtractionFailure(format!("无法创建临时目录: {}", e)))
    }

    /// 在临时目录根下新建一个接收上传内容的文件，离开作用域时自动删除
    pub fn scratch_file(&self) -> Result<NamedTempFile, ResourceError> {
        fs::create_dir_all(&self.scratch_root).map_err(|e| {
            ResourceError::StorageFailure(format!(
                "无法创建临时目录 {}: {}",
                self.scratch_root.display(),
                e
            ))
        })?;

        tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.scratch_root)
            .map_err(|e| ResourceError::StorageFailure(format!("无法创建临时文件: {}", e)))
    }

    /// 打开并解压压缩包。压缩包损坏时不会创建任何目录
    pub async fn extract(&self, archive_path: &Path) -> Result<TempDir, ResourceError> {
        let extractor = self.clone();
        let archive_path = archive_path.to_path_buf();

        tokio::task::spawn_blocking(move || -> Result<TempDir, ResourceError> {
            let mut handle = Self::open(&archive_path)?;
            let scratch = extractor.scratch_dir()?;
            Self::extract_all(&mut handle, scratch.path())?;
            info!(
                "压缩包 {} 已解压到 {}",
                archive_path.display(),
                scratch.path().display()
            );
            Ok(scratch)
        })
        .await
        .map_err(|e| ResourceError::ExtractionFailure(format!("解压任务异常退出: {}", e)))?
    }
}

fn extraction_failure(archive: &Path, entry: &str, e: impl std::fmt::Display) -> ResourceError {
    ResourceError::ExtractionFailure(format!("解压 {} 的 {} 失败: {}", archive.display(), entry, e))
}

fn write_entry(entry: &mut impl io::Read, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(target)?;
    io::copy(entry, &mut out)?;
    Ok(())
}
