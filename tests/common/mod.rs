#![allow(dead_code)]

use resource_import::content::FsContentStore;
use resource_import::import::ArchiveExtractor;
use resource_import::resource::{
    MemoryBackend, PermissionSet, ResourceManager, ResourceNode, ResourceRepository, Role, User,
};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use zip::write::FileOptions;
use zip::ZipWriter;

pub struct Fixture {
    pub tmp: TempDir,
    pub root: ResourceNode,
}

impl Fixture {
    pub fn new() -> (Self, MemoryBackend) {
        let tmp = tempfile::tempdir().unwrap();
        let backend = MemoryBackend::new();
        let root = backend.create_root(1, "/", "alice", PermissionSet(0o755));
        (Self { tmp, root }, backend)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.tmp.path().join("files")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.tmp.path().join("scratch")
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    pub async fn manager(&self, backend: MemoryBackend) -> ResourceManager<MemoryBackend, FsContentStore> {
        let content = FsContentStore::new(self.files_dir()).await.unwrap();
        ResourceManager::new(backend, content, ArchiveExtractor::new(self.scratch_dir()))
    }
}

pub fn alice() -> User {
    User {
        id: "alice".to_string(),
        username: "alice".to_string(),
        roles: vec![Role::Author],
    }
}

/// 写一个 zip，条目以 / 结尾的是目录
pub fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    for (name, contents) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, FileOptions::default()).unwrap();
        } else {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
    }
    zip.finish().unwrap();
}

/// 目录下所有普通文件的数量，目录不存在时为 0
pub fn count_files(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

pub fn count_entries(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    fs::read_dir(dir).unwrap().count()
}

pub async fn child_names<R: ResourceRepository>(repository: &R, parent: i64) -> Vec<String> {
    repository
        .list_children(parent)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect()
}

/// 校验兄弟链：首尾为空，相邻节点互为 previous/next
pub fn assert_chain(nodes: &[ResourceNode]) {
    if let Some(first) = nodes.first() {
        assert_eq!(first.previous_id, None, "{} 不是链头", first.name);
    }
    if let Some(last) = nodes.last() {
        assert_eq!(last.next_id, None, "{} 不是链尾", last.name);
    }
    for pair in nodes.windows(2) {
        assert_eq!(pair[0].next_id, Some(pair[1].id));
        assert_eq!(pair[1].previous_id, Some(pair[0].id));
    }
}
