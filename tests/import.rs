mod common;

use async_trait::async_trait;
use common::{alice, assert_chain, child_names, count_entries, count_files, write_zip, Fixture};
use resource_import::content::{ContentStore, FsContentStore, StorageKey};
use resource_import::import::ArchiveExtractor;
use resource_import::resource::{ResourceError, ResourceManager, ResourceRepository};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_test::{assert_err, assert_ok};

/// 第 fail_on 次写入时返回存储错误
struct FailingStore {
    inner: FsContentStore,
    calls: AtomicUsize,
    fail_on: usize,
}

impl FailingStore {
    fn next_call(&self, original_name: &str) -> Result<(), ResourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(ResourceError::StorageFailure(format!(
                "磁盘已满: {}",
                original_name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentStore for FailingStore {
    async fn store(&self, bytes: &[u8], original_name: &str) -> Result<StorageKey, ResourceError> {
        self.next_call(original_name)?;
        self.inner.store(bytes, original_name).await
    }

    async fn store_file(
        &self,
        source: &Path,
        original_name: &str,
    ) -> Result<(StorageKey, u64), ResourceError> {
        self.next_call(original_name)?;
        self.inner.store_file(source, original_name).await
    }

    async fn copy(&self, key: &StorageKey) -> Result<StorageKey, ResourceError> {
        self.inner.copy(key).await
    }

    async fn delete(&self, key: &StorageKey) -> Result<(), ResourceError> {
        self.inner.delete(key).await
    }

    async fn read(&self, key: &StorageKey) -> Result<Vec<u8>, ResourceError> {
        self.inner.read(key).await
    }

    async fn exists(&self, key: &StorageKey) -> Result<bool, ResourceError> {
        self.inner.exists(key).await
    }
}

#[tokio::test]
async fn import_appends_after_existing_sibling() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    fs::write(fixture.path("X"), b"existing").unwrap();
    let x = assert_ok!(
        manager
            .create_file(&fixture.path("X"), "X", root_id, &alice(), false)
            .await
    )
    .remove(0);

    let archive = fixture.path("course.zip");
    write_zip(
        &archive,
        &[
            ("sub/", ""),
            ("sub/c.txt", "see"),
            ("b.txt", "bee"),
            ("a.txt", "ay"),
        ],
    );

    let top = assert_ok!(manager.import_archive(&archive, root_id, &alice()).await);
    let names: Vec<&str> = top.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);

    let repository = manager.repository();
    let children = repository.list_children(root_id).await.unwrap();
    assert_eq!(
        child_names(repository, root_id).await,
        vec!["X", "a.txt", "b.txt", "sub"]
    );
    assert_chain(&children);
    assert_eq!(children[1].previous_id, Some(x.id));

    let sub = &children[3];
    assert!(sub.is_dir());
    assert_eq!(sub.mime_type, None);
    let nested = repository.list_children(sub.id).await.unwrap();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested[0].name, "c.txt");
    assert_eq!(nested[0].previous_id, None);
    assert_eq!(nested[0].next_id, None);

    let a = &children[1];
    assert_eq!(a.mime_type.as_deref(), Some("text/plain"));
    assert_eq!(a.file_meta().unwrap().size, 2);
    assert_eq!(a.owner_id, "alice");
    assert_eq!(a.workspace_id, fixture.root.workspace_id);
    let (_, bytes) = manager.open_file(a.id, &alice()).await.unwrap();
    assert_eq!(bytes, b"ay");
}

#[tokio::test]
async fn import_into_empty_parent_starts_a_new_chain() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("pair.zip");
    write_zip(&archive, &[("n.txt", "n"), ("m.txt", "m")]);

    let top = assert_ok!(manager.import_archive(&archive, root_id, &alice()).await);

    assert_eq!(top.len(), 2);
    assert_eq!(top[0].name, "m.txt");
    assert_eq!(top[1].name, "n.txt");
    assert_chain(&top);
    assert_eq!(manager.repository().len(), 3);

    for (node, expected) in top.iter().zip([b"m", b"n"]) {
        assert_eq!(node.parent_id, Some(root_id));
        assert_eq!(node.file_meta().unwrap().size, 1);
        assert_eq!(node.mime_type.as_deref(), Some("text/plain"));
        let (_, bytes) = assert_ok!(manager.open_file(node.id, &alice()).await);
        assert_eq!(bytes, expected);
    }
}

#[tokio::test]
async fn storage_failure_mid_import_leaves_nothing_behind() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let store = FailingStore {
        inner: FsContentStore::new(fixture.files_dir()).await.unwrap(),
        calls: AtomicUsize::new(0),
        fail_on: 3,
    };
    let manager = ResourceManager::new(backend, store, ArchiveExtractor::new(fixture.scratch_dir()));

    let archive = fixture.path("three.zip");
    write_zip(
        &archive,
        &[("a.txt", "1"), ("b.txt", "2"), ("sub/", ""), ("sub/c.txt", "3")],
    );

    let err = assert_err!(manager.import_archive(&archive, root_id, &alice()).await);

    assert!(matches!(err, ResourceError::StorageFailure(_)));
    assert!(child_names(manager.repository(), root_id).await.is_empty());
    assert_eq!(manager.repository().len(), 1);
    assert_eq!(count_files(&fixture.files_dir()), 0);
    assert_eq!(count_entries(&fixture.scratch_dir()), 0);
}

#[tokio::test]
async fn corrupt_archive_fails_before_any_write() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("broken.zip");
    fs::write(&archive, b"this is not a zip file").unwrap();

    let err = assert_err!(manager.import_archive(&archive, root_id, &alice()).await);

    assert!(matches!(err, ResourceError::CorruptArchive(_)));
    assert_eq!(manager.repository().len(), 1);
    assert_eq!(count_files(&fixture.files_dir()), 0);
    assert_eq!(count_entries(&fixture.scratch_dir()), 0);
}

#[tokio::test]
async fn scratch_directory_is_removed_after_success() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("ok.zip");
    write_zip(&archive, &[("docs/", ""), ("docs/readme.md", "# course")]);

    assert_ok!(manager.import_archive(&archive, root_id, &alice()).await);

    assert!(fixture.scratch_dir().exists());
    assert_eq!(count_entries(&fixture.scratch_dir()), 0);
    assert_eq!(count_files(&fixture.files_dir()), 1);
}

#[tokio::test]
async fn import_into_file_is_rejected() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    fs::write(fixture.path("plain.txt"), b"x").unwrap();
    let file = manager
        .create_file(&fixture.path("plain.txt"), "plain.txt", root_id, &alice(), false)
        .await
        .unwrap()
        .remove(0);

    let archive = fixture.path("any.zip");
    write_zip(&archive, &[("a.txt", "a")]);

    let err = assert_err!(manager.import_archive(&archive, file.id, &alice()).await);
    assert!(matches!(err, ResourceError::InvalidOperation(_)));
}

#[tokio::test]
async fn zip_upload_with_uncompress_is_imported() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("upload.zip");
    write_zip(&archive, &[("lesson.txt", "lesson")]);

    let unpacked = assert_ok!(
        manager
            .create_file(&archive, "upload.zip", root_id, &alice(), true)
            .await
    );
    assert_eq!(unpacked.len(), 1);
    assert_eq!(unpacked[0].name, "lesson.txt");

    let kept = assert_ok!(
        manager
            .create_file(&archive, "upload.zip", root_id, &alice(), false)
            .await
    );
    assert_eq!(kept[0].name, "upload.zip");
    assert_eq!(kept[0].mime_type.as_deref(), Some("application/zip"));
    assert_eq!(
        child_names(manager.repository(), root_id).await,
        vec!["lesson.txt", "upload.zip"]
    );
}

#[tokio::test]
async fn deleting_middle_sibling_repairs_chain_and_bytes() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("abc.zip");
    write_zip(
        &archive,
        &[("a.txt", "a"), ("b/", ""), ("b/inner.txt", "i"), ("c.txt", "c")],
    );
    let top = manager
        .import_archive(&archive, root_id, &alice())
        .await
        .unwrap();
    assert_eq!(count_files(&fixture.files_dir()), 3);

    let removed = assert_ok!(manager.delete_node(top[1].id, &alice()).await);

    assert_eq!(removed, 1);
    let children = manager.repository().list_children(root_id).await.unwrap();
    assert_eq!(
        children.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
        vec!["a.txt", "c.txt"]
    );
    assert_chain(&children);
    assert_eq!(count_files(&fixture.files_dir()), 2);
    assert!(matches!(
        manager.repository().get_node(top[1].id).await,
        Err(ResourceError::NotFound(_))
    ));
}

#[tokio::test]
async fn copy_survives_deleting_the_original() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    fs::write(fixture.path("notes.md"), b"# notes").unwrap();
    let original = manager
        .create_file(&fixture.path("notes.md"), "notes.md", root_id, &alice(), false)
        .await
        .unwrap()
        .remove(0);

    let copy = assert_ok!(manager.copy_file(original.id, root_id, &alice()).await);
    assert_eq!(copy.name, original.name);
    assert_eq!(copy.mime_type, original.mime_type);
    assert_ne!(
        copy.file_meta().unwrap().storage_key,
        original.file_meta().unwrap().storage_key
    );
    assert_eq!(copy.previous_id, Some(original.id));

    assert_ok!(manager.delete_node(original.id, &alice()).await);

    let (_, bytes) = assert_ok!(manager.open_file(copy.id, &alice()).await);
    assert_eq!(bytes, b"# notes");
    assert_chain(&manager.repository().list_children(root_id).await.unwrap());
}

#[tokio::test]
async fn concurrent_imports_into_one_parent_keep_a_single_chain() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let first = fixture.path("first.zip");
    let second = fixture.path("second.zip");
    write_zip(&first, &[("1.txt", "1"), ("2.txt", "2")]);
    write_zip(&second, &[("3.txt", "3"), ("4.txt", "4")]);

    let actor = alice();
    let (a, b) = tokio::join!(
        manager.import_archive(&first, root_id, &actor),
        manager.import_archive(&second, root_id, &actor)
    );
    assert_ok!(a);
    assert_ok!(b);

    let children = manager.repository().list_children(root_id).await.unwrap();
    assert_eq!(children.len(), 4);
    assert_chain(&children);
}

#[tokio::test]
async fn update_replaces_bytes_in_place() {
    let (fixture, backend) = Fixture::new();
    let root_id = fixture.root.id;
    let manager = fixture.manager(backend).await;

    let archive = fixture.path("pair.zip");
    write_zip(&archive, &[("a.txt", "a"), ("b.txt", "b")]);
    let top = manager
        .import_archive(&archive, root_id, &alice())
        .await
        .unwrap();
    let old_key = top[0].file_meta().unwrap().storage_key.clone();

    fs::write(fixture.path("replacement"), b"rewritten").unwrap();
    let updated = assert_ok!(
        manager
            .update_file(top[0].id, &fixture.path("replacement"), &alice())
            .await
    );

    assert_eq!(updated.name, "a.txt");
    assert_eq!(updated.file_meta().unwrap().size, 9);
    assert_ne!(updated.file_meta().unwrap().storage_key, old_key);
    assert!(!manager.content().exists(&old_key).await.unwrap());
    assert_eq!(count_files(&fixture.files_dir()), 2);

    let children = manager.repository().list_children(root_id).await.unwrap();
    assert_eq!(children[0].id, top[0].id);
    assert_chain(&children);
    let (_, bytes) = assert_ok!(manager.open_file(top[0].id, &alice()).await);
    assert_eq!(bytes, b"rewritten");
}

#[tokio::test]
async fn directories_cannot_be_updated() {
    let (fixture, backend) = Fixture::new();
    let manager = fixture.manager(backend).await;
    fs::write(fixture.path("x"), b"x").unwrap();

    let err = assert_err!(
        manager
            .update_file(fixture.root.id, &fixture.path("x"), &alice())
            .await
    );
    assert!(matches!(err, ResourceError::InvalidOperation(_)));
    assert_eq!(count_files(&fixture.files_dir()), 0);
}
