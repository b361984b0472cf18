//! Integration tests for the filesystem ↔ CRDT bridge.
//!
//! Timing knobs are shrunk via `Settings::fast()` so watcher-driven
//! scenarios settle in well under a second.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use stash_core::remote::memory::{MemoryRemote, MemoryRemoteStore};
use stash_core::stash::{generate_actor_id, SharedStash, Stash};
use stash_core::sync::retry::RetryPolicy;
use stash_core::{Reconciler, Settings};

fn shared_stash(root: &Path, store: Option<Arc<MemoryRemoteStore>>) -> SharedStash {
    let provider = store.map(|s| {
        Arc::new(MemoryRemote::connect(s)) as Arc<dyn stash_core::remote::RemoteTransport>
    });
    let stash = Stash::create("notes", root, &generate_actor_id(), provider, None, None).unwrap();
    SharedStash::with_settings(stash, Settings::fast(), RetryPolicy::fast())
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(800)).await;
}

#[tokio::test]
async fn test_disk_edit_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    shared.write("file.md", "initial").await.unwrap();

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("file.md")).unwrap(),
        "initial"
    );

    std::fs::write(dir.path().join("file.md"), "edited on disk").unwrap();
    settle().await;

    assert_eq!(shared.read("file.md").await.unwrap(), "edited on disk");
    reconciler.close().await;
}

#[tokio::test]
async fn test_new_disk_file_imported() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    let reconciler = Reconciler::start(shared.clone()).await.unwrap();

    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/new.md"), "fresh").unwrap();
    settle().await;

    assert_eq!(shared.read("sub/new.md").await.unwrap(), "fresh");
    assert!(shared.lock().await.is_known_path("sub/new.md"));
    reconciler.close().await;
}

#[tokio::test]
async fn test_rename_detected_within_window() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    shared.write("old.md", "rename me").await.unwrap();
    let original_id = { shared.lock().await.doc_id_of("old.md").unwrap() };

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();

    // Unlink then re-create with identical content and basename inside the
    // rename window.
    std::fs::create_dir_all(dir.path().join("sub")).unwrap();
    std::fs::remove_file(dir.path().join("old.md")).unwrap();
    std::fs::write(dir.path().join("sub/old.md"), "rename me").unwrap();
    settle().await;

    assert_eq!(shared.list_files().await, vec!["sub/old.md".to_string()]);
    assert_eq!(
        shared.lock().await.doc_id_of("sub/old.md").unwrap(),
        original_id
    );
    reconciler.close().await;
}

#[tokio::test]
async fn test_basename_change_is_delete_plus_add() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    shared.write("old.md", "same bytes").await.unwrap();
    let original_id = { shared.lock().await.doc_id_of("old.md").unwrap() };

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();

    std::fs::remove_file(dir.path().join("old.md")).unwrap();
    std::fs::write(dir.path().join("renamed.md"), "same bytes").unwrap();
    settle().await;

    // Different basename: not collapsed into a move.
    assert_eq!(shared.list_files().await, vec!["renamed.md".to_string()]);
    assert_ne!(
        shared.lock().await.doc_id_of("renamed.md").unwrap(),
        original_id
    );
    assert!(shared.is_deleted("old.md").await);
    reconciler.close().await;
}

#[tokio::test]
async fn test_delete_prunes_empty_parents() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    shared.write("a/b/c.md", "deep").await.unwrap();

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();
    assert!(dir.path().join("a/b/c.md").exists());

    std::fs::remove_file(dir.path().join("a/b/c.md")).unwrap();
    settle().await;

    assert!(shared.is_deleted("a/b/c.md").await);
    assert!(!dir.path().join("a").exists());
    assert!(dir.path().exists());
    reconciler.close().await;
}

#[tokio::test]
async fn test_scan_imports_and_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pre-existing.md"), "was here").unwrap();

    let shared = shared_stash(dir.path(), None);
    shared.write("removed-offline.md", "gone").await.unwrap();
    // Simulate the file never having reached disk (deleted while daemon was
    // down): nothing at removed-offline.md.

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.scan().await.unwrap();

    assert_eq!(shared.read("pre-existing.md").await.unwrap(), "was here");
    assert!(shared.is_deleted("removed-offline.md").await);
    reconciler.close().await;
}

#[tokio::test]
async fn test_flush_honors_known_delete_and_resurrects_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);

    // Known + tombstoned: the delete is honored on disk.
    shared.write("known.md", "known content").await.unwrap();
    shared.delete("known.md").await.unwrap();
    std::fs::write(dir.path().join("known.md"), "known content").unwrap();

    // Tombstoned but never locally observed: new local work, resurrected.
    {
        let mut stash = shared.lock().await;
        stash.write("unknown.md", "local work").unwrap();
        stash.delete("unknown.md").unwrap();
        stash.remove_known_path("unknown.md");
    }
    std::fs::write(dir.path().join("unknown.md"), "local work").unwrap();

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();

    assert!(!dir.path().join("known.md").exists());
    assert!(!shared.lock().await.is_known_path("known.md"));

    assert!(dir.path().join("unknown.md").exists());
    assert_eq!(shared.read("unknown.md").await.unwrap(), "local work");
    reconciler.close().await;
}

#[tokio::test]
async fn test_type_change_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let shared = shared_stash(dir.path(), None);
    shared.write("file.md", "text at first").await.unwrap();

    let reconciler = Reconciler::start(shared.clone()).await.unwrap();
    reconciler.flush().await.unwrap();

    let payload = vec![0xffu8, 0xfe, 0x00, 0x01];
    std::fs::write(dir.path().join("file.md"), &payload).unwrap();
    settle().await;

    assert_eq!(shared.read_binary("file.md").await.unwrap(), payload);
    reconciler.close().await;
}

#[tokio::test]
async fn test_fresh_join_renders_working_tree() {
    let store = MemoryRemoteStore::new();

    // Replica A populates the remote without any reconciler.
    let dir_a = tempfile::tempdir().unwrap();
    let a = shared_stash(dir_a.path(), Some(store.clone()));
    a.write("file1.md", "c1").await.unwrap();
    a.write("dir/file2.md", "c2").await.unwrap();
    a.write("dir/sub/file3.md", "c3").await.unwrap();
    a.sync().await.unwrap();

    // Empty replica B joins and flushes to disk.
    let dir_b = tempfile::tempdir().unwrap();
    let b = shared_stash(dir_b.path(), Some(store.clone()));
    b.sync().await.unwrap();
    let reconciler = Reconciler::start(b.clone()).await.unwrap();
    reconciler.flush().await.unwrap();

    for (path, content) in [
        ("file1.md", "c1"),
        ("dir/file2.md", "c2"),
        ("dir/sub/file3.md", "c3"),
    ] {
        assert_eq!(
            std::fs::read_to_string(dir_b.path().join(path)).unwrap(),
            content,
            "mismatch at {path}"
        );
        assert!(b.lock().await.is_known_path(path));
    }
    reconciler.close().await;
}

#[tokio::test]
async fn test_remote_delete_removes_local_file() {
    let store = MemoryRemoteStore::new();

    let dir_a = tempfile::tempdir().unwrap();
    let a = shared_stash(dir_a.path(), Some(store.clone()));
    a.write("file.md", "content").await.unwrap();
    a.sync().await.unwrap();

    let dir_b = tempfile::tempdir().unwrap();
    let b = shared_stash(dir_b.path(), Some(store.clone()));
    b.sync().await.unwrap();
    let reconciler = Reconciler::start(b.clone()).await.unwrap();
    reconciler.flush().await.unwrap();
    assert!(dir_b.path().join("file.md").exists());

    a.delete("file.md").await.unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();
    reconciler.flush().await.unwrap();

    assert!(b.list_files().await.is_empty());
    assert!(!dir_b.path().join("file.md").exists());
    reconciler.close().await;
}
