//! Persistence round-trip tests: whatever sequence of operations runs, a
//! save/load cycle reproduces the observable state exactly.

use stash_core::stash::{generate_actor_id, Stash};

#[test]
fn test_write_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let actor = generate_actor_id();
    let mut stash = Stash::create("notes", dir.path(), &actor, None, None, None).unwrap();
    stash.write("readme.md", "Hello from stash").unwrap();
    stash.write("src/index.ts", "export default 42;").unwrap();
    stash.save().unwrap();

    let loaded = Stash::load("notes", dir.path(), &actor, None).unwrap();
    assert_eq!(loaded.read("readme.md").unwrap(), "Hello from stash");
    assert_eq!(loaded.read("src/index.ts").unwrap(), "export default 42;");
    assert_eq!(
        loaded.list_files(),
        vec!["readme.md".to_string(), "src/index.ts".to_string()]
    );
}

#[test]
fn test_mixed_operation_sequence_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let actor = generate_actor_id();
    let mut stash = Stash::create("notes", dir.path(), &actor, None, None, None).unwrap();

    stash.write("a.md", "alpha").unwrap();
    stash.write("b.md", "beta").unwrap();
    stash.write("c/d.md", "delta").unwrap();
    stash.patch("a.md", 0, 5, "ALPHA").unwrap();
    stash.move_file("b.md", "renamed/b.md").unwrap();
    stash.delete("c/d.md").unwrap();
    stash.write("c/d.md", "delta reborn").unwrap();
    stash.save().unwrap();

    let mut loaded = Stash::load("notes", dir.path(), &actor, None).unwrap();
    assert_eq!(
        loaded.list_files(),
        vec![
            "a.md".to_string(),
            "c/d.md".to_string(),
            "renamed/b.md".to_string()
        ]
    );
    assert_eq!(loaded.read("a.md").unwrap(), "ALPHA");
    assert_eq!(loaded.read("renamed/b.md").unwrap(), "beta");
    assert_eq!(loaded.read("c/d.md").unwrap(), "delta reborn");

    // Doc identity and fingerprints survive the reload too.
    assert_eq!(loaded.doc_id_of("renamed/b.md"), stash.doc_id_of("renamed/b.md"));
    assert_eq!(loaded.current_snapshot(), stash.current_snapshot());
}

#[test]
fn test_tombstones_and_known_paths_persist() {
    let dir = tempfile::tempdir().unwrap();
    let actor = generate_actor_id();
    let mut stash = Stash::create("notes", dir.path(), &actor, None, None, None).unwrap();

    stash.write("keep.md", "kept").unwrap();
    stash.write("gone.md", "going").unwrap();
    stash.delete("gone.md").unwrap();
    stash.save().unwrap();

    let loaded = Stash::load("notes", dir.path(), &actor, None).unwrap();
    assert!(loaded.is_deleted("gone.md"));
    assert!(loaded.read("gone.md").is_err());
    // The tombstone keeps its doc id for causal ordering.
    assert!(loaded.doc_id_of("gone.md").is_some());
    // Both paths were locally observed and stay known.
    assert!(loaded.is_known_path("keep.md"));
    assert!(loaded.is_known_path("gone.md"));
}

#[test]
fn test_binary_payload_survives_reload() {
    let dir = tempfile::tempdir().unwrap();
    let actor = generate_actor_id();
    let mut stash = Stash::create("notes", dir.path(), &actor, None, None, None).unwrap();

    let payload: Vec<u8> = (0u8..=255).collect();
    let hash = stash.write_binary_bytes("blob.bin", &payload).unwrap();
    stash.save().unwrap();

    let loaded = Stash::load("notes", dir.path(), &actor, None).unwrap();
    assert_eq!(loaded.read_binary("blob.bin").unwrap(), payload);
    let doc_id = loaded.doc_id_of("blob.bin").unwrap();
    let doc = loaded.file_doc(&doc_id).unwrap();
    assert!(doc.is_binary());
    assert_eq!(doc.binary_hash().unwrap(), hash);
    assert_eq!(doc.binary_size().unwrap(), payload.len() as u64);
}
