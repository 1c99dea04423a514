mod common;

use chunked_store::{
    Backend, BackendRegistry, ByteRange, Chunker, Entry, HashType, LocalBackend,
    models::hash::digest,
};
use common::{config, init_tracing, pattern, put, read_all};
use std::sync::Arc;

#[tokio::test]
async fn test_chunked_files_on_disk() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let chunker = Chunker::new(Arc::new(LocalBackend::new(dir.path())), config(100)).unwrap();

    let data = pattern(250);
    let obj = put(&chunker, "sea/fish", &data).await;
    assert_eq!(obj.chunk_count(), 3);

    let mut on_disk: Vec<String> = std::fs::read_dir(dir.path().join("sea"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    on_disk.sort();
    assert_eq!(
        on_disk,
        ["fish", "fish.chunk.001", "fish.chunk.002", "fish.chunk.003"]
    );

    let entries = chunker.list("sea").await.unwrap();
    let [Entry::Object(fish)] = &entries[..] else {
        panic!("expected one file, got {entries:?}");
    };
    assert_eq!(fish.size(), Some(250));
    assert_eq!(read_all(&chunker, fish, ByteRange::new(90, Some(20))).await, &data[90..110]);
    assert_eq!(
        chunker.hash(fish, HashType::Md5).await.unwrap(),
        Some(digest(HashType::Md5, &data))
    );

    let moved = chunker.move_object(fish, "lake/fish").await.unwrap();
    assert_eq!(read_all(&chunker, &moved, ByteRange::default()).await, data);
    assert!(chunker.list("sea").await.unwrap().is_empty());

    chunker.remove(&moved).await.unwrap();
    assert!(chunker.list("lake").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_small_files_pass_through() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let chunker = Chunker::new(Arc::new(LocalBackend::new(dir.path())), config(100)).unwrap();

    let data = pattern(40);
    let obj = put(&chunker, "fish", &data).await;
    assert!(!obj.is_composite());
    assert_eq!(std::fs::read(dir.path().join("fish")).unwrap(), data);

    // The local backend hashes plain files itself.
    assert_eq!(
        chunker.hash(&obj, HashType::Sha1).await.unwrap(),
        Some(digest(HashType::Sha1, &data))
    );
}

#[tokio::test]
async fn test_registry_builds_local_backend() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let registry = BackendRegistry::with_defaults();
    assert_eq!(registry.names().collect::<Vec<_>>(), ["local", "memory"]);

    let root = dir.path().to_string_lossy().into_owned();
    let base = registry.create("local", &root).unwrap();
    assert!(base.config_id().starts_with("local:"));
    let chunker = Chunker::new(base, config(16)).unwrap();
    let data = pattern(50);
    let obj = put(&chunker, "fish", &data).await;
    assert_eq!(obj.chunk_count(), 4);

    assert!(registry.create("s3", &root).is_err());
}
