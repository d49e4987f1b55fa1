//! Pull behavior of the artifact cache against an in-memory registry.

mod common;

use common::{FakeRegistry, files_under};
use porter_oci::{ArtifactCache, ArtifactReference, Error, Platform};
use std::sync::atomic::Ordering;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REPO: &str = "registry.example.com/plugins/deployer";

fn reference(tag: &str) -> ArtifactReference {
    ArtifactReference::parse(&format!("{REPO}:{tag}")).unwrap()
}

fn cache_dirs(cache: &ArtifactCache) -> Vec<String> {
    let mut dirs: Vec<String> = std::fs::read_dir(cache.root())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    dirs
}

fn seed_two_platforms(registry: &FakeRegistry, tag: &str) -> String {
    registry.seed_binaries(
        REPO,
        tag,
        &[
            (Platform::new("linux", "amd64"), "deployer", b"linux binary"),
            (Platform::new("darwin", "arm64"), "deployer", b"darwin binary"),
        ],
    )
}

#[tokio::test]
async fn test_pull_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    let digest = seed_two_platforms(&registry, "1.0.0");
    let cache = ArtifactCache::new(temp.path());
    let cancel = CancellationToken::new();

    let first = cache.pull(&registry, &reference("1.0.0"), &cancel).await.unwrap();
    let blobs_after_first = files_under(&first.local_path.join("blobs"));

    let second = cache.pull(&registry, &reference("1.0.0"), &cancel).await.unwrap();
    let blobs_after_second = files_under(&second.local_path.join("blobs"));

    assert_eq!(first.id, second.id);
    assert_eq!(first.local_path, second.local_path);
    assert_eq!(first.digest, digest);
    assert_eq!(first.id, &digest["sha256:".len().."sha256:".len() + 16]);
    assert_eq!(blobs_after_first, blobs_after_second);
    // index, two manifests, two layers, one shared config
    assert_eq!(blobs_after_first.len(), 6);
    assert_eq!(cache_dirs(&cache), vec![first.id.clone()]);
}

#[tokio::test]
async fn test_same_digest_under_two_references() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    let digest = seed_two_platforms(&registry, "1.0.0");
    let again = seed_two_platforms(&registry, "stable");
    assert_eq!(digest, again);

    let cache = ArtifactCache::new(temp.path());
    let cancel = CancellationToken::new();
    let first = cache.pull(&registry, &reference("1.0.0"), &cancel).await.unwrap();
    let second = cache.pull(&registry, &reference("stable"), &cancel).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.local_path, first.local_path);
    assert_eq!(second.reference, format!("{REPO}:stable"));
    assert!(second.cached);
    assert_eq!(cache_dirs(&cache), vec![first.id]);
}

#[tokio::test]
async fn test_pull_by_digest() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    let digest = seed_two_platforms(&registry, "1.0.0");
    let cache = ArtifactCache::new(temp.path());

    let by_digest = ArtifactReference::parse(&format!("{REPO}@{digest}")).unwrap();
    let result = cache
        .pull(&registry, &by_digest, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.digest, digest);
}

#[tokio::test]
async fn test_metadata_from_index_annotations() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    let manifest = registry.seed_platform(
        REPO,
        Platform::new("linux", "amd64"),
        common::BINARY_MEDIA_TYPE,
        "deployer",
        b"binary",
    );
    registry.seed_index(
        REPO,
        "2.0.0",
        vec![manifest],
        &[
            ("ds.plugin.name", "deployer"),
            ("ds.plugin.version", "2.0.0"),
            ("ds.plugin.param.region", "eu-west-1"),
        ],
    );

    let cache = ArtifactCache::new(temp.path());
    let result = cache
        .pull(&registry, &reference("2.0.0"), &CancellationToken::new())
        .await
        .unwrap();

    let info = result.plugin_info.clone().unwrap();
    assert_eq!(info.plugin_name, "deployer");
    assert_eq!(info.version, "2.0.0");
    assert_eq!(info.parameters.get("region"), Some(&"eu-west-1".to_string()));

    // The sidecar round-trips through list and load.
    assert_eq!(cache.load(&result.id).unwrap(), result);
    assert_eq!(cache.list().unwrap(), vec![result]);
}

#[tokio::test]
async fn test_failed_pull_leaves_no_directory() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    seed_two_platforms(&registry, "1.0.0");
    registry.fail_pull_of(&porter_oci::descriptor::sha256_digest(b"darwin binary"));

    let cache = ArtifactCache::new(temp.path());
    let err = cache
        .pull(&registry, &reference("1.0.0"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Registry { .. }));
    assert!(cache_dirs(&cache).is_empty());
}

#[tokio::test]
async fn test_missing_tag_fails() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    let cache = ArtifactCache::new(temp.path());

    let result = cache
        .pull(&registry, &reference("nope"), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(registry.blob_pulls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancelled_pull() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    seed_two_platforms(&registry, "1.0.0");
    let cache = ArtifactCache::new(temp.path());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = cache.pull(&registry, &reference("1.0.0"), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(cache_dirs(&cache).is_empty());
}

#[tokio::test]
async fn test_blobs_are_downloaded_through_staging_files() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    seed_two_platforms(&registry, "1.0.0");
    let cache = ArtifactCache::new(temp.path());

    let result = cache
        .pull(&registry, &reference("1.0.0"), &CancellationToken::new())
        .await
        .unwrap();

    // Two layers plus the shared config, each written to its own staging file.
    let destinations = registry.blob_destinations.lock().unwrap().clone();
    assert_eq!(destinations.len(), 3);
    for dest in &destinations {
        let name = dest.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(".staging-"), "{name}");
        assert!(dest.parent().unwrap().ends_with("blobs/sha256"));
        assert!(!dest.exists());
    }

    let blobs = files_under(&result.local_path.join("blobs"));
    assert_eq!(blobs.len(), 6);
    assert!(blobs.iter().all(|b| !b.contains(".staging-")));
}

#[tokio::test]
async fn test_corrupt_download_is_rejected() {
    let temp = TempDir::new().unwrap();
    let registry = FakeRegistry::new();
    seed_two_platforms(&registry, "1.0.0");
    registry.corrupt_pull_of(&porter_oci::descriptor::sha256_digest(b"linux binary"));

    let cache = ArtifactCache::new(temp.path());
    let err = cache
        .pull(&registry, &reference("1.0.0"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::DigestMismatch { .. }));
    assert!(cache_dirs(&cache).is_empty());
}
