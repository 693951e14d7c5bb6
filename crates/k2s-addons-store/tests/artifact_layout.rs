//! Builds a small artifact tree through the public API and reads it back.

use k2s_addons_store::{
    annotations, media_types, pack_dir, pack_dir_gz, unpack, ArtifactLayout, BlobStore,
    Descriptor, ImageIndex, ImageManifest,
};
use std::fs;
use std::path::Path;

fn build_artifact(parent: &Path) -> (ArtifactLayout, ImageIndex) {
    let layout = ArtifactLayout::under(parent);
    layout.initialize().unwrap();
    let blobs = BlobStore::new(layout.clone());

    let scripts_dir = tempfile::tempdir().unwrap();
    fs::write(scripts_dir.path().join("Enable.ps1"), "enable").unwrap();
    let shared_scripts =
        pack_dir_gz(scripts_dir.path(), "", &|_: &Path| true, Vec::new()).unwrap();

    let mut entries = Vec::new();
    for implementation in ["nginx", "traefik"] {
        let (config_digest, config_size) = blobs
            .put(format!("name: {implementation}\n").as_bytes())
            .unwrap();
        let (scripts_digest, scripts_size) = blobs.put(&shared_scripts).unwrap();
        let manifest = ImageManifest::new(
            Descriptor::new(media_types::CONFIG, config_digest, config_size),
            vec![Descriptor::new(media_types::SCRIPTS, scripts_digest, scripts_size)
                .with_annotation(annotations::TITLE, "scripts.tar.gz")],
        );
        let bytes = serde_json::to_vec_pretty(&manifest).unwrap();
        let (digest, size) = blobs.put(&bytes).unwrap();
        entries.push(
            Descriptor::new(media_types::MANIFEST, digest, size)
                .with_annotation(annotations::ADDON_NAME, "ingress")
                .with_annotation(annotations::IMPLEMENTATION, implementation),
        );
    }

    let index = ImageIndex::new(entries, "1.5.0");
    layout.write_index(&index).unwrap();
    (layout, index)
}

#[test]
fn shared_layers_are_stored_once_and_all_digests_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, index) = build_artifact(dir.path());
    let blobs = BlobStore::new(layout.clone());

    // 2 configs + 1 shared scripts layer + 2 manifests
    assert_eq!(blobs.list().unwrap().len(), 5);

    for entry in &index.manifests {
        let manifest: ImageManifest =
            serde_json::from_slice(&blobs.get(&entry.digest).unwrap()).unwrap();
        manifest.validate().unwrap();
        for digest in manifest.referenced_digests() {
            assert!(blobs.exists(digest), "{digest} not backed by a blob");
        }
    }
}

#[test]
fn packaged_tree_verifies_after_unpack() {
    let dir = tempfile::tempdir().unwrap();
    let (layout, index) = build_artifact(dir.path());

    let packed = pack_dir(layout.root(), "artifacts", &|_: &Path| true, Vec::new()).unwrap();

    let target = tempfile::tempdir().unwrap();
    unpack(packed.as_slice(), target.path()).unwrap();
    let restored = ArtifactLayout::under(target.path());
    restored.verify().unwrap();
    assert_eq!(restored.read_index().unwrap(), index);
    assert!(fs::read_dir(restored.blobs_dir()).unwrap().count() >= 5);
}
