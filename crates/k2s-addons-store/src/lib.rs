//! OCI artifact layout, content-addressable blob store, and layer archives for K2s addons.
//!
//! This crate provides the storage layer of addon export and import: a
//! SHA-256 keyed `BlobStore` with atomic, write-once puts and verified reads,
//! `ArtifactLayout` for the on-disk `artifacts/` tree (layout marker, index,
//! summary metadata, blobs), the OCI document types (`ImageIndex`,
//! `ImageManifest`, `Descriptor`), and deterministic tar / tar.gz packing.

pub mod archive;
pub mod blobs;
pub mod layout;
pub mod oci;
pub mod types;

pub use archive::{gunzip_unpack, pack_dir, pack_dir_gz, unpack};
pub use blobs::BlobStore;
pub use layout::{ArtifactLayout, ARTIFACT_ROOT_DIR, OCI_LAYOUT_VERSION};
pub use oci::{
    annotations, media_types, ArtifactMetadata, Descriptor, ExportType, ExportedAddon,
    ImageIndex, ImageManifest, OciLayout,
};
pub use types::Digest;

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding rename is durable.
///
/// Windows cannot open a directory as a `File`; there the rename itself is
/// the commit point and this is a no-op.
#[cfg(unix)]
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
pub(crate) fn fsync_dir(_dir: &Path) -> Result<(), std::io::Error> {
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for blob '{digest}': content hashes to {actual}")]
    IntegrityFailure { digest: String, actual: String },
    #[error("blob not found: {0}")]
    BlobNotFound(String),
    #[error("invalid digest '{0}', expected sha256:<64 hex chars>")]
    InvalidDigest(String),
    #[error("invalid artifact layout at {path}: {reason}")]
    InvalidLayout { path: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
