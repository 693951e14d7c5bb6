//! Export and import engine for K2s addon artifacts.
//!
//! `ArtifactBuilder` turns a selection of (addon, implementation) pairs from a
//! loaded `Catalog` into a single `<tool>-<version>-addons-<scope>.oci.tar`.
//! `ArtifactImporter` is the inverse: it verifies such a file, hands images and
//! packages to the node collaborators, and commits each implementation into
//! the live addon tree, merging manifests text-wise so existing
//! implementations and comments survive. Imports hold an exclusive lock on
//! the addon tree; both directions poll a `Cancellation` between stages.

pub mod concurrency;
pub mod config;
pub mod export;
pub mod import;
pub mod merge;

pub use concurrency::{install_signal_handler, shutdown_requested, AddonsLock, Cancellation};
pub use config::{
    resolve_install_dir, AddonsConfig, ImagesConfig, PackagesConfig, CONFIG_ENV, INSTALL_DIR_ENV,
};
pub use export::{artifact_file_name, ArtifactBuilder, ExportResult, ExportScope};
pub use import::{ArtifactImporter, FailedImplementation, ImportReport, ImportedImplementation};
pub use merge::{merge_implementation, MergeError};

use k2s_addons_node::NodeError;
use k2s_addons_schema::{ImageExtractionError, ManifestLoadError};
use k2s_addons_store::StoreError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestLoadError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("{0}")]
    Export(#[from] ExportError),
    #[error("{0}")]
    Import(#[from] ImportError),
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Aborts the whole export; no artifact file is left behind.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no addon named '{0}'")]
    AddonNotFound(String),
    #[error("addon '{addon}' has no implementation '{implementation}'")]
    ImplementationNotFound {
        addon: String,
        implementation: String,
    },
    #[error("nothing to export: the catalog is empty")]
    EmptySelection,
    #[error("missing source content for '{addon}/{implementation}': {reason}")]
    MissingContent {
        addon: String,
        implementation: String,
        reason: String,
    },
    #[error("image discovery failed for '{addon}/{implementation}': {source}")]
    Images {
        addon: String,
        implementation: String,
        source: ImageExtractionError,
    },
    #[error("saving images for '{addon}/{implementation}' failed: {source}")]
    Node {
        addon: String,
        implementation: String,
        source: NodeError,
    },
    #[error("failed to render config for '{addon}/{implementation}': {reason}")]
    Config {
        addon: String,
        implementation: String,
        reason: String,
    },
    #[error("building layers for '{addon}/{implementation}' failed: {source}")]
    Layer {
        addon: String,
        implementation: String,
        source: StoreError,
    },
    #[error("layer worker for '{addon}/{implementation}' panicked")]
    WorkerPanicked {
        addon: String,
        implementation: String,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("export cancelled")]
    Cancelled,
}

/// Whole-run variants (`Extract`, `InvalidLayout`, `Lock`) abort the import;
/// the rest are recorded per implementation in the [`ImportReport`].
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("store lock: {0}")]
    Lock(std::io::Error),
    #[error("store error: cannot extract '{path}': {source}")]
    Extract { path: PathBuf, source: StoreError },
    #[error("store error: {0}")]
    InvalidLayout(StoreError),
    #[error("blob {digest} referenced by '{addon}/{implementation}' is missing")]
    MissingBlob {
        addon: String,
        implementation: String,
        digest: String,
    },
    #[error("blob {digest} of '{addon}/{implementation}' failed its integrity check")]
    BlobIntegrity {
        addon: String,
        implementation: String,
        digest: String,
    },
    #[error("invalid artifact content for '{addon}/{implementation}': {reason}")]
    InvalidManifest {
        addon: String,
        implementation: String,
        reason: String,
    },
    #[error("'{addon}/{implementation}' targets unsafe path '{path}'")]
    UnsafePath {
        addon: String,
        implementation: String,
        path: String,
    },
    #[error("cannot merge '{addon}/{implementation}' into {path}: {source}")]
    MergeConflict {
        addon: String,
        implementation: String,
        path: PathBuf,
        source: MergeError,
    },
    #[error("node collaborator failed for '{addon}/{implementation}': {source}")]
    Node {
        addon: String,
        implementation: String,
        source: NodeError,
    },
    #[error("I/O error while importing '{addon}/{implementation}': {source}")]
    Io {
        addon: String,
        implementation: String,
        source: std::io::Error,
    },
    #[error("import of '{addon}/{implementation}' cancelled")]
    Cancelled {
        addon: String,
        implementation: String,
    },
}

/// Copy a file or directory tree, overwriting files that already exist.
pub(crate) fn copy_tree(source: &Path, dest: &Path) -> Result<(), std::io::Error> {
    if source.is_file() {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Last path segment of a download URL, used as the cached file name.
pub(crate) fn url_basename(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

/// Packaging leftovers that never belong in an installed addon directory.
pub(crate) fn is_transient_file(name: &str) -> bool {
    name.ends_with(".tar")
        || name.ends_with(".tar.gz")
        || name == "oci-manifest.json"
        || name == "version.info"
}
