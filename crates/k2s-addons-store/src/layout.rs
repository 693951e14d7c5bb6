use crate::oci::{ArtifactMetadata, ImageIndex, OciLayout};
use crate::types::Digest;
use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Version written to the `oci-layout` marker.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
/// Name of the single top-level directory inside a packaged artifact.
pub const ARTIFACT_ROOT_DIR: &str = "artifacts";

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const METADATA_FILE: &str = "addons.json";

/// Directory layout of an unpacked addon artifact.
///
/// ```text
/// artifacts/
///   oci-layout
///   index.json
///   addons.json
///   blobs/sha256/<hex>
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at `<parent>/artifacts`.
    pub fn under(parent: &Path) -> Self {
        Self::new(parent.join(ARTIFACT_ROOT_DIR))
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn layout_file(&self) -> PathBuf {
        self.root.join(LAYOUT_FILE)
    }

    #[inline]
    pub fn index_file(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    #[inline]
    pub fn metadata_file(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    #[inline]
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    #[inline]
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.blobs_dir())?;
        let marker = OciLayout {
            image_layout_version: OCI_LAYOUT_VERSION.to_owned(),
        };
        write_json_atomic(&self.root, &self.layout_file(), &marker)
    }

    /// Check that the marker, index, and blob store are all present and
    /// that the marker declares a supported layout version.
    pub fn verify(&self) -> Result<(), StoreError> {
        let layout_file = self.layout_file();
        if !layout_file.is_file() {
            return Err(self.invalid("missing oci-layout marker"));
        }
        let marker: OciLayout = read_json(&layout_file)?;
        if marker.image_layout_version != OCI_LAYOUT_VERSION {
            return Err(self.invalid(&format!(
                "unsupported imageLayoutVersion '{}'",
                marker.image_layout_version
            )));
        }
        if !self.index_file().is_file() {
            return Err(self.invalid("missing index.json"));
        }
        if !self.blobs_dir().is_dir() {
            return Err(self.invalid("missing blobs/sha256 directory"));
        }
        Ok(())
    }

    pub fn write_index(&self, index: &ImageIndex) -> Result<(), StoreError> {
        write_json_atomic(&self.root, &self.index_file(), index)
    }

    /// Read and validate the index (schema version and media type).
    pub fn read_index(&self) -> Result<ImageIndex, StoreError> {
        let index: ImageIndex = read_json(&self.index_file())?;
        index.validate()?;
        Ok(index)
    }

    pub fn write_metadata(&self, metadata: &ArtifactMetadata) -> Result<(), StoreError> {
        write_json_atomic(&self.root, &self.metadata_file(), metadata)
    }

    pub fn read_metadata(&self) -> Result<ArtifactMetadata, StoreError> {
        read_json(&self.metadata_file())
    }

    fn invalid(&self, reason: &str) -> StoreError {
        StoreError::InvalidLayout {
            path: self.root.display().to_string(),
            reason: reason.to_owned(),
        }
    }
}

fn write_json_atomic(dir: &Path, dest: &Path, value: &impl Serialize) -> Result<(), StoreError> {
    let content = serde_json::to_string_pretty(value)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    crate::fsync_dir(dir)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}
