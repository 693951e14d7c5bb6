//! OCI image-layout documents used by addon artifacts.

use crate::types::Digest;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod media_types {
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const ADDON_ARTIFACT: &str = "application/vnd.k2s.addon.v1";
    pub const CONFIG: &str = "application/vnd.k2s.addon.config.v1+yaml";
    pub const SCRIPTS: &str = "application/vnd.k2s.addon.scripts.v1.tar+gzip";
    pub const IMAGES_LINUX: &str = "application/vnd.k2s.addon.images.linux.v1.tar";
    pub const IMAGES_WINDOWS: &str = "application/vnd.k2s.addon.images.windows.v1.tar";
    pub const PACKAGES: &str = "application/vnd.k2s.addon.packages.v1.tar+gzip";
}

pub mod annotations {
    pub const ADDON_NAME: &str = "vnd.k2s.addon.name";
    pub const IMPLEMENTATION: &str = "vnd.k2s.addon.implementation";
    pub const DIRECTORY: &str = "vnd.k2s.addon.directory";
    pub const VERSION: &str = "org.opencontainers.image.version";
    pub const TITLE: &str = "org.opencontainers.image.title";
    pub const TOOL_VERSION: &str = "vnd.k2s.version";
    pub const ADDON_COUNT: &str = "vnd.k2s.addon.count";
}

pub const SCHEMA_VERSION: u32 = 2;

/// Reference to a blob: media type, digest, size, and optional annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.to_owned(),
            digest,
            size,
            artifact_type: None,
            annotations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_owned(), value.into());
        self
    }

    #[must_use]
    pub fn with_annotations(mut self, annotations: &BTreeMap<String, String>) -> Self {
        self.annotations
            .extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Per-implementation manifest: one config blob plus an ordered layer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub artifact_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: media_types::MANIFEST.to_owned(),
            artifact_type: media_types::ADDON_ARTIFACT.to_owned(),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    /// Every digest this manifest references, config first.
    pub fn referenced_digests(&self) -> impl Iterator<Item = &Digest> {
        std::iter::once(&self.config.digest).chain(self.layers.iter().map(|l| &l.digest))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "unsupported manifest schemaVersion {}",
                self.schema_version
            ));
        }
        if self.media_type != media_types::MANIFEST {
            return Err(format!("unexpected manifest mediaType '{}'", self.media_type));
        }
        if self.config.media_type != media_types::CONFIG {
            return Err(format!(
                "unexpected config mediaType '{}'",
                self.config.media_type
            ));
        }
        Ok(())
    }
}

/// Top-level index: one descriptor per exported implementation manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>, tool_version: &str) -> Self {
        let mut index_annotations = BTreeMap::new();
        index_annotations.insert(annotations::TOOL_VERSION.to_owned(), tool_version.to_owned());
        index_annotations.insert(
            annotations::ADDON_COUNT.to_owned(),
            manifests.len().to_string(),
        );
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: media_types::INDEX.to_owned(),
            manifests,
            annotations: index_annotations,
        }
    }

    pub fn tool_version(&self) -> Option<&str> {
        self.annotations
            .get(annotations::TOOL_VERSION)
            .map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        let reason = if self.schema_version != SCHEMA_VERSION {
            format!("unsupported index schemaVersion {}", self.schema_version)
        } else if self.media_type != media_types::INDEX {
            format!("unexpected index mediaType '{}'", self.media_type)
        } else {
            return Ok(());
        };
        Err(StoreError::InvalidLayout {
            path: "index.json".to_owned(),
            reason,
        })
    }
}

/// Content of the `oci-layout` marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLayout {
    pub image_layout_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    All,
    Addon,
    Implementation,
}

/// Flat summary written next to the index as `addons.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    pub k2s_version: String,
    pub export_type: ExportType,
    pub artifact_format: String,
    pub addons: Vec<ExportedAddon>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedAddon {
    pub name: String,
    pub implementation: String,
    pub export_directory_name: String,
    pub digest: Digest,
}
