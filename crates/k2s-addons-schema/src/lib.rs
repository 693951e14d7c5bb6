//! Addon manifest model, validation, and image discovery for K2s.
//!
//! This crate defines the schema layer: the typed `addon.manifest.yaml` model
//! (`Addon`, `Implementation`, `CliFlag`), the memoized `ManifestRepository`
//! that walks an install tree and validates every manifest against the JSON
//! schema, the CLI-flag `Constraints` engine, and the image reference
//! extractor used to discover container images in addon resource files.

pub mod capabilities;
pub mod constraints;
pub mod images;
pub mod manifest;
pub mod repository;

pub use capabilities::{
    FileReader, FileWalker, FsReader, JsonSchemaValidator, SchemaValidator, WalkDirWalker,
};
pub use constraints::{Constraint, Constraints, Range, ValidationSet};
pub use images::{extract_images_from_files, extract_images_from_str};
pub use manifest::{
    Addon, AddonCmd, AddonMetadata, AddonSpec, CliConfig, CliExample, CliExamples, CliFlag,
    CurlPackage, Implementation, LinuxResources, OfflineUsage, ParameterMapping, ScriptConfig,
    WindowsResources, ADDONS_DIR_NAME, MANIFEST_FILE_NAME, MANIFEST_SCHEMA_FILE_NAME,
    SUPPORTED_API_VERSIONS,
};
pub use repository::{Catalog, ManifestRepository};

use std::path::PathBuf;
use thiserror::Error;

/// Copy of `addon.manifest.schema.json` shipped with the binary.
pub const BUNDLED_MANIFEST_SCHEMA: &str = include_str!("schema/addon.manifest.schema.json");

#[derive(Debug, Error)]
pub enum ManifestLoadError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse manifest '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation failed for manifest '{path}':\n{details}")]
    SchemaViolation { path: PathBuf, details: String },
    #[error("failed to compile manifest schema '{path}': {reason}")]
    SchemaCompile { path: PathBuf, reason: String },
    #[error("manifest '{path}': apiVersion '{version}' invalid; supported versions are ({supported})")]
    UnsupportedApiVersion {
        path: PathBuf,
        version: String,
        supported: String,
    },
    #[error("addon '{name}' is declared twice: '{first}' and '{second}'")]
    DuplicateAddon {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstraintError {
    #[error("unknown constraint type '{0}'")]
    UnknownKind(String),
    #[error("validation set must not be missing for constraint kind 'validation-set'")]
    MissingValidationSet,
    #[error("range must not be missing for constraint kind 'range'")]
    MissingRange,
    #[error("invalid value '{value}', valid values are {valid}")]
    InvalidValue { value: String, valid: String },
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("'{value}' is out of range {range}")]
    OutOfRange { value: String, range: String },
}

#[derive(Debug, Error)]
pub enum ImageExtractionError {
    #[error("failed to extract images from '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to extract images from '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}
