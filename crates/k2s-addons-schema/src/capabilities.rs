//! Filesystem and schema capabilities injected into [`ManifestRepository`](crate::ManifestRepository).

use crate::{ManifestLoadError, BUNDLED_MANIFEST_SCHEMA};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait FileWalker: Send + Sync {
    /// Every regular file named `file_name` below `root`, sorted by path.
    fn find(&self, root: &Path, file_name: &str) -> io::Result<Vec<PathBuf>>;
}

pub trait FileReader: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

pub trait SchemaValidator: Send + Sync {
    /// `Err` carries one message per violation.
    fn validate(&self, instance: &serde_json::Value) -> Result<(), Vec<String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WalkDirWalker;

impl FileWalker for WalkDirWalker {
    fn find(&self, root: &Path, file_name: &str) -> io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() && entry.file_name() == file_name {
                found.push(entry.into_path());
            }
        }
        Ok(found)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsReader;

impl FileReader for FsReader {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// JSON-schema validator backed by the `jsonschema` crate.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl JsonSchemaValidator {
    pub fn from_value(schema: &serde_json::Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self { validator })
    }

    /// Compile the schema file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, ManifestLoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str_at(&content, path)
    }

    /// Compile the copy of the schema shipped with this crate.
    pub fn bundled() -> Result<Self, ManifestLoadError> {
        Self::from_str_at(
            BUNDLED_MANIFEST_SCHEMA,
            Path::new(crate::MANIFEST_SCHEMA_FILE_NAME),
        )
    }

    /// Use `<addons_dir>/addon.manifest.schema.json` when present, else the bundled schema.
    pub fn for_addons_dir(addons_dir: &Path) -> Result<Self, ManifestLoadError> {
        let path = addons_dir.join(crate::MANIFEST_SCHEMA_FILE_NAME);
        if path.is_file() {
            debug!("compiling manifest schema {}", path.display());
            Self::from_file(&path)
        } else {
            debug!("no schema at {}, using bundled schema", path.display());
            Self::bundled()
        }
    }

    fn from_str_at(content: &str, path: &Path) -> Result<Self, ManifestLoadError> {
        let compile_error = |reason: String| ManifestLoadError::SchemaCompile {
            path: path.to_path_buf(),
            reason,
        };
        let schema: serde_json::Value =
            serde_json::from_str(content).map_err(|e| compile_error(e.to_string()))?;
        Self::from_value(&schema).map_err(compile_error)
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, instance: &serde_json::Value) -> Result<(), Vec<String>> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| {
                let location = e.instance_path.to_string();
                if location.is_empty() {
                    e.to_string()
                } else {
                    format!("{location}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
