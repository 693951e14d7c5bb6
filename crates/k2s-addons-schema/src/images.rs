//! Container image reference discovery in addon resource files.
//!
//! Two sources are recognized while walking a YAML document tree:
//! - the value of any `image` key, when it is a non-empty string
//! - flag-style references (`--x=registry/path:tag`) inside string values
//!   reached under an `args` or `command` key, including through sequences
//!
//! Other string values are never scanned.

use crate::ImageExtractionError;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

const IMAGE_KEY: &str = "image";
const SCANNED_KEYS: [&str; 2] = ["args", "command"];

fn embedded_image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?:--[a-zA-Z-]+=|=)?([a-zA-Z0-9.\-_/]+/[a-zA-Z0-9.\-_/]+:[a-zA-Z0-9.\-_]+)")
            .unwrap_or_else(|e| unreachable!("static image pattern is valid: {e}"))
    })
}

/// Extract image references from every file, deduplicated across files.
///
/// Relative paths are resolved against `base_dir`; absolute paths and paths
/// that climb out of it with `..` are taken as they are.
pub fn extract_images_from_files(
    base_dir: &Path,
    files: &[PathBuf],
) -> Result<BTreeSet<String>, ImageExtractionError> {
    let mut images = BTreeSet::new();
    for file in files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            base_dir.join(file)
        };
        let content =
            std::fs::read_to_string(&path).map_err(|source| ImageExtractionError::Read {
                path: path.clone(),
                source,
            })?;
        let found = extract_images_from_str(&content)
            .map_err(|source| ImageExtractionError::Parse { path: path.clone(), source })?;
        debug!("{} image reference(s) in {}", found.len(), path.display());
        images.extend(found);
    }
    Ok(images)
}

/// Extract image references from a (possibly multi-document) YAML string.
pub fn extract_images_from_str(content: &str) -> Result<BTreeSet<String>, serde_yaml::Error> {
    let mut images = BTreeSet::new();
    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document)?;
        visit(&value, None, &mut images);
    }
    Ok(images)
}

fn visit(value: &Value, parent_key: Option<&str>, images: &mut BTreeSet<String>) {
    match value {
        Value::Mapping(mapping) => {
            for (key, child) in mapping {
                let Some(key) = key.as_str() else {
                    continue;
                };
                if key == IMAGE_KEY {
                    if let Some(image) = child.as_str().filter(|s| !s.is_empty()) {
                        images.insert(image.to_owned());
                    }
                }
                visit(child, Some(key), images);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                visit(item, parent_key, images);
            }
        }
        Value::String(s) => {
            if parent_key.is_some_and(|k| SCANNED_KEYS.contains(&k)) {
                scan_embedded(s, images);
            }
        }
        Value::Tagged(tagged) => visit(&tagged.value, parent_key, images),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

fn scan_embedded(s: &str, images: &mut BTreeSet<String>) {
    for captures in embedded_image_pattern().captures_iter(s) {
        if let Some(m) = captures.get(1) {
            let candidate = m.as_str();
            if candidate.contains('/') && candidate.contains(':') {
                images.insert(candidate.to_owned());
            }
        }
    }
}
