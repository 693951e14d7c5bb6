use crate::constraints::Constraints;
use crate::images::extract_images_from_files;
use crate::{ConstraintError, ImageExtractionError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

pub const ADDONS_DIR_NAME: &str = "addons";
pub const MANIFEST_FILE_NAME: &str = "addon.manifest.yaml";
pub const MANIFEST_SCHEMA_FILE_NAME: &str = "addon.manifest.schema.json";
pub const SUPPORTED_API_VERSIONS: &[&str] = &["v1"];

/// One `addon.manifest.yaml`, plus the location it was loaded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Addon {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: AddonMetadata,
    pub spec: AddonSpec,
    /// Directory holding the manifest.
    #[serde(skip)]
    pub directory: PathBuf,
    #[serde(skip)]
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonSpec {
    pub implementations: Vec<Implementation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commands: Option<BTreeMap<String, AddonCmd>>,
    #[serde(default)]
    pub offline_usage: OfflineUsage,
    /// Where the implementation's scripts live; derived at load time.
    #[serde(skip)]
    pub directory: PathBuf,
    /// `addon` or `addon_impl`; derived at load time.
    #[serde(skip)]
    pub export_directory_name: String,
    /// `addon` or `addon impl`; derived at load time.
    #[serde(skip)]
    pub addons_cmd_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonCmd {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli: Option<CliConfig>,
    pub script: ScriptConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub flags: Vec<CliFlag>,
    #[serde(default)]
    pub examples: CliExamples,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptConfig {
    pub sub_path: String,
    #[serde(default)]
    pub parameter_mappings: Vec<ParameterMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMapping {
    pub cli_flag_name: String,
    pub script_parameter_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliFlag {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shorthand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliExample {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CliExamples(pub Vec<CliExample>);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineUsage {
    #[serde(default)]
    pub linux: LinuxResources,
    #[serde(default)]
    pub windows: WindowsResources,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxResources {
    #[serde(default)]
    pub deb: Vec<String>,
    #[serde(default)]
    pub curl: Vec<CurlPackage>,
    #[serde(default)]
    pub additional_images: Vec<String>,
    #[serde(default)]
    pub additional_images_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsResources {
    #[serde(default)]
    pub curl: Vec<CurlPackage>,
    #[serde(default)]
    pub additional_images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurlPackage {
    pub url: String,
    pub destination: String,
}

impl Addon {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn implementations(&self) -> &[Implementation] {
        &self.spec.implementations
    }

    pub fn implementation(&self, name: &str) -> Option<&Implementation> {
        self.spec.implementations.iter().find(|i| i.name == name)
    }

    /// Fill in each implementation's directory, export name, and command name.
    pub fn derive_implementation_fields(&mut self) {
        let addon_name = self.metadata.name.clone();
        for implementation in &mut self.spec.implementations {
            if implementation.name == addon_name {
                implementation.directory.clone_from(&self.directory);
                implementation.export_directory_name = addon_name.replace(' ', "_");
                implementation.addons_cmd_name.clone_from(&addon_name);
            } else {
                implementation.directory = self.directory.join(&implementation.name);
                implementation.export_directory_name =
                    format!("{addon_name}_{}", implementation.name).replace(' ', "_");
                implementation.addons_cmd_name = format!("{addon_name} {}", implementation.name);
            }
        }
    }
}

impl Implementation {
    /// Whether the implementation lives in its own subdirectory of the addon.
    pub fn is_nested_in(&self, addon_dir: &Path) -> bool {
        self.directory != addon_dir
    }

    /// Resource files to scan, resolved against the implementation directory.
    pub fn additional_images_files(&self) -> Vec<PathBuf> {
        self.offline_usage
            .linux
            .additional_images_files
            .iter()
            .map(|f| {
                let p = Path::new(f);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    self.directory.join(p)
                }
            })
            .collect()
    }

    /// Declared Linux `additionalImages` plus every reference found in the
    /// `additionalImagesFiles`.
    pub fn linux_images(&self) -> Result<BTreeSet<String>, ImageExtractionError> {
        let mut images =
            extract_images_from_files(&self.directory, &self.additional_images_files())?;
        images.extend(self.offline_usage.linux.additional_images.iter().cloned());
        Ok(images)
    }

    pub fn windows_images(&self) -> BTreeSet<String> {
        self.offline_usage
            .windows
            .additional_images
            .iter()
            .cloned()
            .collect()
    }
}

impl CliFlag {
    /// Description followed by the rendered constraint, separated by a
    /// single space when both are present.
    pub fn full_description(&self) -> Result<String, ConstraintError> {
        let mut description = self.description.clone().unwrap_or_default();
        let constraints = match &self.constraints {
            Some(c) => c.render()?,
            None => String::new(),
        };
        if !description.is_empty() && !constraints.is_empty() {
            description.push(' ');
        }
        description.push_str(&constraints);
        Ok(description)
    }
}

impl fmt::Display for CliExample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(comment) = &self.comment {
            writeln!(f, "  // {comment}")?;
        }
        writeln!(f, "  {}", self.cmd)
    }
}

impl fmt::Display for CliExamples {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("\n"))
    }
}
