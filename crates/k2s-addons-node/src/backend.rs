use crate::NodeError;
use k2s_addons_schema::{CurlPackage, OfflineUsage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeOs {
    Linux,
    Windows,
}

impl NodeOs {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
        }
    }
}

impl fmt::Display for NodeOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Export side: saves container images into archive files.
pub trait ImageArchiver: Send + Sync {
    fn name(&self) -> &str;

    /// Write one archive per image into `dest_dir` and return the paths written.
    fn save(
        &self,
        os: NodeOs,
        images: &[String],
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, NodeError>;
}

/// Import side: loads previously saved images onto the nodes of `os`.
pub trait ImageLoader: Send + Sync {
    fn name(&self) -> &str;

    /// `archive_dir` holds the archives written by an [`ImageArchiver`].
    fn load(&self, os: NodeOs, images: &[String], archive_dir: &Path) -> Result<(), NodeError>;
}

/// Import side: installs Linux node packages from an unpacked package layer.
pub trait PackageInstaller: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, packages: &PackageSet, source_dir: &Path) -> Result<(), NodeError>;
}

/// File name used for an image archive: the reference with `/`, `:` and
/// `@` replaced by `_`, plus `.tar`.
pub fn archive_file_name(image: &str) -> String {
    let sanitized: String = image
        .chars()
        .map(|c| if matches!(c, '/' | ':' | '@') { '_' } else { c })
        .collect();
    format!("{sanitized}.tar")
}

/// OS package descriptors of one implementation, serialized as `packages.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    #[serde(default)]
    pub linux: LinuxPackages,
    #[serde(default)]
    pub windows: WindowsPackages,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinuxPackages {
    #[serde(default)]
    pub deb: Vec<String>,
    #[serde(default)]
    pub curl: Vec<CurlPackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsPackages {
    #[serde(default)]
    pub curl: Vec<CurlPackage>,
}

impl PackageSet {
    pub fn from_offline_usage(usage: &OfflineUsage) -> Self {
        Self {
            linux: LinuxPackages {
                deb: usage.linux.deb.clone(),
                curl: usage.linux.curl.clone(),
            },
            windows: WindowsPackages {
                curl: usage.windows.curl.clone(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.linux.deb.is_empty() && self.linux.curl.is_empty() && self.windows.curl.is_empty()
    }

    /// Whether anything has to be installed on the Linux node.
    pub fn has_linux_packages(&self) -> bool {
        !self.linux.deb.is_empty() || !self.linux.curl.is_empty()
    }
}
