use crate::CoreError;
use k2s_addons_node::NodeCommands;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "K2S_ADDONS_CONFIG";
/// Environment variable naming the K2s install directory.
pub const INSTALL_DIR_ENV: &str = "K2S_INSTALL_DIR";

const DEFAULT_CONFIG_PATH: &str = "cfg/addons.toml";

/// Settings for addon export and import, read from `addons.toml`.
///
/// ```toml
/// tool_name = "K2s"
/// tool_version = "1.4.0"
/// parallel_layers = true
///
/// [images]
/// save_command = "nerdctl -n k8s.io save -o {archive} {image}"
/// load_command = "nerdctl -n k8s.io load -i {archive}"
///
/// [packages]
/// cache_dir = "bin/offline-packages"
/// install_command = "sudo dpkg -i -R {dir}"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddonsConfig {
    pub tool_name: String,
    pub tool_version: String,
    pub parallel_layers: bool,
    pub images: ImagesConfig,
    pub packages: PackagesConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub save_command: Option<String>,
    pub load_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Relative paths are resolved against the install directory.
    pub cache_dir: Option<PathBuf>,
    pub install_command: Option<String>,
}

impl Default for AddonsConfig {
    fn default() -> Self {
        Self {
            tool_name: "K2s".to_owned(),
            tool_version: env!("CARGO_PKG_VERSION").to_owned(),
            parallel_layers: true,
            images: ImagesConfig::default(),
            packages: PackagesConfig::default(),
        }
    }
}

impl AddonsConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| CoreError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// `explicit`, else `$K2S_ADDONS_CONFIG`, else `<install>/cfg/addons.toml`
    /// when it exists, else defaults.
    pub fn resolve(explicit: Option<&Path>, install_dir: &Path) -> Result<Self, CoreError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::resolve_with(explicit, from_env.as_deref(), install_dir)
    }

    fn resolve_with(
        explicit: Option<&Path>,
        from_env: Option<&Path>,
        install_dir: &Path,
    ) -> Result<Self, CoreError> {
        if let Some(path) = explicit.or(from_env) {
            debug!("loading addons config from {}", path.display());
            return Self::load(path);
        }
        let installed = install_dir.join(DEFAULT_CONFIG_PATH);
        if installed.is_file() {
            debug!("loading addons config from {}", installed.display());
            return Self::load(&installed);
        }
        debug!("no addons config found, using defaults");
        Ok(Self::default())
    }

    pub fn packages_cache_dir(&self, install_dir: &Path) -> Option<PathBuf> {
        self.packages.cache_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                install_dir.join(dir)
            }
        })
    }

    pub fn node_commands(&self) -> NodeCommands {
        NodeCommands {
            image_save: self.images.save_command.clone(),
            image_load: self.images.load_command.clone(),
            package_install: self.packages.install_command.clone(),
        }
    }
}

/// `explicit`, else `$K2S_INSTALL_DIR`, else the current directory.
pub fn resolve_install_dir(explicit: Option<&Path>) -> Result<PathBuf, CoreError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Some(dir) = std::env::var_os(INSTALL_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    Ok(std::env::current_dir()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addons.toml");

        let mut config = AddonsConfig {
            tool_version: "1.4.0".to_owned(),
            parallel_layers: false,
            ..AddonsConfig::default()
        };
        config.images.save_command = Some("nerdctl save -o {archive} {image}".to_owned());
        config.packages.cache_dir = Some(PathBuf::from("bin/offline"));
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(AddonsConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addons.toml");
        std::fs::write(&path, "tool_version = \"9.9.9\"\n[images]\nload_command = \"ctr import {archive}\"\n").unwrap();

        let config = AddonsConfig::load(&path).unwrap();
        assert_eq!(config.tool_name, "K2s");
        assert_eq!(config.tool_version, "9.9.9");
        assert!(config.parallel_layers);
        assert_eq!(
            config.node_commands().image_load.as_deref(),
            Some("ctr import {archive}")
        );
        assert!(config.node_commands().image_save.is_none());
    }

    #[test]
    fn invalid_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addons.toml");
        std::fs::write(&path, "parallel_layers = \"often\"\n").unwrap();
        let err = AddonsConfig::load(&path).unwrap_err();
        assert!(err.to_string().starts_with("config error:"));
    }

    #[test]
    fn resolution_order() {
        let install = tempfile::tempdir().unwrap();
        assert_eq!(
            AddonsConfig::resolve_with(None, None, install.path()).unwrap(),
            AddonsConfig::default()
        );

        let installed = install.path().join("cfg/addons.toml");
        std::fs::create_dir_all(installed.parent().unwrap()).unwrap();
        std::fs::write(&installed, "tool_version = \"1.0.0\"\n").unwrap();
        let env_file = install.path().join("env.toml");
        std::fs::write(&env_file, "tool_version = \"2.0.0\"\n").unwrap();
        let explicit = install.path().join("explicit.toml");
        std::fs::write(&explicit, "tool_version = \"3.0.0\"\n").unwrap();

        let pick = |e: Option<&Path>, v: Option<&Path>| {
            AddonsConfig::resolve_with(e, v, install.path())
                .unwrap()
                .tool_version
        };
        assert_eq!(pick(None, None), "1.0.0");
        assert_eq!(pick(None, Some(&env_file)), "2.0.0");
        assert_eq!(pick(Some(&explicit), Some(&env_file)), "3.0.0");
    }

    #[test]
    fn cache_dir_is_relative_to_install_dir() {
        let mut config = AddonsConfig::default();
        assert!(config.packages_cache_dir(Path::new("/k2s")).is_none());
        config.packages.cache_dir = Some(PathBuf::from("bin/offline"));
        assert_eq!(
            config.packages_cache_dir(Path::new("/k2s")),
            Some(PathBuf::from("/k2s/bin/offline"))
        );
    }
}
