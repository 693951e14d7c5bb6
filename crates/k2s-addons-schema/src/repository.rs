use crate::capabilities::{
    FileReader, FileWalker, FsReader, JsonSchemaValidator, SchemaValidator, WalkDirWalker,
};
use crate::manifest::{
    Addon, Implementation, ADDONS_DIR_NAME, MANIFEST_FILE_NAME, SUPPORTED_API_VERSIONS,
};
use crate::ManifestLoadError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info};

/// Every addon found under one install directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    addons_root: PathBuf,
    addons: Vec<Addon>,
}

impl Catalog {
    pub fn new(addons_root: impl Into<PathBuf>, addons: Vec<Addon>) -> Self {
        Self {
            addons_root: addons_root.into(),
            addons,
        }
    }

    pub fn addons_root(&self) -> &Path {
        &self.addons_root
    }

    pub fn addons(&self) -> &[Addon] {
        &self.addons
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    pub fn find(&self, addon: &str) -> Option<&Addon> {
        self.addons.iter().find(|a| a.metadata.name == addon)
    }

    pub fn find_implementation(
        &self,
        addon: &str,
        implementation: &str,
    ) -> Option<(&Addon, &Implementation)> {
        let a = self.find(addon)?;
        a.implementation(implementation).map(|i| (a, i))
    }

    /// Look up by command name: `"addon impl"` or `"addon"`.
    pub fn resolve(&self, cmd_name: &str) -> Option<(&Addon, &Implementation)> {
        self.pairs().find(|(_, i)| i.addons_cmd_name == cmd_name)
    }

    /// Every (addon, implementation) pair in catalog order.
    pub fn pairs(&self) -> impl Iterator<Item = (&Addon, &Implementation)> {
        self.addons
            .iter()
            .flat_map(|a| a.spec.implementations.iter().map(move |i| (a, i)))
    }

    /// Addon directory relative to the addons root, `/`-separated.
    pub fn relative_directory(&self, addon: &Addon) -> String {
        addon
            .directory
            .strip_prefix(&self.addons_root)
            .unwrap_or(&addon.directory)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Loads and validates every `addon.manifest.yaml` under `<install>/addons`.
///
/// The first successful [`load`](Self::load) is memoized; later calls, from
/// any thread, return the same `Arc` without taking the lock. A failed load
/// is not cached.
pub struct ManifestRepository {
    install_dir: PathBuf,
    walker: Box<dyn FileWalker>,
    reader: Box<dyn FileReader>,
    validator: Option<Box<dyn SchemaValidator>>,
    catalog: OnceLock<Arc<Catalog>>,
    init: Mutex<()>,
}

impl ManifestRepository {
    /// Production wiring: `walkdir`, `std::fs`, and the schema from the
    /// install tree (or the bundled copy), compiled on first load.
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            walker: Box::new(WalkDirWalker),
            reader: Box::new(FsReader),
            validator: None,
            catalog: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    pub fn with_capabilities(
        install_dir: impl Into<PathBuf>,
        walker: Box<dyn FileWalker>,
        reader: Box<dyn FileReader>,
        validator: Box<dyn SchemaValidator>,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            walker,
            reader,
            validator: Some(validator),
            catalog: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn addons_dir(&self) -> PathBuf {
        self.install_dir.join(ADDONS_DIR_NAME)
    }

    pub fn load(&self) -> Result<Arc<Catalog>, ManifestLoadError> {
        if let Some(catalog) = self.catalog.get() {
            return Ok(Arc::clone(catalog));
        }

        let _guard = self
            .init
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(catalog) = self.catalog.get() {
            return Ok(Arc::clone(catalog));
        }

        let catalog = Arc::new(self.load_uncached()?);
        let _ = self.catalog.set(Arc::clone(&catalog));
        Ok(catalog)
    }

    fn load_uncached(&self) -> Result<Catalog, ManifestLoadError> {
        let addons_dir = self.addons_dir();
        info!("loading addon manifests from {}", addons_dir.display());

        let compiled;
        let validator: &dyn SchemaValidator = if let Some(v) = &self.validator {
            v.as_ref()
        } else {
            compiled = JsonSchemaValidator::for_addons_dir(&addons_dir)?;
            &compiled
        };

        let paths = self
            .walker
            .find(&addons_dir, MANIFEST_FILE_NAME)
            .map_err(|source| ManifestLoadError::Io {
                path: addons_dir.clone(),
                source,
            })?;

        let mut addons: Vec<Addon> = Vec::with_capacity(paths.len());
        let mut seen: HashMap<String, PathBuf> = HashMap::new();
        for path in paths {
            let addon = self.load_manifest(&path, validator)?;
            if let Some(first) = seen.get(addon.name()) {
                return Err(ManifestLoadError::DuplicateAddon {
                    name: addon.name().to_owned(),
                    first: first.clone(),
                    second: path,
                });
            }
            seen.insert(addon.name().to_owned(), path);
            debug!(
                "loaded addon '{}' with {} implementation(s)",
                addon.name(),
                addon.implementations().len()
            );
            addons.push(addon);
        }

        info!("loaded {} addon(s)", addons.len());
        Ok(Catalog::new(addons_dir, addons))
    }

    fn load_manifest(
        &self,
        path: &Path,
        validator: &dyn SchemaValidator,
    ) -> Result<Addon, ManifestLoadError> {
        let data = self
            .reader
            .read(path)
            .map_err(|source| ManifestLoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let generic: serde_yaml::Value =
            serde_yaml::from_slice(&data).map_err(|source| ManifestLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let instance =
            serde_json::to_value(&generic).map_err(|e| ManifestLoadError::SchemaViolation {
                path: path.to_path_buf(),
                details: e.to_string(),
            })?;
        validator
            .validate(&instance)
            .map_err(|errors| ManifestLoadError::SchemaViolation {
                path: path.to_path_buf(),
                details: errors.join("\n"),
            })?;

        let mut addon: Addon =
            serde_yaml::from_value(generic).map_err(|source| ManifestLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        if !SUPPORTED_API_VERSIONS.contains(&addon.api_version.as_str()) {
            return Err(ManifestLoadError::UnsupportedApiVersion {
                path: path.to_path_buf(),
                version: addon.api_version,
                supported: SUPPORTED_API_VERSIONS.join("|"),
            });
        }

        addon.directory = path
            .parent()
            .map_or_else(|| self.addons_dir(), Path::to_path_buf);
        addon.manifest_path = path.to_path_buf();
        addon.derive_implementation_fields();
        Ok(addon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const DASHBOARD: &str = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: dashboard\n  description: Dashboard\nspec:\n  implementations:\n    - name: dashboard\n      description: Dashboard UI\n";
    const INGRESS: &str = "apiVersion: v1\nkind: AddonManifest\nmetadata:\n  name: ingress\n  description: Ingress\nspec:\n  implementations:\n    - name: nginx\n      description: n\n    - name: traefik\n      description: t\n";

    struct FakeWalker(Vec<PathBuf>);

    impl FileWalker for FakeWalker {
        fn find(&self, _root: &Path, _file_name: &str) -> io::Result<Vec<PathBuf>> {
            Ok(self.0.clone())
        }
    }

    struct FakeReader {
        files: HashMap<PathBuf, String>,
        reads: Arc<AtomicUsize>,
    }

    impl FileReader for FakeReader {
        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.files
                .get(path)
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }

    struct AcceptAll;

    impl SchemaValidator for AcceptAll {
        fn validate(&self, _instance: &serde_json::Value) -> Result<(), Vec<String>> {
            Ok(())
        }
    }

    struct RejectAll;

    impl SchemaValidator for RejectAll {
        fn validate(&self, _instance: &serde_json::Value) -> Result<(), Vec<String>> {
            Err(vec!["/spec: rejected".to_owned()])
        }
    }

    fn repo_with(
        files: &[(&str, &str)],
        validator: Box<dyn SchemaValidator>,
    ) -> (ManifestRepository, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        let paths = files.iter().map(|(p, _)| PathBuf::from(p)).collect();
        let reader = FakeReader {
            files: files
                .iter()
                .map(|(p, c)| (PathBuf::from(p), (*c).to_owned()))
                .collect(),
            reads: Arc::clone(&reads),
        };
        let repo = ManifestRepository::with_capabilities(
            "/k2s",
            Box::new(FakeWalker(paths)),
            Box::new(reader),
            validator,
        );
        (repo, reads)
    }

    #[test]
    fn load_is_memoized() {
        let (repo, reads) = repo_with(
            &[("/k2s/addons/dashboard/addon.manifest.yaml", DASHBOARD)],
            Box::new(AcceptAll),
        );
        let first = repo.load().unwrap();
        let second = repo.load().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_first_loads_share_one_catalog() {
        let (repo, reads) = repo_with(
            &[("/k2s/addons/dashboard/addon.manifest.yaml", DASHBOARD)],
            Box::new(AcceptAll),
        );
        let catalogs: Vec<Arc<Catalog>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| repo.load().unwrap())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(catalogs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn derived_fields_are_computed() {
        let (repo, _) = repo_with(
            &[
                ("/k2s/addons/dashboard/addon.manifest.yaml", DASHBOARD),
                ("/k2s/addons/ingress/addon.manifest.yaml", INGRESS),
            ],
            Box::new(AcceptAll),
        );
        let catalog = repo.load().unwrap();
        assert_eq!(catalog.len(), 2);
        let (addon, nginx) = catalog.find_implementation("ingress", "nginx").unwrap();
        assert_eq!(addon.directory, PathBuf::from("/k2s/addons/ingress"));
        assert_eq!(nginx.directory, PathBuf::from("/k2s/addons/ingress/nginx"));
        assert_eq!(nginx.export_directory_name, "ingress_nginx");

        let (_, dashboard) = catalog.resolve("dashboard").unwrap();
        assert_eq!(dashboard.directory, PathBuf::from("/k2s/addons/dashboard"));
        assert_eq!(catalog.resolve("ingress traefik").unwrap().1.name, "traefik");
        assert_eq!(catalog.pairs().count(), 3);
        assert_eq!(catalog.relative_directory(addon), "ingress");
    }

    #[test]
    fn schema_violation_aborts_whole_load() {
        let (repo, _) = repo_with(
            &[("/k2s/addons/dashboard/addon.manifest.yaml", DASHBOARD)],
            Box::new(RejectAll),
        );
        let err = repo.load().unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with(
            "validation failed for manifest '/k2s/addons/dashboard/addon.manifest.yaml'"
        ));
        assert!(msg.contains("/spec: rejected"));
    }

    #[test]
    fn unsupported_api_version_is_rejected() {
        let v2 = DASHBOARD.replace("apiVersion: v1", "apiVersion: v2");
        let (repo, _) = repo_with(
            &[("/k2s/addons/dashboard/addon.manifest.yaml", v2.as_str())],
            Box::new(AcceptAll),
        );
        assert!(matches!(
            repo.load().unwrap_err(),
            ManifestLoadError::UnsupportedApiVersion { ref version, .. } if version == "v2"
        ));
    }

    #[test]
    fn duplicate_addon_names_are_rejected() {
        let (repo, _) = repo_with(
            &[
                ("/k2s/addons/a/addon.manifest.yaml", DASHBOARD),
                ("/k2s/addons/b/addon.manifest.yaml", DASHBOARD),
            ],
            Box::new(AcceptAll),
        );
        assert!(matches!(
            repo.load().unwrap_err(),
            ManifestLoadError::DuplicateAddon { .. }
        ));
    }

    #[test]
    fn failed_load_is_not_cached() {
        let reads = Arc::new(AtomicUsize::new(0));
        let repo = ManifestRepository::with_capabilities(
            "/k2s",
            Box::new(FakeWalker(vec![PathBuf::from("/k2s/addons/x/addon.manifest.yaml")])),
            Box::new(FakeReader {
                files: HashMap::new(),
                reads: Arc::clone(&reads),
            }),
            Box::new(AcceptAll),
        );
        assert!(matches!(
            repo.load().unwrap_err(),
            ManifestLoadError::Io { .. }
        ));
        assert!(repo.load().is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let (repo, _) = repo_with(
            &[("/k2s/addons/bad/addon.manifest.yaml", "metadata: [unclosed")],
            Box::new(AcceptAll),
        );
        assert!(matches!(
            repo.load().unwrap_err(),
            ManifestLoadError::Parse { .. }
        ));
    }
}
