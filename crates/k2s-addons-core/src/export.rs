use crate::concurrency::Cancellation;
use crate::config::AddonsConfig;
use crate::{copy_tree, is_transient_file, url_basename, ExportError};
use k2s_addons_node::{ImageArchiver, NodeOs, PackageSet};
use k2s_addons_schema::{
    Addon, Catalog, Implementation, MANIFEST_FILE_NAME, MANIFEST_SCHEMA_FILE_NAME,
};
use k2s_addons_store::{
    annotations, media_types, pack_dir, pack_dir_gz, ArtifactLayout, ArtifactMetadata, BlobStore,
    Descriptor, ExportType, ExportedAddon, ImageIndex, ImageManifest, ARTIFACT_ROOT_DIR,
};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const SCRIPTS_LAYER: &str = "scripts.tar.gz";
const IMAGES_LINUX_LAYER: &str = "images-linux.tar";
const IMAGES_WINDOWS_LAYER: &str = "images-windows.tar";
const PACKAGES_LAYER: &str = "packages.tar.gz";
const IMAGES_FILE: &str = "images.json";
const PACKAGES_FILE: &str = "packages.json";
const ARTIFACT_FORMAT: &str = "oci";

/// Which part of the catalog to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportScope {
    All,
    Addon(String),
    Implementation {
        addon: String,
        implementation: String,
    },
}

impl ExportScope {
    pub fn from_args(addon: Option<&str>, implementation: Option<&str>) -> Self {
        match (addon, implementation) {
            (None, _) => Self::All,
            (Some(a), None) => Self::Addon(a.to_owned()),
            (Some(a), Some(i)) => Self::Implementation {
                addon: a.to_owned(),
                implementation: i.to_owned(),
            },
        }
    }

    pub fn export_type(&self) -> ExportType {
        match self {
            Self::All => ExportType::All,
            Self::Addon(_) => ExportType::Addon,
            Self::Implementation { .. } => ExportType::Implementation,
        }
    }

    /// `all`, `<addon>` or `<addon>-<implementation>`.
    pub fn label(&self) -> String {
        let label = match self {
            Self::All => "all".to_owned(),
            Self::Addon(a) => a.clone(),
            Self::Implementation {
                addon,
                implementation,
            } => format!("{addon}-{implementation}"),
        };
        label.replace(' ', "_")
    }
}

/// `<tool>-<version>-addons-<scope>.oci.tar`
pub fn artifact_file_name(tool_name: &str, tool_version: &str, scope: &ExportScope) -> String {
    format!("{tool_name}-{tool_version}-addons-{}.oci.tar", scope.label())
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub artifact: PathBuf,
    pub index: ImageIndex,
    pub metadata: ArtifactMetadata,
    pub blob_count: usize,
}

/// A layer payload built in staging, not yet in the blob store.
struct StagedLayer {
    media_type: &'static str,
    title: &'static str,
    path: PathBuf,
}

struct StagedImplementation {
    config: Vec<u8>,
    layers: Vec<StagedLayer>,
}

/// Builds OCI addon artifacts from a loaded catalog.
///
/// Pipeline: select, then discover and stage layers per implementation
/// (in parallel when `parallel_layers` is set), then store blobs and
/// manifests, write the index and summary, and finally package the layout
/// into one tar. The tar is persisted to its final name only after every
/// stage succeeded.
pub struct ArtifactBuilder {
    catalog: Arc<Catalog>,
    archiver: Arc<dyn ImageArchiver>,
    config: AddonsConfig,
    package_cache: Option<PathBuf>,
    cancel: Cancellation,
}

impl ArtifactBuilder {
    pub fn new(
        catalog: Arc<Catalog>,
        archiver: Arc<dyn ImageArchiver>,
        config: AddonsConfig,
    ) -> Self {
        Self {
            catalog,
            archiver,
            config,
            package_cache: None,
            cancel: Cancellation::new(),
        }
    }

    /// Directory holding `linuxpackages/`, `windowspackages/` and `debianpackages/`.
    #[must_use]
    pub fn with_package_cache(mut self, dir: Option<PathBuf>) -> Self {
        self.package_cache = dir;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve the scope to (addon, implementation) pairs in catalog order.
    pub fn select(
        &self,
        scope: &ExportScope,
    ) -> Result<Vec<(&Addon, &Implementation)>, ExportError> {
        let selected: Vec<_> = match scope {
            ExportScope::All => self.catalog.pairs().collect(),
            ExportScope::Addon(name) => {
                let addon = self
                    .catalog
                    .find(name)
                    .ok_or_else(|| ExportError::AddonNotFound(name.clone()))?;
                addon.implementations().iter().map(|i| (addon, i)).collect()
            }
            ExportScope::Implementation {
                addon,
                implementation,
            } => {
                if self.catalog.find(addon).is_none() {
                    return Err(ExportError::AddonNotFound(addon.clone()));
                }
                let pair = self
                    .catalog
                    .find_implementation(addon, implementation)
                    .ok_or_else(|| ExportError::ImplementationNotFound {
                        addon: addon.clone(),
                        implementation: implementation.clone(),
                    })?;
                vec![pair]
            }
        };
        if selected.is_empty() {
            return Err(ExportError::EmptySelection);
        }
        Ok(selected)
    }

    pub fn export(
        &self,
        scope: &ExportScope,
        output_dir: &Path,
    ) -> Result<ExportResult, ExportError> {
        let selected = self.select(scope)?;
        info!(
            "exporting {} implementation(s) for scope '{}'",
            selected.len(),
            scope.label()
        );

        let staging = tempfile::tempdir()?;
        let layout = ArtifactLayout::under(staging.path());
        layout.initialize()?;
        let blobs = BlobStore::new(layout.clone());
        let layers_root = staging.path().join("layers");

        self.checkpoint()?;
        let staged = self.stage_all(&selected, &layers_root)?;

        self.checkpoint()?;
        let mut index_entries = Vec::with_capacity(staged.len());
        let mut exported = Vec::with_capacity(staged.len());
        for ((addon, implementation), staged) in selected.iter().zip(&staged) {
            let entry = self.store_implementation(&blobs, addon, implementation, staged)?;
            exported.push(ExportedAddon {
                name: addon.name().to_owned(),
                implementation: implementation.name.clone(),
                export_directory_name: implementation.export_directory_name.clone(),
                digest: entry.digest.clone(),
            });
            index_entries.push(entry);
        }

        let index = ImageIndex::new(index_entries, &self.config.tool_version);
        layout.write_index(&index)?;
        let metadata = ArtifactMetadata {
            k2s_version: self.config.tool_version.clone(),
            export_type: scope.export_type(),
            artifact_format: ARTIFACT_FORMAT.to_owned(),
            addons: exported,
        };
        layout.write_metadata(&metadata)?;
        let blob_count = blobs.list()?.len();

        self.checkpoint()?;
        fs::create_dir_all(output_dir)?;
        let artifact = output_dir.join(artifact_file_name(
            &self.config.tool_name,
            &self.config.tool_version,
            scope,
        ));
        let tmp = NamedTempFile::new_in(output_dir)?;
        let writer = pack_dir(
            layout.root(),
            ARTIFACT_ROOT_DIR,
            &|_| true,
            BufWriter::new(tmp.as_file()),
        )?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        self.checkpoint()?;
        tmp.persist(&artifact).map_err(|e| e.error)?;

        info!(
            "wrote {} ({} manifest(s), {blob_count} blob(s))",
            artifact.display(),
            index.manifests.len()
        );
        Ok(ExportResult {
            artifact,
            index,
            metadata,
            blob_count,
        })
    }

    fn checkpoint(&self) -> Result<(), ExportError> {
        if self.cancel.is_cancelled() {
            info!("export cancelled");
            return Err(ExportError::Cancelled);
        }
        Ok(())
    }

    fn stage_all(
        &self,
        selected: &[(&Addon, &Implementation)],
        layers_root: &Path,
    ) -> Result<Vec<StagedImplementation>, ExportError> {
        let work_dir = |i: usize| layers_root.join(i.to_string());
        if !self.config.parallel_layers || selected.len() < 2 {
            return selected
                .iter()
                .enumerate()
                .map(|(i, (a, imp))| self.stage(a, imp, &work_dir(i)))
                .collect();
        }

        std::thread::scope(|s| {
            let handles: Vec<_> = selected
                .iter()
                .enumerate()
                .map(|(i, &(a, imp))| {
                    let dir = work_dir(i);
                    (a, imp, s.spawn(move || self.stage(a, imp, &dir)))
                })
                .collect();
            handles
                .into_iter()
                .map(|(a, imp, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        Err(ExportError::WorkerPanicked {
                            addon: a.name().to_owned(),
                            implementation: imp.name.clone(),
                        })
                    })
                })
                .collect()
        })
    }

    /// Discover one implementation's content and write its layer payloads
    /// into `work`.
    #[allow(clippy::too_many_lines)]
    fn stage(
        &self,
        addon: &Addon,
        implementation: &Implementation,
        work: &Path,
    ) -> Result<StagedImplementation, ExportError> {
        self.checkpoint()?;
        let ctx = Context::new(addon, implementation);
        debug!("staging {}", implementation.addons_cmd_name);

        if !implementation.directory.is_dir() {
            return Err(ExportError::MissingContent {
                addon: ctx.addon,
                implementation: ctx.implementation,
                reason: format!("directory {} not found", implementation.directory.display()),
            });
        }
        fs::create_dir_all(work)?;
        let mut layers = Vec::new();

        let include = script_filter(addon, implementation);
        if has_files(&implementation.directory, &include) {
            let path = work.join(SCRIPTS_LAYER);
            let file = BufWriter::new(File::create(&path)?);
            pack_dir_gz(&implementation.directory, "", &include, file)
                .map_err(|source| ctx.layer(source))?
                .flush()?;
            layers.push(StagedLayer {
                media_type: media_types::SCRIPTS,
                title: SCRIPTS_LAYER,
                path,
            });
        }

        let linux_images = implementation
            .linux_images()
            .map_err(|source| ExportError::Images {
                addon: ctx.addon.clone(),
                implementation: ctx.implementation.clone(),
                source,
            })?;
        let windows_images = implementation.windows_images();
        for (os, images, media_type, title) in [
            (NodeOs::Linux, linux_images, media_types::IMAGES_LINUX, IMAGES_LINUX_LAYER),
            (NodeOs::Windows, windows_images, media_types::IMAGES_WINDOWS, IMAGES_WINDOWS_LAYER),
        ] {
            if images.is_empty() {
                continue;
            }
            let images: Vec<String> = images.into_iter().collect();
            let dir = work.join(format!("images-{os}"));
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(IMAGES_FILE), serde_json::to_vec_pretty(&images)?)?;
            let saved = self
                .archiver
                .save(os, &images, &dir)
                .map_err(|source| ExportError::Node {
                    addon: ctx.addon.clone(),
                    implementation: ctx.implementation.clone(),
                    source,
                })?;
            debug!(
                "{}: {} {os} image(s), {} archive(s) via {}",
                implementation.addons_cmd_name,
                images.len(),
                saved.len(),
                self.archiver.name()
            );
            let path = work.join(title);
            pack_dir(&dir, "", &|_| true, BufWriter::new(File::create(&path)?))
                .map_err(|source| ctx.layer(source))?
                .flush()?;
            layers.push(StagedLayer {
                media_type,
                title,
                path,
            });
        }

        let packages = PackageSet::from_offline_usage(&implementation.offline_usage);
        if !packages.is_empty() {
            let dir = work.join("packages");
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(PACKAGES_FILE), serde_json::to_vec_pretty(&packages)?)?;
            if let Some(cache) = &self.package_cache {
                collect_cached_packages(&packages, cache, &dir)?;
            }
            let path = work.join(PACKAGES_LAYER);
            pack_dir_gz(&dir, "", &|_| true, BufWriter::new(File::create(&path)?))
                .map_err(|source| ctx.layer(source))?
                .flush()?;
            layers.push(StagedLayer {
                media_type: media_types::PACKAGES,
                title: PACKAGES_LAYER,
                path,
            });
        }

        let config = filtered_manifest(addon, implementation).map_err(|reason| {
            ExportError::Config {
                addon: ctx.addon.clone(),
                implementation: ctx.implementation.clone(),
                reason,
            }
        })?;

        Ok(StagedImplementation {
            config: config.into_bytes(),
            layers,
        })
    }

    /// Put the staged layers, config and manifest into the blob store and
    /// return the index entry for the manifest.
    fn store_implementation(
        &self,
        blobs: &BlobStore,
        addon: &Addon,
        implementation: &Implementation,
        staged: &StagedImplementation,
    ) -> Result<Descriptor, ExportError> {
        let mut layers = Vec::with_capacity(staged.layers.len());
        for layer in &staged.layers {
            let (digest, size) = blobs.put_file(&layer.path)?;
            layers.push(
                Descriptor::new(layer.media_type, digest, size)
                    .with_annotation(annotations::TITLE, layer.title),
            );
        }
        let (config_digest, config_size) = blobs.put(&staged.config)?;
        let config = Descriptor::new(media_types::CONFIG, config_digest, config_size);

        let mut identity = BTreeMap::new();
        identity.insert(annotations::ADDON_NAME.to_owned(), addon.name().to_owned());
        identity.insert(
            annotations::IMPLEMENTATION.to_owned(),
            implementation.name.clone(),
        );
        identity.insert(
            annotations::DIRECTORY.to_owned(),
            self.catalog.relative_directory(addon),
        );
        identity.insert(
            annotations::VERSION.to_owned(),
            self.config.tool_version.clone(),
        );

        let mut manifest = ImageManifest::new(config, layers);
        manifest.annotations.clone_from(&identity);
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let (digest, size) = blobs.put(&bytes)?;
        debug!(
            "{}: manifest {digest} with {} layer(s)",
            implementation.addons_cmd_name,
            manifest.layers.len()
        );

        let mut entry =
            Descriptor::new(media_types::MANIFEST, digest, size).with_annotations(&identity);
        entry.artifact_type = Some(media_types::ADDON_ARTIFACT.to_owned());
        Ok(entry)
    }
}

struct Context {
    addon: String,
    implementation: String,
}

impl Context {
    fn new(addon: &Addon, implementation: &Implementation) -> Self {
        Self {
            addon: addon.name().to_owned(),
            implementation: implementation.name.clone(),
        }
    }

    fn layer(&self, source: k2s_addons_store::StoreError) -> ExportError {
        ExportError::Layer {
            addon: self.addon.clone(),
            implementation: self.implementation.clone(),
            source,
        }
    }
}

/// Top-level exclusions for the scripts layer: the manifest, the schema,
/// packaging leftovers and, for an implementation living in the addon
/// directory itself, the subdirectories of its sibling implementations.
fn script_filter<'a>(
    addon: &'a Addon,
    implementation: &'a Implementation,
) -> impl Fn(&Path) -> bool + 'a {
    let siblings: Vec<&str> = if implementation.is_nested_in(&addon.directory) {
        Vec::new()
    } else {
        addon
            .implementations()
            .iter()
            .filter(|o| o.name != implementation.name && o.is_nested_in(&addon.directory))
            .map(|o| o.name.as_str())
            .collect()
    };
    move |rel: &Path| {
        if rel.components().count() != 1 {
            return true;
        }
        let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        name != MANIFEST_FILE_NAME
            && name != MANIFEST_SCHEMA_FILE_NAME
            && !is_transient_file(name)
            && !siblings.contains(&name)
    }
}

fn has_files(root: &Path, include: &dyn Fn(&Path) -> bool) -> bool {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.path().strip_prefix(root).is_ok_and(include))
        .filter_map(Result::ok)
        .any(|e| !e.file_type().is_dir())
}

/// The addon manifest reduced to one implementation, keeping the original
/// key order.
fn filtered_manifest(addon: &Addon, implementation: &Implementation) -> Result<String, String> {
    let text = fs::read_to_string(&addon.manifest_path)
        .map_err(|e| format!("cannot read {}: {e}", addon.manifest_path.display()))?;
    let mut doc: Value = serde_yaml::from_str(&text)
        .map_err(|e| format!("cannot parse {}: {e}", addon.manifest_path.display()))?;
    let list = doc
        .get_mut("spec")
        .and_then(|s| s.get_mut("implementations"))
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| "manifest has no spec.implementations list".to_owned())?;
    list.retain(|i| i.get("name").and_then(Value::as_str) == Some(implementation.name.as_str()));
    if list.len() != 1 {
        return Err(format!(
            "expected one implementation '{}' in {}, found {}",
            implementation.name,
            addon.manifest_path.display(),
            list.len()
        ));
    }
    serde_yaml::to_string(&doc).map_err(|e| e.to_string())
}

/// Copy whatever the cache holds for `packages` into the layer directory.
fn collect_cached_packages(
    packages: &PackageSet,
    cache: &Path,
    dest: &Path,
) -> Result<(), std::io::Error> {
    let mut wanted: Vec<PathBuf> = Vec::new();
    wanted.extend(
        packages
            .linux
            .curl
            .iter()
            .map(|p| Path::new("linuxpackages").join(url_basename(&p.url))),
    );
    wanted.extend(
        packages
            .windows
            .curl
            .iter()
            .map(|p| Path::new("windowspackages").join(url_basename(&p.url))),
    );
    wanted.extend(
        packages
            .linux
            .deb
            .iter()
            .map(|name| Path::new("debianpackages").join(name)),
    );
    for rel in wanted {
        let source = cache.join(&rel);
        if source.exists() {
            copy_tree(&source, &dest.join(&rel))?;
        } else {
            debug!("package cache has no {}", rel.display());
        }
    }
    Ok(())
}
