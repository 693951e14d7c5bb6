use crate::concurrency::{AddonsLock, Cancellation};
use crate::merge::merge_implementation;
use crate::{copy_tree, is_transient_file, url_basename, ImportError};
use k2s_addons_node::{ImageLoader, NodeOs, PackageInstaller, PackageSet};
use k2s_addons_schema::{
    Addon, ADDONS_DIR_NAME, MANIFEST_FILE_NAME, MANIFEST_SCHEMA_FILE_NAME,
};
use k2s_addons_store::{
    annotations, gunzip_unpack, media_types, unpack, ArtifactLayout, BlobStore, Descriptor,
    Digest, ExportType, ImageManifest, StoreError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const LOCK_FILE: &str = ".addons.lock";
const STAGING_PREFIX: &str = ".k2s-import-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportedImplementation {
    pub addon: String,
    pub implementation: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedImplementation {
    pub addon: String,
    pub implementation: String,
    pub error: String,
}

/// Per-implementation outcome of one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: Vec<ImportedImplementation>,
    pub failed: Vec<FailedImplementation>,
    /// `addon implementation` pairs left out by the name filter.
    pub skipped: Vec<String>,
    pub cancelled: bool,
    /// Scope recorded in the artifact's `addons.json`, when present.
    pub export_type: Option<ExportType>,
}

impl ImportReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Unpacked content of one implementation, ready for the collaborators.
#[derive(Default)]
struct Prepared {
    scripts: Option<PathBuf>,
    linux_images: Option<(Vec<String>, PathBuf)>,
    windows_images: Option<(Vec<String>, PathBuf)>,
    packages: Option<(PackageSet, PathBuf)>,
}

/// Materializes addon artifacts into `<install>/addons`.
///
/// The whole run holds the addon tree lock. Each implementation is resolved
/// and unpacked in scratch space first, handed to the image loader and
/// package installer, and only then committed to the live tree, so a failure
/// or cancellation before the commit leaves the installation untouched.
pub struct ArtifactImporter {
    install_dir: PathBuf,
    loader: Arc<dyn ImageLoader>,
    installer: Arc<dyn PackageInstaller>,
    cancel: Cancellation,
}

impl ArtifactImporter {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        loader: Arc<dyn ImageLoader>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            loader,
            installer,
            cancel: Cancellation::new(),
        }
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn addons_dir(&self) -> PathBuf {
        self.install_dir.join(ADDONS_DIR_NAME)
    }

    /// Import every implementation in `artifact`, or only those of the addons
    /// named in `names` when it is non-empty.
    pub fn import(&self, artifact: &Path, names: &[String]) -> Result<ImportReport, ImportError> {
        let addons_dir = self.addons_dir();
        let _lock = AddonsLock::acquire(&addons_dir.join(LOCK_FILE)).map_err(ImportError::Lock)?;

        let extract_err = |source: StoreError| ImportError::Extract {
            path: artifact.to_path_buf(),
            source,
        };
        let scratch = tempfile::tempdir().map_err(|e| extract_err(e.into()))?;
        let file = File::open(artifact).map_err(|e| extract_err(e.into()))?;
        unpack(BufReader::new(file), scratch.path()).map_err(extract_err)?;

        let layout = ArtifactLayout::under(scratch.path());
        layout.verify().map_err(ImportError::InvalidLayout)?;
        let index = layout.read_index().map_err(ImportError::InvalidLayout)?;
        info!(
            "importing {} from {} (tool version {})",
            index.manifests.len(),
            artifact.display(),
            index.tool_version().unwrap_or("unknown")
        );

        let export_type = match layout.read_metadata() {
            Ok(metadata) => {
                debug!(
                    "{:?} export of {} implementation(s) by K2s {}",
                    metadata.export_type,
                    metadata.addons.len(),
                    metadata.k2s_version
                );
                Some(metadata.export_type)
            }
            Err(e) => {
                warn!("artifact metadata unreadable, continuing with the index: {e}");
                None
            }
        };

        let blobs = BlobStore::new(layout);
        let work_root = scratch.path().join("work");
        let mut report = ImportReport {
            export_type,
            ..ImportReport::default()
        };
        for (n, entry) in index.manifests.iter().enumerate() {
            let addon = entry.annotation(annotations::ADDON_NAME).unwrap_or_default();
            let implementation = entry
                .annotation(annotations::IMPLEMENTATION)
                .unwrap_or_default();
            if !names.is_empty() && !names.iter().any(|name| name == addon) {
                debug!("skipping {addon} {implementation}: not selected");
                report.skipped.push(format!("{addon} {implementation}"));
                continue;
            }
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let ctx = Ctx {
                addon,
                implementation,
            };
            match self.import_one(&blobs, entry, &ctx, &work_root.join(n.to_string())) {
                Ok(directory) => {
                    info!("imported {addon} {implementation} into {}", directory.display());
                    report.imported.push(ImportedImplementation {
                        addon: addon.to_owned(),
                        implementation: implementation.to_owned(),
                        directory,
                    });
                }
                Err(ImportError::Cancelled { .. }) => {
                    info!("import cancelled before committing {addon} {implementation}");
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    warn!("{e}");
                    report.failed.push(FailedImplementation {
                        addon: addon.to_owned(),
                        implementation: implementation.to_owned(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_lines)]
    fn import_one(
        &self,
        blobs: &BlobStore,
        entry: &Descriptor,
        ctx: &Ctx<'_>,
        work: &Path,
    ) -> Result<PathBuf, ImportError> {
        if ctx.addon.is_empty() || ctx.implementation.is_empty() {
            return Err(ctx.invalid("index entry lacks addon name or implementation annotation"));
        }

        // resolve
        let manifest: ImageManifest = serde_json::from_slice(&ctx.fetch(blobs, &entry.digest)?)
            .map_err(|e| ctx.invalid(format!("manifest blob: {e}")))?;
        manifest.validate().map_err(|reason| ctx.invalid(reason))?;
        let directory = manifest
            .annotations
            .get(annotations::DIRECTORY)
            .or_else(|| entry.annotations.get(annotations::DIRECTORY))
            .map_or(ctx.addon, String::as_str);
        let rel_dir = safe_relative(directory).ok_or_else(|| ctx.unsafe_path(directory))?;

        let config = String::from_utf8(ctx.fetch(blobs, &manifest.config.digest)?)
            .map_err(|e| ctx.invalid(format!("config blob: {e}")))?;
        let fragment: Addon = serde_yaml::from_str(&config)
            .map_err(|e| ctx.invalid(format!("config blob: {e}")))?;
        if fragment.name() != ctx.addon || fragment.implementation(ctx.implementation).is_none() {
            return Err(ctx.invalid(format!(
                "config describes addon '{}' without implementation '{}'",
                fragment.name(),
                ctx.implementation
            )));
        }
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            layers.push((layer, ctx.open(blobs, &layer.digest)?));
        }

        // prepare
        fs::create_dir_all(work).map_err(|e| ctx.io(e))?;
        let mut prepared = Prepared::default();
        for (layer, file) in layers {
            let reader = BufReader::new(file);
            match layer.media_type.as_str() {
                media_types::SCRIPTS => {
                    let dir = work.join("scripts");
                    gunzip_unpack(reader, &dir).map_err(|e| ctx.layer(e))?;
                    prepared.scripts = Some(dir);
                }
                media_types::IMAGES_LINUX => {
                    let dir = work.join("images-linux");
                    unpack(reader, &dir).map_err(|e| ctx.layer(e))?;
                    prepared.linux_images = Some((ctx.read_json(&dir.join("images.json"))?, dir));
                }
                media_types::IMAGES_WINDOWS => {
                    let dir = work.join("images-windows");
                    unpack(reader, &dir).map_err(|e| ctx.layer(e))?;
                    prepared.windows_images =
                        Some((ctx.read_json(&dir.join("images.json"))?, dir));
                }
                media_types::PACKAGES => {
                    let dir = work.join("packages");
                    gunzip_unpack(reader, &dir).map_err(|e| ctx.layer(e))?;
                    prepared.packages = Some((ctx.read_json(&dir.join("packages.json"))?, dir));
                }
                other => warn!(
                    "{} {}: ignoring layer with media type {other}",
                    ctx.addon, ctx.implementation
                ),
            }
        }
        self.checkpoint(ctx)?;

        // collaborators
        for (os, images) in [
            (NodeOs::Linux, &prepared.linux_images),
            (NodeOs::Windows, &prepared.windows_images),
        ] {
            if let Some((images, dir)) = images {
                debug!("loading {} {os} image(s) via {}", images.len(), self.loader.name());
                self.loader
                    .load(os, images, dir)
                    .map_err(|source| ctx.node(source))?;
            }
        }
        if let Some((packages, dir)) = &prepared.packages {
            if packages.has_linux_packages() {
                self.installer
                    .install(packages, dir)
                    .map_err(|source| ctx.node(source))?;
            }
            self.place_windows_packages(packages, dir, ctx)?;
        }
        self.checkpoint(ctx)?;

        // commit
        let addon_dir = self.addons_dir().join(rel_dir);
        let implementation_dir = if ctx.implementation == ctx.addon {
            addon_dir.clone()
        } else {
            addon_dir.join(ctx.implementation)
        };
        let manifest_path = addon_dir.join(MANIFEST_FILE_NAME);
        let manifest_text = if manifest_path.is_file() {
            let installed = fs::read_to_string(&manifest_path).map_err(|e| ctx.io(e))?;
            merge_implementation(&installed, &config, ctx.implementation).map_err(|source| {
                ImportError::MergeConflict {
                    addon: ctx.addon.to_owned(),
                    implementation: ctx.implementation.to_owned(),
                    path: manifest_path.clone(),
                    source,
                }
            })?
        } else {
            config
        };

        let merged: Addon = serde_yaml::from_str(&manifest_text)
            .map_err(|e| ctx.invalid(format!("merged manifest: {e}")))?;
        let siblings: BTreeSet<&str> = merged
            .spec
            .implementations
            .iter()
            .map(|i| i.name.as_str())
            .filter(|name| *name != ctx.implementation)
            .collect();

        // Stage the manifest and scripts beside the live tree first; the
        // manifest rename is the last step.
        fs::create_dir_all(&addon_dir).map_err(|e| ctx.io(e))?;
        let mut staged_manifest = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(&addon_dir)
            .map_err(|e| ctx.io(e))?;
        staged_manifest
            .write_all(manifest_text.as_bytes())
            .map_err(|e| ctx.io(e))?;
        staged_manifest.as_file().sync_all().map_err(|e| ctx.io(e))?;
        let staged_scripts = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&addon_dir)
            .map_err(|e| ctx.io(e))?;
        if let Some(scripts) = &prepared.scripts {
            copy_tree(scripts, staged_scripts.path()).map_err(|e| ctx.io(e))?;
        }

        let mut swap = ScriptSwap::new(&addon_dir).map_err(|e| ctx.io(e))?;
        let replaced = if implementation_dir == addon_dir {
            swap.replace_shared(staged_scripts.path(), &addon_dir, &siblings)
        } else {
            swap.replace_dir(staged_scripts.path(), &implementation_dir)
        };
        let committed = replaced.and_then(|()| {
            staged_manifest
                .persist(&manifest_path)
                .map(drop)
                .map_err(|e| e.error)
        });
        if let Err(e) = committed {
            if let Err(undo) = swap.rollback() {
                warn!(
                    "{} {}: previous scripts could not be restored: {undo}",
                    ctx.addon, ctx.implementation
                );
            }
            return Err(ctx.io(e));
        }

        remove_transient_files(&addon_dir).map_err(|e| ctx.io(e))?;
        if implementation_dir != addon_dir {
            remove_transient_files(&implementation_dir).map_err(|e| ctx.io(e))?;
        }
        Ok(implementation_dir)
    }

    fn checkpoint(&self, ctx: &Ctx<'_>) -> Result<(), ImportError> {
        if self.cancel.is_cancelled() {
            return Err(ImportError::Cancelled {
                addon: ctx.addon.to_owned(),
                implementation: ctx.implementation.to_owned(),
            });
        }
        Ok(())
    }

    /// Windows curl packages go straight to their declared destination,
    /// relative to the install directory.
    fn place_windows_packages(
        &self,
        packages: &PackageSet,
        dir: &Path,
        ctx: &Ctx<'_>,
    ) -> Result<(), ImportError> {
        for package in &packages.windows.curl {
            let source = dir.join("windowspackages").join(url_basename(&package.url));
            if !source.is_file() {
                warn!(
                    "{} {}: artifact does not carry {}; skipping",
                    ctx.addon, ctx.implementation, package.url
                );
                continue;
            }
            let rel = safe_relative(&package.destination)
                .ok_or_else(|| ctx.unsafe_path(&package.destination))?;
            copy_tree(&source, &self.install_dir.join(rel)).map_err(|e| ctx.io(e))?;
            debug!("placed {}", package.destination);
        }
        Ok(())
    }
}

/// Addon and implementation an error is attributed to.
struct Ctx<'a> {
    addon: &'a str,
    implementation: &'a str,
}

impl Ctx<'_> {
    fn invalid(&self, reason: impl Into<String>) -> ImportError {
        ImportError::InvalidManifest {
            addon: self.addon.to_owned(),
            implementation: self.implementation.to_owned(),
            reason: reason.into(),
        }
    }

    fn layer(&self, e: StoreError) -> ImportError {
        self.invalid(format!("cannot unpack layer: {e}"))
    }

    fn unsafe_path(&self, path: &str) -> ImportError {
        ImportError::UnsafePath {
            addon: self.addon.to_owned(),
            implementation: self.implementation.to_owned(),
            path: path.to_owned(),
        }
    }

    fn io(&self, source: std::io::Error) -> ImportError {
        ImportError::Io {
            addon: self.addon.to_owned(),
            implementation: self.implementation.to_owned(),
            source,
        }
    }

    fn node(&self, source: k2s_addons_node::NodeError) -> ImportError {
        ImportError::Node {
            addon: self.addon.to_owned(),
            implementation: self.implementation.to_owned(),
            source,
        }
    }

    fn blob(&self, digest: &Digest, e: StoreError) -> ImportError {
        match e {
            StoreError::BlobNotFound(_) => ImportError::MissingBlob {
                addon: self.addon.to_owned(),
                implementation: self.implementation.to_owned(),
                digest: digest.to_string(),
            },
            StoreError::IntegrityFailure { .. } => ImportError::BlobIntegrity {
                addon: self.addon.to_owned(),
                implementation: self.implementation.to_owned(),
                digest: digest.to_string(),
            },
            other => self.invalid(other.to_string()),
        }
    }

    fn fetch(&self, blobs: &BlobStore, digest: &Digest) -> Result<Vec<u8>, ImportError> {
        blobs.get(digest).map_err(|e| self.blob(digest, e))
    }

    fn open(&self, blobs: &BlobStore, digest: &Digest) -> Result<File, ImportError> {
        blobs.open(digest).map_err(|e| self.blob(digest, e))
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, ImportError> {
        let data = fs::read(path).map_err(|e| self.io(e))?;
        serde_json::from_slice(&data)
            .map_err(|e| self.invalid(format!("{}: {e}", path.display())))
    }
}

/// `path` as a relative path that cannot leave its base directory.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let p = Path::new(path);
    if path.is_empty() || !p.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(p.to_path_buf())
}

/// Moves the live scripts of one implementation aside while staged ones
/// take their place, so a failed commit can put them back. The old content
/// is deleted when the swap is dropped.
struct ScriptSwap {
    backup: tempfile::TempDir,
    /// (backup location, live location) of every entry moved aside.
    moved: Vec<(PathBuf, PathBuf)>,
    placed: Vec<PathBuf>,
}

impl ScriptSwap {
    fn new(addon_dir: &Path) -> Result<Self, std::io::Error> {
        Ok(Self {
            backup: tempfile::Builder::new()
                .prefix(STAGING_PREFIX)
                .tempdir_in(addon_dir)?,
            moved: Vec::new(),
            placed: Vec::new(),
        })
    }

    fn move_aside(&mut self, live: PathBuf) -> Result<(), std::io::Error> {
        let aside = self.backup.path().join(self.moved.len().to_string());
        fs::rename(&live, &aside)?;
        self.moved.push((aside, live));
        Ok(())
    }

    fn place(&mut self, staged: &Path, live: PathBuf) -> Result<(), std::io::Error> {
        fs::rename(staged, &live)?;
        self.placed.push(live);
        Ok(())
    }

    /// Swap `dest` for the staged directory. Files only in the old tree do
    /// not survive.
    fn replace_dir(&mut self, staged: &Path, dest: &Path) -> Result<(), std::io::Error> {
        if dest.exists() {
            self.move_aside(dest.to_path_buf())?;
        }
        self.place(staged, dest.to_path_buf())
    }

    /// Replace the scripts of an implementation that lives directly in the
    /// addon directory. The manifest, the schema file, staging entries and
    /// the nested directories of `siblings` are left alone.
    fn replace_shared(
        &mut self,
        staged: &Path,
        addon_dir: &Path,
        siblings: &BTreeSet<&str>,
    ) -> Result<(), std::io::Error> {
        for entry in fs::read_dir(addon_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == MANIFEST_FILE_NAME
                || name == MANIFEST_SCHEMA_FILE_NAME
                || name.starts_with(STAGING_PREFIX)
                || siblings.contains(name)
            {
                continue;
            }
            self.move_aside(entry.path())?;
        }
        for entry in fs::read_dir(staged)? {
            let entry = entry?;
            self.place(&entry.path(), addon_dir.join(entry.file_name()))?;
        }
        Ok(())
    }

    /// Undo every move made so far, newest first.
    fn rollback(self) -> Result<(), std::io::Error> {
        for live in &self.placed {
            if live.is_dir() {
                fs::remove_dir_all(live)?;
            } else {
                fs::remove_file(live)?;
            }
        }
        for (aside, live) in self.moved.iter().rev() {
            fs::rename(aside, live)?;
        }
        Ok(())
    }
}

/// Delete packaging leftovers directly inside `dir`; subdirectories are not
/// visited.
fn remove_transient_files(dir: &Path) -> Result<(), std::io::Error> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if entry.file_type()?.is_file() && name.to_str().is_some_and(is_transient_file) {
            debug!("removing {}", entry.path().display());
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
