use crate::backend::{
    archive_file_name, ImageArchiver, ImageLoader, NodeOs, PackageInstaller, PackageSet,
};
use crate::NodeError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory node for tests: records every call and writes placeholder
/// archives whose content is the image reference.
#[derive(Default)]
pub struct MockNode {
    saved: Mutex<Vec<(NodeOs, String)>>,
    loaded: Mutex<Vec<(NodeOs, String)>>,
    installed: Mutex<Vec<PackageSet>>,
    fail_load: AtomicBool,
    fail_install: AtomicBool,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_installs(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<(NodeOs, String)> {
        lock(&self.saved).clone()
    }

    pub fn loaded(&self) -> Vec<(NodeOs, String)> {
        lock(&self.loaded).clone()
    }

    pub fn installed(&self) -> Vec<PackageSet> {
        lock(&self.installed).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl ImageArchiver for MockNode {
    fn name(&self) -> &str {
        "mock"
    }

    fn save(
        &self,
        os: NodeOs,
        images: &[String],
        dest_dir: &Path,
    ) -> Result<Vec<PathBuf>, NodeError> {
        let mut written = Vec::with_capacity(images.len());
        for image in images {
            let path = dest_dir.join(archive_file_name(image));
            std::fs::write(&path, image.as_bytes())?;
            lock(&self.saved).push((os, image.clone()));
            written.push(path);
        }
        Ok(written)
    }
}

impl ImageLoader for MockNode {
    fn name(&self) -> &str {
        "mock"
    }

    fn load(&self, os: NodeOs, images: &[String], archive_dir: &Path) -> Result<(), NodeError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(NodeError::Rejected(format!(
                "mock loader rejected {} {os} image(s)",
                images.len()
            )));
        }
        for image in images {
            let archive = archive_dir.join(archive_file_name(image));
            let content = std::fs::read_to_string(&archive)?;
            if content != *image {
                return Err(NodeError::Rejected(format!(
                    "archive {} does not hold {image}",
                    archive.display()
                )));
            }
            lock(&self.loaded).push((os, image.clone()));
        }
        Ok(())
    }
}

impl PackageInstaller for MockNode {
    fn name(&self) -> &str {
        "mock"
    }

    fn install(&self, packages: &PackageSet, _source_dir: &Path) -> Result<(), NodeError> {
        if self.fail_install.load(Ordering::SeqCst) {
            return Err(NodeError::Rejected("mock installer rejected packages".to_owned()));
        }
        lock(&self.installed).push(packages.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_archives_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let node = MockNode::new();
        let images = vec!["a.io/one:1".to_owned()];
        let written = node.save(NodeOs::Linux, &images, dir.path()).unwrap();
        assert_eq!(written, vec![dir.path().join("a.io_one_1.tar")]);

        node.load(NodeOs::Linux, &images, dir.path()).unwrap();
        assert_eq!(node.loaded(), vec![(NodeOs::Linux, "a.io/one:1".to_owned())]);
        assert_eq!(node.saved(), node.loaded());
    }

    #[test]
    fn load_without_archive_fails() {
        let dir = tempfile::tempdir().unwrap();
        let node = MockNode::new();
        let err = node
            .load(NodeOs::Windows, &["a.io/one:1".to_owned()], dir.path())
            .unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }

    #[test]
    fn failure_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let node = MockNode::new();
        node.fail_loads(true);
        node.fail_installs(true);
        assert!(node.load(NodeOs::Linux, &[], dir.path()).is_err());
        assert!(node.install(&PackageSet::default(), dir.path()).is_err());
        node.fail_installs(false);
        node.install(&PackageSet::default(), dir.path()).unwrap();
        assert_eq!(node.installed().len(), 1);
    }
}
