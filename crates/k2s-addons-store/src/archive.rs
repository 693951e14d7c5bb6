//! Deterministic tar and tar.gz packing for artifact layers.
//!
//! Determinism guarantees:
//! - Entries sorted lexicographically by relative path
//! - All timestamps set to 0 (Unix epoch), gzip header mtime 0
//! - All ownership set to 0:0
//! - Modes normalized: 0o755 for directories and executables, 0o644 otherwise

use crate::StoreError;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;

/// Archive a directory tree.
///
/// `prefix`, when non-empty, becomes the top-level directory of every entry.
/// `include` receives each path relative to `source_dir`; returning `false`
/// for a directory skips its whole subtree.
pub fn pack_dir<W: Write>(
    source_dir: &Path,
    prefix: &str,
    include: &dyn Fn(&Path) -> bool,
    writer: W,
) -> Result<W, StoreError> {
    let mut entries = Vec::new();
    collect_entries(source_dir, source_dir, include, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut ar = tar::Builder::new(writer);
    ar.follow_symlinks(false);

    if !prefix.is_empty() {
        append_dir(&mut ar, prefix)?;
    }

    for (rel, full) in &entries {
        let name = if prefix.is_empty() {
            rel.clone()
        } else {
            format!("{prefix}/{rel}")
        };
        let ft = match full.symlink_metadata() {
            Ok(m) => m.file_type(),
            Err(e) => {
                warn!("skipping {rel}: metadata error: {e}");
                continue;
            }
        };

        if ft.is_file() {
            append_file(&mut ar, &name, full)?;
        } else if ft.is_dir() {
            append_dir(&mut ar, &name)?;
        } else if ft.is_symlink() {
            append_symlink(&mut ar, &name, full)?;
        } else {
            warn!("skipping unsupported file type: {rel}");
        }
    }

    Ok(ar.into_inner()?)
}

/// Gzip-compressed variant of [`pack_dir`].
pub fn pack_dir_gz<W: Write>(
    source_dir: &Path,
    prefix: &str,
    include: &dyn Fn(&Path) -> bool,
    writer: W,
) -> Result<W, StoreError> {
    let gz = GzBuilder::new().mtime(0).write(writer, Compression::default());
    let gz = pack_dir(source_dir, prefix, include, gz)?;
    Ok(gz.finish()?)
}

/// Extract a tar stream into `target_dir`.
pub fn unpack<R: Read>(reader: R, target_dir: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(target_dir)?;
    let mut ar = tar::Archive::new(reader);
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);
    ar.unpack(target_dir)?;
    Ok(())
}

/// Extract a gzip-compressed tar stream into `target_dir`.
pub fn gunzip_unpack<R: Read>(reader: R, target_dir: &Path) -> Result<(), StoreError> {
    unpack(GzDecoder::new(reader), target_dir)
}

/// Recursively collect (relative_path, full_path) pairs, relative paths `/`-separated.
fn collect_entries(
    root: &Path,
    current: &Path,
    include: &dyn Fn(&Path) -> bool,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), StoreError> {
    if !current.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let full = entry.path();
        let rel_path = full
            .strip_prefix(root)
            .map_err(|e| StoreError::Io(std::io::Error::other(format!("path strip: {e}"))))?;
        if !include(rel_path) {
            continue;
        }
        let rel = rel_path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            out.push((rel, full.clone()));
            collect_entries(root, &full, include, out)?;
        } else {
            out.push((rel, full));
        }
    }
    Ok(())
}

fn new_header(entry_type: tar::EntryType, mode: u32) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(mode);
    header
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

fn append_file<W: Write>(
    ar: &mut tar::Builder<W>,
    name: &str,
    full_path: &Path,
) -> Result<(), StoreError> {
    let meta = full_path.metadata()?;
    let mode = if is_executable(&meta) {
        EXEC_MODE
    } else {
        FILE_MODE
    };
    let mut header = new_header(tar::EntryType::Regular, mode);
    header.set_size(meta.len());
    header.set_cksum();
    ar.append_data(&mut header, name, File::open(full_path)?)?;
    Ok(())
}

fn append_dir<W: Write>(ar: &mut tar::Builder<W>, name: &str) -> Result<(), StoreError> {
    let mut header = new_header(tar::EntryType::Directory, DIR_MODE);
    header.set_size(0);
    header.set_cksum();
    let path = if name.ends_with('/') {
        name.to_owned()
    } else {
        format!("{name}/")
    };
    ar.append_data(&mut header, &path, &[] as &[u8])?;
    Ok(())
}

fn append_symlink<W: Write>(
    ar: &mut tar::Builder<W>,
    name: &str,
    full_path: &Path,
) -> Result<(), StoreError> {
    let target = fs::read_link(full_path)?;
    let mut header = new_header(tar::EntryType::Symlink, EXEC_MODE);
    header.set_size(0);
    header.set_cksum();
    ar.append_link(&mut header, name, &target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(dir: &Path) {
        fs::create_dir_all(dir.join("manifests/sub")).unwrap();
        fs::write(dir.join("Enable.ps1"), "Write-Output enable").unwrap();
        fs::write(dir.join("manifests/deployment.yaml"), "kind: Deployment").unwrap();
        fs::write(dir.join("manifests/sub/values.yaml"), "a: 1").unwrap();
        fs::write(dir.join("addon.manifest.yaml"), "apiVersion: v1").unwrap();
    }

    fn names(tar_data: &[u8]) -> Vec<String> {
        let mut ar = tar::Archive::new(tar_data);
        ar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn pack_dir_is_sorted_and_filtered() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let data = pack_dir(
            src.path(),
            "",
            &|p: &Path| p != Path::new("addon.manifest.yaml"),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(
            names(&data),
            vec![
                "Enable.ps1",
                "manifests/",
                "manifests/deployment.yaml",
                "manifests/sub/",
                "manifests/sub/values.yaml",
            ]
        );
    }

    #[test]
    fn pack_dir_excluding_directory_skips_subtree() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let data = pack_dir(
            src.path(),
            "",
            &|p: &Path| !p.starts_with("manifests"),
            Vec::new(),
        )
        .unwrap();
        assert_eq!(names(&data), vec!["Enable.ps1", "addon.manifest.yaml"]);
    }

    #[test]
    fn pack_dir_with_prefix() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("index.json"), "{}").unwrap();
        let data = pack_dir(src.path(), "artifacts", &|_: &Path| true, Vec::new()).unwrap();
        assert_eq!(names(&data), vec!["artifacts/", "artifacts/index.json"]);
    }

    #[test]
    fn pack_dir_gz_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let a = pack_dir_gz(src.path(), "", &|_: &Path| true, Vec::new()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(src.path().join("Enable.ps1"), "Write-Output enable").unwrap();
        let b = pack_dir_gz(src.path(), "", &|_: &Path| true, Vec::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gz_roundtrip_restores_content() {
        let src = tempfile::tempdir().unwrap();
        sample_tree(src.path());
        let data = pack_dir_gz(src.path(), "", &|_: &Path| true, Vec::new()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        gunzip_unpack(data.as_slice(), dst.path()).unwrap();
        assert_eq!(
            fs::read_to_string(dst.path().join("manifests/sub/values.yaml")).unwrap(),
            "a: 1"
        );
        assert_eq!(
            fs::read_to_string(dst.path().join("Enable.ps1")).unwrap(),
            "Write-Output enable"
        );
    }

    #[test]
    fn modes_are_normalized() {
        use std::os::unix::fs::PermissionsExt;
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("run.sh"), "#!/bin/sh").unwrap();
        fs::write(src.path().join("data.txt"), "x").unwrap();
        fs::set_permissions(src.path().join("run.sh"), fs::Permissions::from_mode(0o700)).unwrap();
        fs::set_permissions(src.path().join("data.txt"), fs::Permissions::from_mode(0o600))
            .unwrap();

        let data = pack_dir(src.path(), "", &|_: &Path| true, Vec::new()).unwrap();
        let mut ar = tar::Archive::new(data.as_slice());
        let modes: Vec<(String, u32)> = ar
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().to_string_lossy().to_string(),
                    e.header().mode().unwrap(),
                )
            })
            .collect();
        assert_eq!(
            modes,
            vec![("data.txt".to_owned(), 0o644), ("run.sh".to_owned(), 0o755)]
        );
    }
}
