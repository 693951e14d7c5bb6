use crate::layout::ArtifactLayout;
use crate::types::Digest;
use crate::{fsync_dir, StoreError};
use std::fs::{self, File};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Write-once, SHA-256 addressed blob store under `blobs/sha256/`.
///
/// Every put checks for an existing blob first, so a payload shared by
/// several manifests is stored once. Reads recompute the digest.
pub struct BlobStore {
    layout: ArtifactLayout,
}

impl BlobStore {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Store an in-memory payload and return its digest and size.
    pub fn put(&self, data: &[u8]) -> Result<(Digest, u64), StoreError> {
        let digest = Digest::of(data);
        let size = data.len() as u64;
        let dest = self.layout.blob_path(&digest);
        if dest.exists() {
            debug!("blob {digest} already stored");
            return Ok((digest, size));
        }

        let dir = self.layout.blobs_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok((digest, size))
    }

    /// Store the content of a file, streaming it through the hasher.
    pub fn put_file(&self, source: &Path) -> Result<(Digest, u64), StoreError> {
        let (digest, size) = Digest::of_reader(BufReader::new(File::open(source)?))?;
        let dest = self.layout.blob_path(&digest);
        if dest.exists() {
            debug!("blob {digest} already stored");
            return Ok((digest, size));
        }

        let dir = self.layout.blobs_dir();
        let mut tmp = NamedTempFile::new_in(&dir)?;
        let mut src = File::open(source)?;
        std::io::copy(&mut src, tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok((digest, size))
    }

    /// Retrieve a blob, verifying integrity on read.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let path = self.existing_path(digest)?;
        let data = fs::read(&path)?;
        let actual = Digest::of(&data);
        if actual != *digest {
            return Err(StoreError::IntegrityFailure {
                digest: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Open a verified blob for streaming. The whole file is hashed before
    /// the handle is returned, rewound to the start.
    pub fn open(&self, digest: &Digest) -> Result<File, StoreError> {
        let path = self.existing_path(digest)?;
        let mut file = File::open(&path)?;
        let (actual, _) = Digest::of_reader(BufReader::new(&mut file))?;
        if actual != *digest {
            return Err(StoreError::IntegrityFailure {
                digest: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.layout.blob_path(digest).exists()
    }

    pub fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let dir = self.layout.blobs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    digests.push(Digest::parse(&format!("sha256:{name}"))?);
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    fn existing_path(&self, digest: &Digest) -> Result<PathBuf, StoreError> {
        let path = self.layout.blob_path(digest);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::BlobNotFound(digest.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn test_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = ArtifactLayout::under(dir.path());
        layout.initialize().unwrap();
        (dir, BlobStore::new(layout))
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let (digest, size) = store.put(b"hello addons").unwrap();
        assert_eq!(size, 12);
        assert_eq!(store.get(&digest).unwrap(), b"hello addons");
    }

    #[test]
    fn put_is_write_once() {
        let (_dir, store) = test_store();
        let (d1, _) = store.put(b"same").unwrap();
        let (d2, _) = store.put(b"same").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn put_file_matches_put() {
        let (dir, store) = test_store();
        let src = dir.path().join("payload.bin");
        fs::write(&src, vec![0x5Au8; 100_000]).unwrap();
        let (from_file, size) = store.put_file(&src).unwrap();
        let (from_bytes, _) = store.put(&vec![0x5Au8; 100_000]).unwrap();
        assert_eq!(from_file, from_bytes);
        assert_eq!(size, 100_000);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn get_missing_blob_fails() {
        let (_dir, store) = test_store();
        let err = store.get(&Digest::of(b"absent")).unwrap_err();
        assert!(matches!(err, StoreError::BlobNotFound(_)));
    }

    #[test]
    fn integrity_check_on_read() {
        let (_dir, store) = test_store();
        let (digest, _) = store.put(b"original").unwrap();
        fs::write(store.layout().blob_path(&digest), b"tampered").unwrap();
        assert!(matches!(
            store.get(&digest),
            Err(StoreError::IntegrityFailure { .. })
        ));
        assert!(store.open(&digest).is_err());
    }

    #[test]
    fn open_returns_rewound_handle() {
        let (_dir, store) = test_store();
        let (digest, _) = store.put(b"streamed").unwrap();
        let mut content = String::new();
        store
            .open(&digest)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "streamed");
    }

    #[test]
    fn list_empty_store() {
        let (_dir, store) = test_store();
        assert!(store.list().unwrap().is_empty());
    }
}
