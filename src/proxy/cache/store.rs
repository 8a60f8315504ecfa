use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::proxy::error::ProxyError;

/// Write handle passed to a resolver. The resolver must call
/// [`fill`] exactly once; the write goes to a temp file and lands
/// atomically under the entry's fingerprint name, so readers never
/// observe a partial body.
///
/// [`fill`]: EntryWriter::fill
#[derive(Debug)]
pub struct EntryWriter {
    path: PathBuf,
    filled: bool,
}

impl EntryWriter {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            filled: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(super) fn is_filled(&self) -> bool {
        self.filled
    }

    /// Persist the fetched bytes. A second call is a contract
    /// violation and fails without touching the file again.
    pub async fn fill(&mut self, bytes: &[u8]) -> Result<(), ProxyError> {
        if self.filled {
            return Err(ProxyError::CacheIo(
                "resolver wrote the entry twice".to_string(),
            ));
        }
        write_atomically(&self.path, bytes).await?;
        self.filled = true;
        Ok(())
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), ProxyError> {
    let temp_path = temp_path_for(path)?;
    let mut file = fs::File::create(&temp_path)
        .await
        .map_err(|err| ProxyError::CacheIo(format!("create {}: {err}", temp_path.display())))?;
    file.write_all(bytes)
        .await
        .map_err(|err| ProxyError::CacheIo(format!("write {}: {err}", temp_path.display())))?;
    file.flush()
        .await
        .map_err(|err| ProxyError::CacheIo(format!("flush {}: {err}", temp_path.display())))?;
    drop(file);
    fs::rename(&temp_path, path)
        .await
        .map_err(|err| ProxyError::CacheIo(format!("rename into {}: {err}", path.display())))
}

fn temp_path_for(path: &Path) -> Result<PathBuf, ProxyError> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ProxyError::CacheIo(format!("bad cache path {}", path.display())))?;
    Ok(path.with_file_name(format!("tmp_{name}")))
}

/// Read a materialized entry back in full.
pub(super) async fn read_entry(path: &Path) -> Result<Vec<u8>, ProxyError> {
    fs::read(path)
        .await
        .map_err(|err| ProxyError::CacheIo(format!("read {}: {err}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::{EntryWriter, read_entry};
    use crate::proxy::error::ProxyError;

    #[tokio::test]
    async fn fill_lands_bytes_under_final_name() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("ab".repeat(16));
        let mut writer = EntryWriter::new(path.clone());
        writer.fill(b"response bytes").await.unwrap();
        assert!(writer.is_filled());
        assert_eq!(read_entry(&path).await.unwrap(), b"response bytes");
        // No temp residue.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn double_fill_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut writer = EntryWriter::new(dir.path().join("entry"));
        writer.fill(b"first").await.unwrap();
        let err = writer.fill(b"second").await.unwrap_err();
        assert!(matches!(err, ProxyError::CacheIo(_)), "got {err:?}");
        assert_eq!(
            read_entry(&dir.path().join("entry")).await.unwrap(),
            b"first"
        );
    }

    #[tokio::test]
    async fn fill_replaces_previous_contents() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("entry");
        tokio::fs::write(&path, b"old").await.unwrap();
        let mut writer = EntryWriter::new(path.clone());
        writer.fill(b"new").await.unwrap();
        assert_eq!(read_entry(&path).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn read_missing_entry_is_cache_io_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = read_entry(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, ProxyError::CacheIo(_)), "got {err:?}");
    }
}
