use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::error::{LakeError, LakeResult};

/// Put/head/get/list over the cold store. Backed by a local filesystem
/// tree standing in for an object store; the path layout and write-once
/// semantics are identical either way.
pub trait ColdStore: Send + Sync {
    /// Writes `bytes` at `path`. When `if_absent` is true and an object
    /// already exists at `path`, the write is skipped and `Ok(false)` is
    /// returned (backfill's "never overwrite archival output" rule);
    /// otherwise the object is replaced unconditionally and `Ok(true)` is
    /// returned.
    fn put(
        &self,
        path: &str,
        bytes: &[u8],
        if_absent: bool,
    ) -> impl std::future::Future<Output = LakeResult<bool>> + Send;

    fn head(&self, path: &str) -> impl std::future::Future<Output = LakeResult<Option<u64>>> + Send;

    fn get(&self, path: &str) -> impl std::future::Future<Output = LakeResult<Option<Vec<u8>>>> + Send;

    fn list_prefix(&self, prefix: &str) -> impl std::future::Future<Output = LakeResult<Vec<String>>> + Send;
}

#[derive(Clone)]
pub struct FsColdStore {
    root: PathBuf,
    tmp_root: PathBuf,
    max_bytes: u64,
}

impl FsColdStore {
    pub fn new(root: PathBuf, tmp_root: PathBuf, max_bytes: u64) -> Self {
        Self {
            root,
            tmp_root,
            max_bytes,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    #[cfg(unix)]
    fn harden_permissions(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(metadata) = std::fs::metadata(path) {
            let mut perms = metadata.permissions();
            perms.set_mode(0o640);
            let _ = std::fs::set_permissions(path, perms);
        }
    }

    #[cfg(not(unix))]
    fn harden_permissions(_path: &Path) {}
}

impl ColdStore for FsColdStore {
    async fn put(&self, path: &str, bytes: &[u8], if_absent: bool) -> LakeResult<bool> {
        let dest = self.resolve(path);

        if if_absent {
            if let Some(size) = self.head(path).await? {
                if size > 0 {
                    return Ok(false);
                }
            }
        }

        let parent = dest
            .parent()
            .ok_or_else(|| LakeError::ColdStore(format!("invalid cold path: {path}")))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| LakeError::ColdStore(format!("mkdir {}: {err}", parent.display())))?;
        tokio::fs::create_dir_all(&self.tmp_root)
            .await
            .map_err(|err| LakeError::ColdStore(format!("mkdir tmp root: {err}")))?;

        let tmp_path = self
            .tmp_root
            .join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|err| LakeError::ColdStore(format!("create temp file: {err}")))?;
            file.write_all(bytes)
                .await
                .map_err(|err| LakeError::ColdStore(format!("write temp file: {err}")))?;
            file.sync_all()
                .await
                .map_err(|err| LakeError::ColdStore(format!("sync temp file: {err}")))?;
        }

        match tokio::fs::rename(&tmp_path, &dest).await {
            Ok(()) => {}
            Err(_) => {
                // Cross-device rename: fall back to copy + remove.
                tokio::fs::copy(&tmp_path, &dest)
                    .await
                    .map_err(|err| LakeError::ColdStore(format!("copy into place: {err}")))?;
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
        }
        Self::harden_permissions(&dest);
        Ok(true)
    }

    async fn head(&self, path: &str) -> LakeResult<Option<u64>> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LakeError::ColdStore(err.to_string())),
        }
    }

    async fn get(&self, path: &str) -> LakeResult<Option<Vec<u8>>> {
        let size = match self.head(path).await? {
            Some(size) => size,
            None => return Ok(None),
        };
        if size > self.max_bytes {
            return Err(LakeError::ColdStore(format!(
                "object at {path} is {size} bytes, exceeds max of {}",
                self.max_bytes
            )));
        }
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(LakeError::ColdStore(err.to_string())),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> LakeResult<Vec<String>> {
        let mut results = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(LakeError::ColdStore(err.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| LakeError::ColdStore(err.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&self.root) {
                    let relative = relative.to_string_lossy().replace('\\', "/");
                    if relative.starts_with(prefix) {
                        results.push(relative);
                    }
                }
            }
        }
        results.sort();
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let root = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = FsColdStore::new(root.path().to_path_buf(), tmp.path().to_path_buf(), 1024 * 1024);
        let wrote = store.put("timeseries/example/2024/10/01.parquet", b"hello", false).await.unwrap();
        assert!(wrote);
        let bytes = store.get("timeseries/example/2024/10/01.parquet").await.unwrap();
        assert_eq!(bytes, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn put_if_absent_skips_existing_object() {
        let root = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = FsColdStore::new(root.path().to_path_buf(), tmp.path().to_path_buf(), 1024 * 1024);
        store.put("p.parquet", b"first", true).await.unwrap();
        let wrote_again = store.put("p.parquet", b"second", true).await.unwrap();
        assert!(!wrote_again);
        assert_eq!(store.get("p.parquet").await.unwrap(), Some(b"first".to_vec()));
    }

    #[tokio::test]
    async fn head_reports_none_for_missing_object() {
        let root = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = FsColdStore::new(root.path().to_path_buf(), tmp.path().to_path_buf(), 1024 * 1024);
        assert_eq!(store.head("missing.parquet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_finds_nested_partitions() {
        let root = tempfile::tempdir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let store = FsColdStore::new(root.path().to_path_buf(), tmp.path().to_path_buf(), 1024 * 1024);
        store.put("timeseries/example/2024/10/01.parquet", b"a", false).await.unwrap();
        store.put("timeseries/other/2024/10/01.parquet", b"b", false).await.unwrap();
        let found = store.list_prefix("timeseries/example/").await.unwrap();
        assert_eq!(found, vec!["timeseries/example/2024/10/01.parquet"]);
    }
}
