use crate::config::StorageBackend;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;

pub const DEFAULT_MANIFEST_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

#[derive(Clone)]
pub struct ManifestEntry {
    pub data: Vec<u8>,
    pub content_type: String,
}

pub fn is_digest(reference: &str) -> bool {
    reference.starts_with("sha256:")
}

/// Repository-scoped manifest storage plus a global content-addressed blob store.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn store_manifest(&self, name: &str, reference: &str, entry: ManifestEntry) -> Result<()>;
    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>>;
    /// Tags (never digests) stored for `name`, sorted; `None` if the repository is unknown.
    async fn list_tags(&self, name: &str) -> Result<Option<Vec<String>>>;
    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()>;
    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>>;
    async fn create_upload(&self, uuid: String) -> Result<()>;
    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64>;
    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Default)]
pub struct MemoryStorage {
    manifests: Arc<RwLock<HashMap<String, HashMap<String, ManifestEntry>>>>,
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    uploads: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn store_manifest(&self, name: &str, reference: &str, entry: ManifestEntry) -> Result<()> {
        self.manifests
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .insert(reference.to_string(), entry);
        Ok(())
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>> {
        Ok(self
            .manifests
            .read()
            .await
            .get(name)
            .and_then(|repo| repo.get(reference))
            .cloned())
    }

    async fn list_tags(&self, name: &str) -> Result<Option<Vec<String>>> {
        Ok(self.manifests.read().await.get(name).map(|repo| {
            repo.keys()
                .filter(|r| !is_digest(r))
                .cloned()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        }))
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        self.blobs.write().await.insert(digest, data);
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(digest).cloned())
    }

    async fn create_upload(&self, uuid: String) -> Result<()> {
        self.uploads.write().await.insert(uuid, Vec::new());
        Ok(())
    }

    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64> {
        if let Some(upload) = self.uploads.write().await.get_mut(uuid) {
            upload.extend_from_slice(data);
            Ok(upload.len() as u64)
        } else {
            Err(HarnessError::UploadNotFound(uuid.to_string()))
        }
    }

    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.uploads.write().await.remove(uuid))
    }
}

pub struct DiskStorage {
    base_path: PathBuf,
    _temp_dir: Option<tempfile::TempDir>,
}

fn safe(component: &str) -> String {
    component.replace(['/', ':'], "_")
}

impl DiskStorage {
    pub async fn new(path: PathBuf) -> Result<Self> {
        Self::prepare(&path).await?;
        Ok(Self {
            base_path: path,
            _temp_dir: None,
        })
    }

    pub async fn temp() -> Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().to_path_buf();
        Self::prepare(&path).await?;
        Ok(Self {
            base_path: path,
            _temp_dir: Some(temp_dir),
        })
    }

    async fn prepare(path: &std::path::Path) -> Result<()> {
        fs::create_dir_all(path.join("manifests")).await?;
        fs::create_dir_all(path.join("blobs")).await?;
        fs::create_dir_all(path.join("uploads")).await?;
        Ok(())
    }

    fn repo_dir(&self, name: &str) -> PathBuf {
        self.base_path.join("manifests").join(safe(name))
    }

    fn manifest_path(&self, name: &str, reference: &str) -> PathBuf {
        self.repo_dir(name).join(format!("{}.json", safe(reference)))
    }

    fn manifest_meta_path(&self, name: &str, reference: &str) -> PathBuf {
        self.repo_dir(name).join(format!("{}.meta", safe(reference)))
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.base_path.join("blobs").join(safe(digest))
    }

    fn upload_path(&self, uuid: &str) -> PathBuf {
        self.base_path.join("uploads").join(uuid)
    }
}

#[async_trait]
impl Storage for DiskStorage {
    async fn store_manifest(&self, name: &str, reference: &str, entry: ManifestEntry) -> Result<()> {
        fs::create_dir_all(self.repo_dir(name)).await?;
        fs::write(self.manifest_path(name, reference), &entry.data).await?;
        fs::write(self.manifest_meta_path(name, reference), &entry.content_type).await?;
        Ok(())
    }

    async fn get_manifest(&self, name: &str, reference: &str) -> Result<Option<ManifestEntry>> {
        let manifest_path = self.manifest_path(name, reference);
        if !manifest_path.exists() {
            return Ok(None);
        }

        let data = fs::read(&manifest_path).await?;
        let content_type = fs::read_to_string(self.manifest_meta_path(name, reference))
            .await
            .unwrap_or_else(|_| DEFAULT_MANIFEST_TYPE.to_string());

        Ok(Some(ManifestEntry { data, content_type }))
    }

    async fn list_tags(&self, name: &str) -> Result<Option<Vec<String>>> {
        let dir = self.repo_dir(name);
        if !dir.exists() {
            return Ok(None);
        }

        let mut tags = BTreeSet::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(stem) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if !stem.starts_with("sha256_") {
                tags.insert(stem.to_string());
            }
        }
        Ok(Some(tags.into_iter().collect()))
    }

    async fn store_blob(&self, digest: String, data: Vec<u8>) -> Result<()> {
        fs::write(self.blob_path(&digest), &data).await?;
        Ok(())
    }

    async fn get_blob(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        let blob_path = self.blob_path(digest);
        if !blob_path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(&blob_path).await?))
    }

    async fn create_upload(&self, uuid: String) -> Result<()> {
        fs::write(self.upload_path(&uuid), Vec::<u8>::new()).await?;
        Ok(())
    }

    async fn append_upload(&self, uuid: &str, data: &[u8]) -> Result<u64> {
        let upload_path = self.upload_path(uuid);
        if !upload_path.exists() {
            return Err(HarnessError::UploadNotFound(uuid.to_string()));
        }

        let mut existing = fs::read(&upload_path).await?;
        existing.extend_from_slice(data);
        fs::write(&upload_path, &existing).await?;
        Ok(existing.len() as u64)
    }

    async fn finish_upload(&self, uuid: &str) -> Result<Option<Vec<u8>>> {
        let upload_path = self.upload_path(uuid);
        if !upload_path.exists() {
            return Ok(None);
        }

        let data = fs::read(&upload_path).await?;
        fs::remove_file(&upload_path).await?;
        Ok(Some(data))
    }
}

pub async fn create_storage(backend: &StorageBackend) -> Result<Arc<dyn Storage>> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::TempDir => Ok(Arc::new(DiskStorage::temp().await?)),
        StorageBackend::Directory(path) => Ok(Arc::new(DiskStorage::new(path.clone()).await?)),
    }
}
