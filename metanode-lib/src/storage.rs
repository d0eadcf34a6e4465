use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{MetaError, MetaResult, NamespaceInfo};

pub const CURRENT_DIR_NAME: &str = "current";
pub const VERSION_FILE_NAME: &str = "VERSION";
/// Bookkeeping file: images in this directory are complete up to this
/// transaction id. Distinct from the shared edit-log store's own
/// position marker, which the bootstrap role never writes.
pub const CHECKPOINT_TXID_FILE_NAME: &str = "checkpoint_txid";
pub const IMAGE_FILE_PREFIX: &str = "fsimage";
const IMAGE_STAGING_EXT: &str = "ckpt";

pub fn image_file_name(txid: u64) -> String {
    format!("{}_{:019}", IMAGE_FILE_PREFIX, txid)
}

pub fn parse_image_file_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(IMAGE_FILE_PREFIX)?.strip_prefix('_')?;
    rest.parse().ok()
}

/// On-disk identity marker written into `current/VERSION`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageVersion {
    pub namespace_id: u64,
    pub cluster_id: String,
    pub block_pool_id: String,
    pub layout_version: i32,
    pub ctime: u64,
}

impl StorageVersion {
    pub fn from_namespace(ns_info: &NamespaceInfo) -> Self {
        Self {
            namespace_id: ns_info.namespace_id,
            cluster_id: ns_info.cluster_id.clone(),
            block_pool_id: ns_info.block_pool_id.clone(),
            layout_version: ns_info.layout_version,
            ctime: ns_info.ctime,
        }
    }

    pub fn is_same_namespace(&self, ns_info: &NamespaceInfo) -> bool {
        self.namespace_id == ns_info.namespace_id
            && self.cluster_id == ns_info.cluster_id
            && self.block_pool_id == ns_info.block_pool_id
    }
}

/// The local image storage directories owned by this server process.
/// Each directory holds a `current/` subtree with a VERSION marker,
/// checkpoint image files named by transaction id, and the
/// checkpoint_txid bookkeeping file.
pub struct NodeStorage {
    image_dirs: Vec<PathBuf>,
}

impl NodeStorage {
    pub fn new(image_dirs: Vec<PathBuf>) -> MetaResult<Self> {
        if image_dirs.is_empty() {
            return Err(MetaError::InvalidParam(
                "no image storage directories configured".to_string(),
            ));
        }
        Ok(Self { image_dirs })
    }

    pub fn image_dirs(&self) -> &[PathBuf] {
        &self.image_dirs
    }

    pub fn current_dir(dir: &Path) -> PathBuf {
        dir.join(CURRENT_DIR_NAME)
    }

    pub async fn read_version(dir: &Path) -> MetaResult<Option<StorageVersion>> {
        let version_file = Self::current_dir(dir).join(VERSION_FILE_NAME);
        if !version_file.exists() {
            return Ok(None);
        }
        let version_str = fs::read_to_string(&version_file).await.map_err(|e| {
            MetaError::IoError(format!(
                "read version marker {} failed: {}",
                version_file.display(),
                e
            ))
        })?;
        let version = serde_json::from_str::<StorageVersion>(&version_str).map_err(|e| {
            MetaError::InvalidData(format!(
                "version marker {} invalid: {}",
                version_file.display(),
                e
            ))
        })?;
        Ok(Some(version))
    }

    pub async fn latest_image_txid(dir: &Path) -> Option<u64> {
        let current = Self::current_dir(dir);
        let mut entries = fs::read_dir(&current).await.ok()?;
        let mut latest = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(txid) = parse_image_file_name(name) {
                    if latest.map(|t| txid > t).unwrap_or(true) {
                        latest = Some(txid);
                    }
                }
            }
        }
        latest
    }

    /// A directory is formatted once it carries both the version
    /// marker and at least one image. A crashed commit writes the
    /// image before the marker, so a half-written directory never
    /// reports formatted here.
    pub async fn is_dir_formatted(dir: &Path) -> bool {
        let version_file = Self::current_dir(dir).join(VERSION_FILE_NAME);
        if !version_file.exists() {
            return false;
        }
        Self::latest_image_txid(dir).await.is_some()
    }

    pub async fn is_formatted(&self) -> bool {
        for dir in &self.image_dirs {
            if Self::is_dir_formatted(dir).await {
                return true;
            }
        }
        false
    }

    /// Reject bootstrap against storage that belongs to a different
    /// namespace. A fresh (unformatted) directory passes.
    pub async fn check_identity(&self, ns_info: &NamespaceInfo) -> MetaResult<()> {
        for dir in &self.image_dirs {
            if let Some(version) = Self::read_version(dir).await? {
                if !version.is_same_namespace(ns_info) {
                    return Err(MetaError::InvalidData(format!(
                        "storage directory {} belongs to namespace {} (cluster {}), active server is namespace {} (cluster {})",
                        dir.display(),
                        version.namespace_id,
                        version.cluster_id,
                        ns_info.namespace_id,
                        ns_info.cluster_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Staging path lives next to `current/`, never inside it, so a
    /// force wipe of `current/` cannot destroy an in-flight download.
    pub fn staging_path(&self, txid: u64) -> PathBuf {
        self.image_dirs[0].join(format!("{}.{}", image_file_name(txid), IMAGE_STAGING_EXT))
    }

    /// Create the staging area and drop any leftover from a prior
    /// failed attempt. Re-entrant by design.
    pub async fn prepare_staging(&self, txid: u64) -> MetaResult<PathBuf> {
        let dir = &self.image_dirs[0];
        fs::create_dir_all(dir).await.map_err(|e| {
            MetaError::IoError(format!("create image dir {} failed: {}", dir.display(), e))
        })?;
        let staging = self.staging_path(txid);
        if staging.exists() {
            debug!("removing stale staging file {}", staging.display());
            fs::remove_file(&staging).await.map_err(|e| {
                MetaError::IoError(format!(
                    "remove stale staging file {} failed: {}",
                    staging.display(),
                    e
                ))
            })?;
        }
        Ok(staging)
    }

    /// Final commit step: make every image directory reflect the
    /// staged checkpoint. With `force` any prior content of `current/`
    /// is removed first; without it a directory found formatted at
    /// commit time is a lost race and the commit is refused.
    pub async fn install_checkpoint(
        &self,
        staged: &Path,
        txid: u64,
        ns_info: &NamespaceInfo,
        force: bool,
    ) -> MetaResult<()> {
        if !staged.exists() {
            return Err(MetaError::NotFound(format!(
                "staged image {} not found",
                staged.display()
            )));
        }

        if !force {
            for dir in &self.image_dirs {
                if Self::is_dir_formatted(dir).await {
                    return Err(MetaError::AlreadyFormatted(format!(
                        "storage directory {} was formatted by another process",
                        dir.display()
                    )));
                }
            }
        }

        let image_name = image_file_name(txid);

        for dir in &self.image_dirs {
            let current = Self::current_dir(dir);
            if force && current.exists() {
                info!("removing existing content of {}", current.display());
                fs::remove_dir_all(&current).await.map_err(|e| {
                    MetaError::IoError(format!("remove {} failed: {}", current.display(), e))
                })?;
            }
            fs::create_dir_all(&current).await.map_err(|e| {
                MetaError::IoError(format!("create {} failed: {}", current.display(), e))
            })?;
        }

        // Install the image everywhere before any directory gains a
        // version marker; a crash in between leaves every directory
        // detectably unformatted.
        let first_image = Self::current_dir(&self.image_dirs[0]).join(&image_name);
        fs::rename(staged, &first_image).await.map_err(|e| {
            MetaError::IoError(format!(
                "rename staged image into {} failed: {}",
                first_image.display(),
                e
            ))
        })?;
        for dir in self.image_dirs.iter().skip(1) {
            let target = Self::current_dir(dir).join(&image_name);
            fs::copy(&first_image, &target).await.map_err(|e| {
                MetaError::IoError(format!(
                    "copy image into {} failed: {}",
                    target.display(),
                    e
                ))
            })?;
        }

        let version = StorageVersion::from_namespace(ns_info);
        let version_str = serde_json::to_string(&version)
            .map_err(|e| MetaError::Internal(e.to_string()))?;
        for dir in &self.image_dirs {
            let current = Self::current_dir(dir);
            let version_file = current.join(VERSION_FILE_NAME);
            fs::write(&version_file, version_str.as_bytes())
                .await
                .map_err(|e| {
                    MetaError::IoError(format!(
                        "write version marker {} failed: {}",
                        version_file.display(),
                        e
                    ))
                })?;
            let txid_file = current.join(CHECKPOINT_TXID_FILE_NAME);
            fs::write(&txid_file, format!("{}\n", txid).as_bytes())
                .await
                .map_err(|e| {
                    MetaError::IoError(format!(
                        "write {} failed: {}",
                        txid_file.display(),
                        e
                    ))
                })?;
            info!(
                "storage directory {} formatted with checkpoint txid {}",
                dir.display(),
                txid
            );
        }
        Ok(())
    }
}
