use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{ActiveNodeClient, ImageDownload, MetaError, MetaResult, NodeStorage, TransferThrottler};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Downloads a checkpoint image into the staging area, trying each
/// remote in turn. The bootstrap rate limit is independent of the
/// rate used for ordinary checkpoint uploads between live servers;
/// a rate of 0 leaves the download unthrottled.
pub struct CheckpointFetcher {
    bootstrap_rate_bytes_per_sec: u64,
    transfer_timeout: Option<Duration>,
}

impl CheckpointFetcher {
    pub fn new(bootstrap_rate_bytes_per_sec: u64, transfer_timeout_secs: u64) -> Self {
        Self {
            bootstrap_rate_bytes_per_sec,
            transfer_timeout: if transfer_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(transfer_timeout_secs))
            },
        }
    }

    /// Fetch the image for `txid` from the first remote that can serve
    /// it. Connection and transfer failures move on to the next
    /// remote; running out of local disk space aborts immediately
    /// since no other source can fix that.
    pub async fn fetch_image(
        &self,
        remotes: &[&dyn ActiveNodeClient],
        txid: u64,
        storage: &NodeStorage,
    ) -> MetaResult<PathBuf> {
        let staging = storage.prepare_staging(txid).await?;
        let mut last_err = MetaError::FailedConnect("no image sources configured".to_string());
        for remote in remotes {
            match self.download_from(*remote, txid, &staging).await {
                Ok(()) => {
                    info!(
                        "downloaded checkpoint image for txid {} from {}",
                        txid,
                        remote.address()
                    );
                    return Ok(staging);
                }
                Err(e @ MetaError::InsufficientSpace(_)) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "image download from {} failed, trying next source: {}",
                        remote.address(),
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn download_from(
        &self,
        remote: &dyn ActiveNodeClient,
        txid: u64,
        staging: &Path,
    ) -> MetaResult<()> {
        let download = remote.open_image(txid).await?;

        if let Some(len) = download.content_length {
            check_available_space(staging, len)?;
        }

        let result = match self.transfer_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.copy_to_staging(download, staging)).await {
                    Ok(r) => r,
                    Err(_) => Err(MetaError::Timeout(format!(
                        "image download from {} did not complete within {:?}",
                        remote.address(),
                        timeout
                    ))),
                }
            }
            None => self.copy_to_staging(download, staging).await,
        };

        if result.is_err() {
            // Drop the partial file so a retry starts clean.
            let _ = tokio::fs::remove_file(staging).await;
        }
        result
    }

    async fn copy_to_staging(&self, download: ImageDownload, staging: &Path) -> MetaResult<()> {
        let mut reader = download.reader;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(staging)
            .await
            .map_err(|e| {
                MetaError::IoError(format!(
                    "open staging file {} failed: {}",
                    staging.display(),
                    e
                ))
            })?;

        let mut throttler = TransferThrottler::new(self.bootstrap_rate_bytes_per_sec);
        let mut hasher = Sha256::new();
        let mut total: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = reader.read(&mut buf).await.map_err(|e| {
                MetaError::RemoteError(format!("read image stream failed: {}", e))
            })?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await.map_err(|e| {
                MetaError::IoError(format!(
                    "write staging file {} failed: {}",
                    staging.display(),
                    e
                ))
            })?;
            hasher.update(&buf[..n]);
            total += n as u64;
            if let Some(throttler) = throttler.as_mut() {
                throttler.throttle(n as u64).await;
            }
        }
        file.sync_all().await.map_err(|e| {
            MetaError::IoError(format!(
                "sync staging file {} failed: {}",
                staging.display(),
                e
            ))
        })?;

        if let Some(expected_len) = download.content_length {
            if total != expected_len {
                return Err(MetaError::VerifyError(format!(
                    "image truncated: got {} bytes, expected {}",
                    total, expected_len
                )));
            }
        }
        if let Some(expected) = download.sha256 {
            let actual = hex::encode(hasher.finalize());
            if actual != expected.to_lowercase() {
                return Err(MetaError::VerifyError(format!(
                    "image digest mismatch: got {}, expected {}",
                    actual, expected
                )));
            }
        }
        Ok(())
    }
}

fn check_available_space(staging: &Path, needed: u64) -> MetaResult<()> {
    let dir = staging.parent().unwrap_or(Path::new("."));
    let available = fs2::available_space(dir).map_err(|e| {
        MetaError::IoError(format!(
            "query free space of {} failed: {}",
            dir.display(),
            e
        ))
    })?;
    if available < needed {
        return Err(MetaError::InsufficientSpace(format!(
            "image needs {} bytes but {} has only {} available",
            needed,
            dir.display(),
            available
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::MockNode;
    use crate::{CheckpointSignature, NamespaceInfo};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn test_ns_info() -> NamespaceInfo {
        NamespaceInfo {
            namespace_id: 1001,
            cluster_id: "CID-test".to_string(),
            block_pool_id: "BP-1001".to_string(),
            layout_version: crate::CURRENT_LAYOUT_VERSION,
            service_layout_version: crate::CURRENT_SERVICE_LAYOUT_VERSION,
            ctime: 1,
            software_version: "0.4.0".to_string(),
            rolling_upgrade: None,
        }
    }

    fn test_signature() -> CheckpointSignature {
        CheckpointSignature {
            most_recent_checkpoint_txid: 6,
            cur_segment_txid: 7,
            layout_version: crate::CURRENT_LAYOUT_VERSION,
            namespace_id: 1001,
            cluster_id: "CID-test".to_string(),
            block_pool_id: "BP-1001".to_string(),
        }
    }

    fn test_storage(temp: &TempDir) -> NodeStorage {
        NodeStorage::new(vec![temp.path().join("name")]).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_writes_staging_file() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let node = MockNode::new("active:8480", test_ns_info(), test_signature());
        let fetcher = CheckpointFetcher::new(0, 0);

        let staged = fetcher
            .fetch_image(&[&node], 6, &storage)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), node.image);
        assert_eq!(staged, storage.staging_path(6));
    }

    #[tokio::test]
    async fn test_failover_to_second_source() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let mut down = MockNode::new("active1:8480", test_ns_info(), test_signature());
        down.unreachable = true;
        let up = MockNode::new("active2:8480", test_ns_info(), test_signature());
        let fetcher = CheckpointFetcher::new(0, 0);

        let staged = fetcher
            .fetch_image(&[&down, &up], 6, &storage)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), up.image);
        assert_eq!(down.download_count.load(Ordering::SeqCst), 1);
        assert_eq!(up.download_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_sources_down() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let mut a = MockNode::new("active1:8480", test_ns_info(), test_signature());
        a.unreachable = true;
        let mut b = MockNode::new("active2:8480", test_ns_info(), test_signature());
        b.unreachable = true;
        let fetcher = CheckpointFetcher::new(0, 0);

        let err = fetcher
            .fetch_image(&[&a, &b], 6, &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, MetaError::FailedConnect(_)));
        assert!(!storage.staging_path(6).exists());
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_over() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let mut bad = MockNode::new("active1:8480", test_ns_info(), test_signature());
        bad.corrupt_digest = true;
        let good = MockNode::new("active2:8480", test_ns_info(), test_signature());
        let fetcher = CheckpointFetcher::new(0, 0);

        let staged = fetcher
            .fetch_image(&[&bad, &good], 6, &storage)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), good.image);
    }

    #[tokio::test]
    async fn test_digest_mismatch_leaves_no_partial() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let mut bad = MockNode::new("active:8480", test_ns_info(), test_signature());
        bad.corrupt_digest = true;
        let fetcher = CheckpointFetcher::new(0, 0);

        let err = fetcher.fetch_image(&[&bad], 6, &storage).await.unwrap_err();
        assert!(matches!(err, MetaError::VerifyError(_)));
        assert!(!storage.staging_path(6).exists());
    }

    #[test]
    fn test_insufficient_space_detected() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("fsimage_0000000000000000006.ckpt");
        // No filesystem can hold this.
        let err = check_available_space(&staging, u64::MAX).unwrap_err();
        assert!(matches!(err, MetaError::InsufficientSpace(_)), "{:?}", err);
        // A zero-byte image always fits.
        assert!(check_available_space(&staging, 0).is_ok());
    }

    #[tokio::test]
    async fn test_throttled_download_times_out() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let node = MockNode::new("active:8480", test_ns_info(), test_signature());
        // 1 byte/sec against a 16 byte image cannot finish inside 1s.
        let fetcher = CheckpointFetcher::new(1, 1);

        let err = fetcher.fetch_image(&[&node], 6, &storage).await.unwrap_err();
        assert!(matches!(err, MetaError::Timeout(_)));
        assert!(!storage.staging_path(6).exists());
    }

    #[tokio::test]
    async fn test_unthrottled_download_beats_timeout() {
        let temp = TempDir::new().unwrap();
        let storage = test_storage(&temp);
        let node = MockNode::new("active:8480", test_ns_info(), test_signature());
        let fetcher = CheckpointFetcher::new(0, 1);

        let staged = fetcher.fetch_image(&[&node], 6, &storage).await.unwrap();
        assert_eq!(tokio::fs::read(&staged).await.unwrap(), node.image);
    }
}
