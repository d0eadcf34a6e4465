use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{
    check_logs_available, check_version, ActiveNodeClient, CheckpointFetcher, MetaError,
    MetaResult, NamespaceInfo, NodeStorage, SharedLogStore,
};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FAILED_CONNECT: i32 = 2;
pub const EXIT_INVALID_VERSION: i32 = 3;
pub const EXIT_ALREADY_FORMATTED: i32 = 5;
pub const EXIT_LOGS_UNAVAILABLE: i32 = 6;
pub const EXIT_INSUFFICIENT_SPACE: i32 = 7;

fn default_transfer_timeout_secs() -> u64 {
    60
}

/// Standby-side bootstrap configuration, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// Addresses of the other metadata servers, tried in order.
    pub remote_nodes: Vec<String>,
    pub image_dirs: Vec<PathBuf>,
    pub shared_edits_dir: PathBuf,
    /// Throttle for bootstrap image downloads, bytes/sec. 0 disables
    /// throttling. Deliberately separate from `transfer_rate`.
    #[serde(default)]
    pub bootstrap_transfer_rate: u64,
    /// Throttle for ordinary inter-server checkpoint uploads. Never
    /// applied to bootstrap downloads.
    #[serde(default)]
    pub transfer_rate: u64,
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

impl BootstrapConfig {
    pub async fn load_from_file(path: &Path) -> MetaResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MetaError::IoError(format!("read config file {} failed: {}", path.display(), e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            MetaError::InvalidData(format!("parse config file {} failed: {}", path.display(), e))
        })
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    /// Reformat existing storage without asking.
    pub force: bool,
    /// Allowed to prompt before reformatting. Off for unattended runs.
    pub interactive: bool,
    pub skip_shared_edits_check: bool,
    /// Operator-asserted rolling upgrade, for the window where the
    /// remote runs a newer layout but has not reported the upgrade
    /// started yet.
    pub rolling_upgrade: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            force: false,
            interactive: true,
            skip_shared_edits_check: false,
            rolling_upgrade: false,
        }
    }
}

/// Asks the operator whether existing storage may be wiped.
pub trait ReformatConfirm: Send + Sync {
    fn confirm(&self, prompt: &str) -> bool;
}

/// Refuses every reformat. Used when no operator is attached.
pub struct DenyReformat;

impl ReformatConfirm for DenyReformat {
    fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Drives the whole bootstrap sequence: contact a live server, check
/// versions and namespace identity, verify the shared edit log covers
/// everything past the checkpoint, download the image, and format the
/// local storage directories. The shared edit log is only ever read.
pub struct BootstrapStandby<'a> {
    remotes: Vec<&'a dyn ActiveNodeClient>,
    log_store: &'a dyn SharedLogStore,
    storage: &'a NodeStorage,
    fetcher: CheckpointFetcher,
    confirm: &'a dyn ReformatConfirm,
    options: BootstrapOptions,
}

impl<'a> BootstrapStandby<'a> {
    pub fn new(
        remotes: Vec<&'a dyn ActiveNodeClient>,
        log_store: &'a dyn SharedLogStore,
        storage: &'a NodeStorage,
        config: &BootstrapConfig,
        confirm: &'a dyn ReformatConfirm,
        options: BootstrapOptions,
    ) -> Self {
        let fetcher = CheckpointFetcher::new(
            config.bootstrap_transfer_rate,
            config.transfer_timeout_secs,
        );
        Self {
            remotes,
            log_store,
            storage,
            fetcher,
            confirm,
            options,
        }
    }

    pub async fn run(&self) -> MetaResult<()> {
        let ns_info = self.fetch_namespace_info().await?;
        info!(
            "bootstrapping standby for namespace {} (cluster {}, block pool {})",
            ns_info.namespace_id, ns_info.cluster_id, ns_info.block_pool_id
        );

        check_version(&ns_info, self.options.rolling_upgrade)?;
        self.storage.check_identity(&ns_info).await?;

        let force = self.confirm_reformat().await?;

        let signature = self.fetch_checkpoint_signature(&ns_info).await?;
        let checkpoint_txid = signature.most_recent_checkpoint_txid;
        let cur_segment_txid = signature.cur_segment_txid;
        info!(
            "remote checkpoint at txid {}, current log segment starts at txid {}",
            checkpoint_txid, cur_segment_txid
        );

        if self.options.skip_shared_edits_check {
            warn!("skipping shared edit log availability check");
        } else {
            let segments = self.log_store.list_segments().await?;
            check_logs_available(&segments, checkpoint_txid + 1, cur_segment_txid).map_err(
                |e| {
                    error!(
                        "the shared edit log is missing transactions this standby \
                         would need to catch up: {}",
                        e
                    );
                    e
                },
            )?;
        }

        let staged = self
            .fetcher
            .fetch_image(&self.remotes, checkpoint_txid, self.storage)
            .await?;
        self.storage
            .install_checkpoint(&staged, checkpoint_txid, &ns_info, force)
            .await?;
        info!("bootstrap complete at checkpoint txid {}", checkpoint_txid);
        Ok(())
    }

    async fn fetch_namespace_info(&self) -> MetaResult<NamespaceInfo> {
        let mut last_err =
            MetaError::FailedConnect("no remote servers configured".to_string());
        for remote in &self.remotes {
            match remote.get_namespace_info().await {
                Ok(ns_info) => return Ok(ns_info),
                Err(e) => {
                    warn!("contacting {} failed: {}", remote.address(), e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn fetch_checkpoint_signature(
        &self,
        ns_info: &NamespaceInfo,
    ) -> MetaResult<crate::CheckpointSignature> {
        let mut last_err =
            MetaError::FailedConnect("no remote servers configured".to_string());
        for remote in &self.remotes {
            match remote.get_checkpoint_signature().await {
                Ok(signature) => {
                    signature.validate_against(ns_info)?;
                    return Ok(signature);
                }
                Err(e) => {
                    warn!(
                        "fetching checkpoint signature from {} failed: {}",
                        remote.address(),
                        e
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Returns whether the install may wipe existing storage content.
    async fn confirm_reformat(&self) -> MetaResult<bool> {
        if !self.storage.is_formatted().await {
            return Ok(self.options.force);
        }
        if self.options.force {
            return Ok(true);
        }
        if self.options.interactive {
            let dirs: Vec<String> = self
                .storage
                .image_dirs()
                .iter()
                .map(|d| d.display().to_string())
                .collect();
            let prompt = format!(
                "Storage directories [{}] are already formatted. Re-format and lose their content?",
                dirs.join(", ")
            );
            if self.confirm.confirm(&prompt) {
                return Ok(true);
            }
        }
        Err(MetaError::AlreadyFormatted(
            "local storage is already formatted; re-run with force to reformat".to_string(),
        ))
    }
}

/// Stable mapping from bootstrap outcome to process exit code.
pub fn exit_code(result: &MetaResult<()>) -> i32 {
    match result {
        Ok(()) => EXIT_SUCCESS,
        Err(MetaError::FailedConnect(_)) => EXIT_FAILED_CONNECT,
        Err(MetaError::InvalidVersion(_)) => EXIT_INVALID_VERSION,
        Err(MetaError::AlreadyFormatted(_)) => EXIT_ALREADY_FORMATTED,
        Err(MetaError::LogsUnavailable(_)) => EXIT_LOGS_UNAVAILABLE,
        Err(MetaError::InsufficientSpace(_)) => EXIT_INSUFFICIENT_SPACE,
        Err(_) => EXIT_FAILURE,
    }
}
