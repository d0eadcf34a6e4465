use serde::{Deserialize, Serialize};

use crate::{MetaError, MetaResult};

/// Layout version of the on-disk namespace format. Negative by
/// convention; every format change decrements it, so a "future"
/// version is numerically smaller than the current one.
pub const CURRENT_LAYOUT_VERSION: i32 = -67;

/// Layout version of the server-to-server service surface. Tracks
/// `CURRENT_LAYOUT_VERSION` except during a rolling upgrade window.
pub const CURRENT_SERVICE_LAYOUT_VERSION: i32 = -67;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingUpgradeInfo {
    pub in_progress: bool,
    pub start_txid: u64,
}

/// Identity of the logical namespace a storage directory belongs to.
/// Fetched fresh from the active server on every bootstrap attempt,
/// never cached across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub namespace_id: u64,
    pub cluster_id: String,
    pub block_pool_id: String,
    pub layout_version: i32,
    pub service_layout_version: i32,
    pub ctime: u64,
    pub software_version: String,
    #[serde(default)]
    pub rolling_upgrade: Option<RollingUpgradeInfo>,
}

impl NamespaceInfo {
    pub fn is_rolling_upgrade_in_progress(&self) -> bool {
        self.rolling_upgrade
            .as_ref()
            .map(|ru| ru.in_progress)
            .unwrap_or(false)
    }

    pub fn is_same_namespace(&self, other: &NamespaceInfo) -> bool {
        self.namespace_id == other.namespace_id
            && self.cluster_id == other.cluster_id
            && self.block_pool_id == other.block_pool_id
    }
}

/// Identifies one checkpoint snapshot and the log position it
/// corresponds to. Produced by the active server at checkpoint time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSignature {
    pub most_recent_checkpoint_txid: u64,
    pub cur_segment_txid: u64,
    pub layout_version: i32,
    pub namespace_id: u64,
    pub cluster_id: String,
    pub block_pool_id: String,
}

impl CheckpointSignature {
    pub fn validate_against(&self, ns_info: &NamespaceInfo) -> MetaResult<()> {
        if self.namespace_id != ns_info.namespace_id
            || self.block_pool_id != ns_info.block_pool_id
        {
            return Err(MetaError::InvalidData(format!(
                "checkpoint signature does not belong to namespace {} / pool {}: got {} / {}",
                ns_info.namespace_id,
                ns_info.block_pool_id,
                self.namespace_id,
                self.block_pool_id
            )));
        }
        Ok(())
    }
}

/// Decide whether bootstrap may proceed against the given active
/// server. A future service layout version is only tolerated while a
/// rolling upgrade is in progress, either reported by the remote or
/// declared by the operator; once the upgrade is finalized a future
/// version signals a real incompatibility.
pub fn check_version(ns_info: &NamespaceInfo, local_rolling_upgrade: bool) -> MetaResult<()> {
    let upgrade_window = local_rolling_upgrade || ns_info.is_rolling_upgrade_in_progress();
    if ns_info.service_layout_version < CURRENT_SERVICE_LAYOUT_VERSION && !upgrade_window {
        return Err(MetaError::InvalidVersion(format!(
            "active server reports service layout version {} but this software only supports up to {} and no rolling upgrade is in progress",
            ns_info.service_layout_version, CURRENT_SERVICE_LAYOUT_VERSION
        )));
    }
    if ns_info.layout_version < CURRENT_LAYOUT_VERSION && !upgrade_window {
        return Err(MetaError::InvalidVersion(format!(
            "active server reports layout version {} but this software only supports up to {}",
            ns_info.layout_version, CURRENT_LAYOUT_VERSION
        )));
    }
    Ok(())
}
