use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{MetaError, MetaResult};

pub const EDITS_FILE_PREFIX: &str = "edits";
pub const EDITS_INPROGRESS_PREFIX: &str = "edits_inprogress";

/// One finalized or in-progress segment of the shared edit log.
/// An in-progress segment has no end txid yet and is treated as
/// open-ended when checking availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSegment {
    pub start_txid: u64,
    pub end_txid: Option<u64>,
}

impl LogSegment {
    pub fn finalized(start_txid: u64, end_txid: u64) -> Self {
        Self {
            start_txid,
            end_txid: Some(end_txid),
        }
    }

    pub fn in_progress(start_txid: u64) -> Self {
        Self {
            start_txid,
            end_txid: None,
        }
    }

    pub fn file_name(&self) -> String {
        match self.end_txid {
            Some(end) => format!("{}_{:019}-{:019}", EDITS_FILE_PREFIX, self.start_txid, end),
            None => format!("{}_{:019}", EDITS_INPROGRESS_PREFIX, self.start_txid),
        }
    }
}

pub fn parse_edits_file_name(name: &str) -> Option<LogSegment> {
    if let Some(rest) = name.strip_prefix(EDITS_INPROGRESS_PREFIX).and_then(|r| r.strip_prefix('_')) {
        let start = rest.parse().ok()?;
        return Some(LogSegment::in_progress(start));
    }
    let rest = name.strip_prefix(EDITS_FILE_PREFIX)?.strip_prefix('_')?;
    let (start_str, end_str) = rest.split_once('-')?;
    let start = start_str.parse().ok()?;
    let end = end_str.parse().ok()?;
    Some(LogSegment::finalized(start, end))
}

/// Read-only view of the shared edit log. Bootstrap only ever lists
/// what is there; it must never write into the shared store, and in
/// particular must never touch the store's own position marker.
#[async_trait]
pub trait SharedLogStore: Send + Sync {
    async fn list_segments(&self) -> MetaResult<Vec<LogSegment>>;
}

/// Shared edit log held in a filesystem directory (typically an NFS
/// mount), laid out as `current/edits_<start>-<end>` files plus at
/// most one `current/edits_inprogress_<start>`.
pub struct FileSharedLogStore {
    dir: PathBuf,
}

impl FileSharedLogStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SharedLogStore for FileSharedLogStore {
    async fn list_segments(&self) -> MetaResult<Vec<LogSegment>> {
        let current = self.dir.join(crate::CURRENT_DIR_NAME);
        if !current.exists() {
            return Err(MetaError::LogsUnavailable(format!(
                "shared edits directory {} does not exist",
                current.display()
            )));
        }
        let mut entries = fs::read_dir(&current).await.map_err(|e| {
            MetaError::IoError(format!(
                "read shared edits directory {} failed: {}",
                current.display(),
                e
            ))
        })?;
        let mut segments = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            MetaError::IoError(format!(
                "read shared edits directory {} failed: {}",
                current.display(),
                e
            ))
        })? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(segment) = parse_edits_file_name(name) {
                    segments.push(segment);
                }
            }
        }
        Ok(segments)
    }
}

/// Verify that transactions `from_txid..=to_txid` can all be read
/// from the listed segments. Segments may overlap; the walk only
/// requires that every txid in the range is covered by some segment.
pub fn check_logs_available(
    segments: &[LogSegment],
    from_txid: u64,
    to_txid: u64,
) -> MetaResult<()> {
    if from_txid > to_txid {
        return Ok(());
    }
    let mut sorted = segments.to_vec();
    sorted.sort_by_key(|s| s.start_txid);

    let mut next = from_txid;
    for segment in &sorted {
        if segment.start_txid > next {
            break;
        }
        match segment.end_txid {
            // An in-progress segment runs through the head of the log.
            None => {
                next = to_txid + 1;
                break;
            }
            Some(end) => {
                if end >= next {
                    next = end + 1;
                }
            }
        }
        if next > to_txid {
            break;
        }
    }

    if next > to_txid {
        return Ok(());
    }
    // Report the exact missing range: it ends where the next available
    // segment picks up again, or at the end of the required range.
    let gap_end = sorted
        .iter()
        .find(|s| s.start_txid > next)
        .map(|s| (s.start_txid - 1).min(to_txid))
        .unwrap_or(to_txid);
    Err(MetaError::LogsUnavailable(format!(
        "Unable to read transaction ids {}-{} from the configured shared edits directory",
        next, gap_end
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_edits_file_name() {
        assert_eq!(
            parse_edits_file_name("edits_0000000000000000001-0000000000000000003"),
            Some(LogSegment::finalized(1, 3))
        );
        assert_eq!(
            parse_edits_file_name("edits_inprogress_0000000000000000004"),
            Some(LogSegment::in_progress(4))
        );
        assert_eq!(parse_edits_file_name("fsimage_0000000000000000001"), None);
        assert_eq!(parse_edits_file_name("edits_junk"), None);
        assert_eq!(
            parse_edits_file_name(&LogSegment::finalized(10, 25).file_name()),
            Some(LogSegment::finalized(10, 25))
        );
    }

    #[test]
    fn test_contiguous_segments_available() {
        let segments = vec![
            LogSegment::finalized(1, 3),
            LogSegment::finalized(4, 10),
            LogSegment::in_progress(11),
        ];
        assert!(check_logs_available(&segments, 1, 12).is_ok());
        assert!(check_logs_available(&segments, 5, 10).is_ok());
    }

    #[test]
    fn test_empty_range_needs_no_logs() {
        assert!(check_logs_available(&[], 7, 6).is_ok());
    }

    #[test]
    fn test_missing_head_reported() {
        // The segment covering 1-3 was purged; checkpoint is at 0 and
        // the current segment starts at 4, so 1-3 are required but
        // gone while 4 onward is still readable.
        let segments = vec![LogSegment::in_progress(4)];
        let err = check_logs_available(&segments, 1, 4).unwrap_err();
        match err {
            MetaError::LogsUnavailable(msg) => {
                assert!(msg.contains("Unable to read transaction ids 1-3"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_gap_in_middle_reported() {
        let segments = vec![
            LogSegment::finalized(1, 3),
            LogSegment::finalized(7, 9),
        ];
        let err = check_logs_available(&segments, 1, 9).unwrap_err();
        match err {
            MetaError::LogsUnavailable(msg) => {
                assert!(msg.contains("transaction ids 4-6"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_gap_with_nothing_after_reported() {
        let segments = vec![LogSegment::finalized(1, 3)];
        let err = check_logs_available(&segments, 1, 9).unwrap_err();
        match err {
            MetaError::LogsUnavailable(msg) => {
                assert!(msg.contains("transaction ids 4-9"), "{}", msg);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_overlapping_segments_available() {
        let segments = vec![
            LogSegment::finalized(1, 5),
            LogSegment::finalized(3, 8),
        ];
        assert!(check_logs_available(&segments, 1, 8).is_ok());
    }

    #[tokio::test]
    async fn test_file_store_lists_segments() {
        let temp = TempDir::new().unwrap();
        let store = FileSharedLogStore::new(temp.path().to_path_buf());
        let current = temp.path().join(crate::CURRENT_DIR_NAME);
        tokio::fs::create_dir_all(&current).await.unwrap();
        tokio::fs::write(current.join(LogSegment::finalized(1, 3).file_name()), b"")
            .await
            .unwrap();
        tokio::fs::write(current.join(LogSegment::in_progress(4).file_name()), b"")
            .await
            .unwrap();
        tokio::fs::write(current.join("seen_txid"), b"4\n").await.unwrap();

        let mut segments = store.list_segments().await.unwrap();
        segments.sort_by_key(|s| s.start_txid);
        assert_eq!(
            segments,
            vec![LogSegment::finalized(1, 3), LogSegment::in_progress(4)]
        );
    }

    #[tokio::test]
    async fn test_file_store_missing_dir() {
        let temp = TempDir::new().unwrap();
        let store = FileSharedLogStore::new(temp.path().join("nope"));
        let err = store.list_segments().await.unwrap_err();
        assert!(matches!(err, MetaError::LogsUnavailable(_)));
    }
}
