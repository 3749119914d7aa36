// src/status.rs

use crate::models::{
    DownloadBatchId, DownloadBatchTitle, DownloadErrorType, DownloadFailure, DownloadFileId,
    FileSize,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Coarse state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Downloading,
    Paused,
    WaitingForNetwork,
    Downloaded,
    Error,
    Deletion,
    Deleted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Downloading => "downloading",
            Status::Paused => "paused",
            Status::WaitingForNetwork => "waiting_for_network",
            Status::Downloaded => "downloaded",
            Status::Error => "error",
            Status::Deletion => "deletion",
            Status::Deleted => "deleted",
        }
    }

    /// States set by control operations that file progress must not overwrite.
    pub fn is_explicit(&self) -> bool {
        matches!(
            self,
            Status::Paused | Status::WaitingForNetwork | Status::Deletion | Status::Deleted
        )
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw {
            "queued" => Status::Queued,
            "downloading" => Status::Downloading,
            "paused" => Status::Paused,
            "waiting_for_network" => Status::WaitingForNetwork,
            "downloaded" => Status::Downloaded,
            "error" => Status::Error,
            "deletion" => Status::Deletion,
            "deleted" => Status::Deleted,
            other => return Err(format!("unknown batch status '{other}'")),
        })
    }
}

/// State of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Queued,
    Downloading,
    Downloaded,
    Error,
    Paused,
    WaitingForNetwork,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadFileStatus {
    pub batch_id: DownloadBatchId,
    pub file_id: DownloadFileId,
    pub status: FileStatus,
    pub file_size: FileSize,
    pub error: Option<DownloadFailure>,
}

/// Snapshot of a batch handed to callbacks and queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadBatchStatus {
    pub batch_id: DownloadBatchId,
    pub title: DownloadBatchTitle,
    pub storage_root: PathBuf,
    pub status: Status,
    pub percentage_downloaded: u32,
    pub bytes_downloaded: u64,
    /// `None` while any file's total size is unknown.
    pub bytes_total_size: Option<u64>,
    pub download_error: Option<DownloadFailure>,
    pub downloaded_date_time_ms: Option<i64>,
    pub notification_seen: bool,
}

impl DownloadBatchStatus {
    pub fn error_type(&self) -> Option<DownloadErrorType> {
        self.download_error.as_ref().map(|failure| failure.error_type)
    }
}

/// Mutable status owned by a `DownloadBatch`.
///
/// The `mark_*` methods are the only legal transitions; the owning batch is
/// responsible for persisting them.
#[derive(Debug, Clone)]
pub struct InternalDownloadBatchStatus {
    batch_id: DownloadBatchId,
    title: DownloadBatchTitle,
    storage_root: PathBuf,
    status: Status,
    bytes_downloaded: u64,
    bytes_total_size: Option<u64>,
    download_error: Option<DownloadFailure>,
    downloaded_date_time_ms: Option<i64>,
    notification_seen: bool,
}

impl InternalDownloadBatchStatus {
    pub fn new(
        batch_id: DownloadBatchId,
        title: DownloadBatchTitle,
        storage_root: PathBuf,
        status: Status,
    ) -> Self {
        Self {
            batch_id,
            title,
            storage_root,
            status,
            bytes_downloaded: 0,
            bytes_total_size: None,
            download_error: None,
            downloaded_date_time_ms: None,
            notification_seen: false,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn percentage_downloaded(&self) -> u32 {
        percentage(self.bytes_downloaded, self.bytes_total_size)
    }

    pub fn mark_as_downloading(&mut self) {
        self.status = Status::Downloading;
        self.download_error = None;
    }

    pub fn mark_as_paused(&mut self) {
        self.status = Status::Paused;
    }

    pub fn mark_as_queued(&mut self) {
        self.status = Status::Queued;
        self.download_error = None;
    }

    pub fn mark_as_waiting_for_network(&mut self) {
        self.status = Status::WaitingForNetwork;
    }

    pub fn mark_as_error(&mut self, failure: DownloadFailure) {
        self.status = Status::Error;
        self.download_error = Some(failure);
    }

    pub fn mark_as_downloaded(&mut self, downloaded_at_ms: i64) {
        self.status = Status::Downloaded;
        self.download_error = None;
        self.downloaded_date_time_ms = Some(downloaded_at_ms);
    }

    pub fn mark_for_deletion(&mut self) {
        self.status = Status::Deletion;
    }

    pub fn mark_as_deleted(&mut self) {
        self.status = Status::Deleted;
    }

    pub fn set_notification_seen(&mut self, seen: bool) {
        self.notification_seen = seen;
    }

    pub fn set_downloaded_date_time_ms(&mut self, at_ms: Option<i64>) {
        self.downloaded_date_time_ms = at_ms;
    }

    pub fn update_bytes(&mut self, downloaded: u64, total: Option<u64>) {
        self.bytes_downloaded = downloaded;
        self.bytes_total_size = total;
    }

    pub fn snapshot(&self) -> DownloadBatchStatus {
        DownloadBatchStatus {
            batch_id: self.batch_id.clone(),
            title: self.title.clone(),
            storage_root: self.storage_root.clone(),
            status: self.status,
            percentage_downloaded: self.percentage_downloaded(),
            bytes_downloaded: self.bytes_downloaded,
            bytes_total_size: self.bytes_total_size,
            download_error: self.download_error.clone(),
            downloaded_date_time_ms: self.downloaded_date_time_ms,
            notification_seen: self.notification_seen,
        }
    }
}

/// `bytes * 100 / total`, truncated. Zero when the total is unknown or zero.
pub fn percentage(bytes_downloaded: u64, bytes_total_size: Option<u64>) -> u32 {
    match bytes_total_size {
        Some(total) if total > 0 => {
            let pct = (u128::from(bytes_downloaded) * 100 / u128::from(total)).min(100);
            pct as u32
        }
        _ => 0,
    }
}

/// Batch status derived from its files: ERROR > DOWNLOADING > all DOWNLOADED > QUEUED.
pub fn derive_batch_status<'a, I>(files: I) -> (Status, Option<DownloadFailure>)
where
    I: IntoIterator<Item = (FileStatus, Option<&'a DownloadFailure>)>,
{
    let mut any_downloading = false;
    let mut all_downloaded = true;
    let mut any_file = false;

    for (status, error) in files {
        any_file = true;
        match status {
            FileStatus::Error => {
                let failure = error.cloned().unwrap_or_else(|| {
                    DownloadFailure::new(DownloadErrorType::Unknown, "file failed without a reason")
                });
                return (Status::Error, Some(failure));
            }
            FileStatus::Downloading => {
                any_downloading = true;
                all_downloaded = false;
            }
            FileStatus::Downloaded => {}
            _ => all_downloaded = false,
        }
    }

    if any_downloading {
        (Status::Downloading, None)
    } else if any_file && all_downloaded {
        (Status::Downloaded, None)
    } else {
        (Status::Queued, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FILE_STATUSES: [FileStatus; 7] = [
        FileStatus::Queued,
        FileStatus::Downloading,
        FileStatus::Downloaded,
        FileStatus::Error,
        FileStatus::Paused,
        FileStatus::WaitingForNetwork,
        FileStatus::Deleted,
    ];

    fn expected(statuses: &[FileStatus]) -> Status {
        if statuses.contains(&FileStatus::Error) {
            Status::Error
        } else if statuses.contains(&FileStatus::Downloading) {
            Status::Downloading
        } else if statuses.iter().all(|s| *s == FileStatus::Downloaded) {
            Status::Downloaded
        } else {
            Status::Queued
        }
    }

    #[test]
    fn aggregation_follows_precedence_for_every_pair_and_triple() {
        for a in ALL_FILE_STATUSES {
            for b in ALL_FILE_STATUSES {
                let pair = [a, b];
                let (derived, _) = derive_batch_status(pair.iter().map(|s| (*s, None)));
                assert_eq!(derived, expected(&pair), "files {pair:?}");

                for c in ALL_FILE_STATUSES {
                    let triple = [a, b, c];
                    let (derived, _) = derive_batch_status(triple.iter().map(|s| (*s, None)));
                    assert_eq!(derived, expected(&triple), "files {triple:?}");
                }
            }
        }
    }

    #[test]
    fn aggregation_propagates_first_error() {
        let first = DownloadFailure::new(DownloadErrorType::FileCannotBeWritten, "disk");
        let second = DownloadFailure::new(DownloadErrorType::NetworkErrorCannotDownloadFile, "net");
        let files = [
            (FileStatus::Downloaded, None),
            (FileStatus::Error, Some(&first)),
            (FileStatus::Error, Some(&second)),
        ];

        let (status, error) = derive_batch_status(files);

        assert_eq!(status, Status::Error);
        assert_eq!(error, Some(first));
    }

    #[test]
    fn empty_batch_is_queued() {
        let (status, _) = derive_batch_status(std::iter::empty());
        assert_eq!(status, Status::Queued);
    }

    #[test]
    fn percentage_truncates() {
        assert_eq!(percentage(900, Some(1500)), 60);
        assert_eq!(percentage(999, Some(1000)), 99);
        assert_eq!(percentage(1, Some(3)), 33);
        assert_eq!(percentage(10, None), 0);
        assert_eq!(percentage(10, Some(0)), 0);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            Status::Queued,
            Status::Downloading,
            Status::Paused,
            Status::WaitingForNetwork,
            Status::Downloaded,
            Status::Error,
            Status::Deletion,
            Status::Deleted,
        ] {
            assert_eq!(status.as_str().parse::<Status>(), Ok(status));
        }
    }

    #[test]
    fn transitions_clear_or_keep_errors() {
        let mut status = InternalDownloadBatchStatus::new(
            DownloadBatchId::new("b"),
            DownloadBatchTitle::new("t"),
            PathBuf::from("/data"),
            Status::Queued,
        );
        status.mark_as_error(DownloadFailure::new(DownloadErrorType::Unknown, "boom"));
        assert!(status.snapshot().download_error.is_some());

        status.mark_as_paused();
        assert_eq!(status.status(), Status::Paused);
        assert!(status.snapshot().download_error.is_some());

        status.mark_as_queued();
        assert!(status.snapshot().download_error.is_none());

        status.mark_as_downloaded(42);
        let snapshot = status.snapshot();
        assert_eq!(snapshot.status, Status::Downloaded);
        assert_eq!(snapshot.downloaded_date_time_ms, Some(42));
    }
}
