use crate::common::config::Config;
use crate::common::metrics;
use crate::common::ports::{ActivityUploader, FileStorage};
use crate::common::types::{Disposition, FileEntry, RemoteError, RemoteResult};
use function_timer::time;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// How the tracking service took the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadResult {
    Uploaded,
    /// Rejected as already existing, which counts as delivered
    Duplicate,
}

/// Terminal state of one source file after a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    DownloadFailed,
    UploadFailed,
    Archived,
    Deleted,
    /// Uploaded, but still in the source folder
    LeftInPlace,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub uploaded: usize,
    pub duplicates: usize,
    pub download_failed: usize,
    pub upload_failed: usize,
    pub archived: usize,
    pub deleted: usize,
    pub left_in_place: usize,
}

impl SyncStats {
    fn record(&mut self, upload: Option<UploadResult>, outcome: FileOutcome) {
        match upload {
            Some(UploadResult::Uploaded) => self.uploaded += 1,
            Some(UploadResult::Duplicate) => self.duplicates += 1,
            None => {}
        }
        match outcome {
            FileOutcome::DownloadFailed => self.download_failed += 1,
            FileOutcome::UploadFailed => self.upload_failed += 1,
            FileOutcome::Archived => self.archived += 1,
            FileOutcome::Deleted => self.deleted += 1,
            FileOutcome::LeftInPlace => self.left_in_place += 1,
        }
    }
}

/// One pass over the source folder: download, upload, then move or delete
/// each file. Files are handled one at a time and a failure only affects the
/// file it happened on.
pub struct SyncPipeline<'a> {
    storage: &'a dyn FileStorage,
    uploader: &'a dyn ActivityUploader,
    folder: String,
    archive_folder: String,
    disposition: Disposition,
    download_dir: PathBuf,
}

impl<'a> SyncPipeline<'a> {
    pub fn new(
        storage: &'a dyn FileStorage,
        uploader: &'a dyn ActivityUploader,
        config: &Config,
    ) -> Self {
        Self {
            storage,
            uploader,
            folder: config.dropbox_folder.clone(),
            archive_folder: config.processed_folder(),
            disposition: config.disposition.clone(),
            download_dir: config.download_dir.clone(),
        }
    }

    /// Runs the pass. Only a failure to prepare the download directory or to
    /// list the folder is returned; per-file failures are logged and counted.
    #[time("sync_run_duration")]
    pub async fn run(&self) -> Result<SyncStats, RemoteError> {
        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .inspect_err(|e| {
                error!(
                    "Error creating download directory '{}': {}",
                    self.download_dir.display(),
                    e
                )
            })?;

        let entries = self
            .storage
            .list_folder(&self.folder)
            .await
            .inspect_err(|e| error!("Error listing Dropbox folder '{}': {}", self.folder, e))?;

        let files: Vec<FileEntry> = entries.into_iter().filter(|e| e.is_file()).collect();
        info!("Found {} files in {}", files.len(), self.folder);

        let mut stats = SyncStats::default();
        for entry in &files {
            let (upload, outcome) = self.process_file(entry).await;
            stats.record(upload, outcome);
        }

        info!(
            "Finished: {} uploaded, {} already existed, {} archived, {} deleted, {} left in place, {} download failures, {} upload failures",
            stats.uploaded,
            stats.duplicates,
            stats.archived,
            stats.deleted,
            stats.left_in_place,
            stats.download_failed,
            stats.upload_failed
        );
        Ok(stats)
    }

    #[time("process_file_duration")]
    async fn process_file(&self, entry: &FileEntry) -> (Option<UploadResult>, FileOutcome) {
        info!("Processing file: {}", entry.name);
        let local_file = self.download_dir.join(&entry.name);

        if let Err(e) = self.download(entry, &local_file).await {
            error!("Error downloading '{}': {}", entry.name, e);
            metrics::increment_files_download_failed();
            return (None, FileOutcome::DownloadFailed);
        }
        info!("Downloaded '{}' to '{}'", entry.name, local_file.display());

        let upload = match self.uploader.upload_activity(&local_file).await {
            Ok(()) => {
                info!("Uploaded '{}' to Garmin.", entry.name);
                metrics::increment_files_uploaded();
                UploadResult::Uploaded
            }
            Err(e) if e.is_conflict() => {
                info!("Activity already exists (409) for '{}'.", entry.name);
                metrics::increment_files_duplicate();
                UploadResult::Duplicate
            }
            Err(e) => {
                error!("Error uploading '{}': {}", entry.name, e);
                metrics::increment_files_upload_failed();
                return (None, FileOutcome::UploadFailed);
            }
        };

        let outcome = self.post_process(entry).await;
        if outcome == FileOutcome::LeftInPlace {
            metrics::increment_files_post_process_failed();
        }
        (Some(upload), outcome)
    }

    async fn download(&self, entry: &FileEntry, local_file: &Path) -> RemoteResult<()> {
        let data = self.storage.download(&entry.path).await?;
        tokio::fs::write(local_file, data).await?;
        Ok(())
    }

    async fn post_process(&self, entry: &FileEntry) -> FileOutcome {
        match &self.disposition {
            Disposition::Move => self.archive(entry).await,
            Disposition::Delete => match self.storage.delete_file(&entry.path).await {
                Ok(()) => {
                    info!("Deleted '{}' from Dropbox.", entry.name);
                    FileOutcome::Deleted
                }
                Err(e) => {
                    error!("Error deleting '{}': {}", entry.name, e);
                    FileOutcome::LeftInPlace
                }
            },
            Disposition::Unknown(strategy) => {
                error!("Unknown POST_UPLOAD_STRATEGY: {}", strategy);
                FileOutcome::LeftInPlace
            }
        }
    }

    async fn archive(&self, entry: &FileEntry) -> FileOutcome {
        if let Err(e) = self.ensure_archive_folder().await {
            error!("Error creating folder '{}': {}", self.archive_folder, e);
            return FileOutcome::LeftInPlace;
        }

        let dest_path = format!("{}/{}", self.archive_folder, entry.name);
        match self.storage.move_file(&entry.path, &dest_path).await {
            Ok(()) => {
                info!("Moved '{}' to '{}'.", entry.name, dest_path);
                FileOutcome::Archived
            }
            Err(e) => {
                error!("Error moving '{}': {}", entry.name, e);
                FileOutcome::LeftInPlace
            }
        }
    }

    /// Creates the archive folder when the metadata probe reports it missing.
    /// Other probe failures are logged and the move is still attempted.
    async fn ensure_archive_folder(&self) -> RemoteResult<()> {
        match self.storage.get_metadata(&self.archive_folder).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => match self.storage.create_folder(&self.archive_folder).await {
                Ok(()) => {
                    info!("Created folder: {}", self.archive_folder);
                    Ok(())
                }
                Err(e) if e.is_conflict() => Ok(()),
                Err(e) => Err(e),
            },
            Err(e) => {
                warn!("Could not check folder '{}': {}", self.archive_folder, e);
                Ok(())
            }
        }
    }
}
