//! Seams between the sync pipeline and the two remote services.

use crate::common::types::{FileEntry, RemoteResult};
use async_trait::async_trait;
use std::path::Path;

/// Remote file storage holding the activity files to sync.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Lists every entry directly under `folder`.
    async fn list_folder(&self, folder: &str) -> RemoteResult<Vec<FileEntry>>;

    async fn download(&self, path: &str) -> RemoteResult<Vec<u8>>;

    /// Looks up `path`; a missing path is `RemoteError::NotFound`.
    async fn get_metadata(&self, path: &str) -> RemoteResult<FileEntry>;

    async fn create_folder(&self, path: &str) -> RemoteResult<()>;

    async fn move_file(&self, from_path: &str, to_path: &str) -> RemoteResult<()>;

    async fn delete_file(&self, path: &str) -> RemoteResult<()>;
}

/// Fitness tracking service accepting activity uploads.
#[async_trait]
pub trait ActivityUploader: Send + Sync {
    /// Uploads a local activity file. An activity that already exists is
    /// reported as `RemoteError::Conflict`.
    async fn upload_activity(&self, file: &Path) -> RemoteResult<()>;
}
