use std::{
    io::ErrorKind,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use courier_common::internal;
use serde::Deserialize;
use tokio::fs;
use tracing::warn;

use crate::{MailId, SpoolError, ValidationError, store::MessageStore};

/// File-based message body store
///
/// Each body is stored as `{mail_id}.eml` in a single directory.
///
/// # Security
/// - Uses atomic writes (write to a `.tmp_` file, then rename) so a crash never
///   leaves a partially written body visible
/// - Refuses identifiers that are not safe file names
/// - Only lists files whose names parse back into identifiers
#[derive(Debug, Clone)]
pub struct FileMessageStore {
    path: PathBuf,
}

impl Default for FileMessageStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/courier"),
        }
    }
}

impl<'de> Deserialize<'de> for FileMessageStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileMessageStoreHelper {
            path: PathBuf,
        }

        let helper = FileMessageStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self { path: helper.path })
    }
}

impl FileMessageStore {
    #[must_use]
    pub fn builder() -> FileMessageStoreBuilder {
        FileMessageStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate a store path
    ///
    /// Rejects `..` components, relative paths and system directories.
    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentDirectory(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
        {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    fn body_path(&self, id: &MailId) -> crate::Result<PathBuf> {
        if !id.is_path_safe() {
            return Err(ValidationError::UnsafeId(id.clone()).into());
        }

        Ok(self.path.join(format!("{id}.eml")))
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    /// Create the directory if needed and drop temporaries left by a crash
    /// between write and rename.
    async fn init(&self) -> crate::Result<()> {
        fs::create_dir_all(&self.path).await?;

        let metadata = fs::metadata(&self.path).await?;
        if !metadata.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        let mut dir = fs::read_dir(&self.path).await?;
        while let Some(file) = dir.next_entry().await? {
            let name = file.file_name();
            if name.to_string_lossy().starts_with(".tmp_") {
                if let Err(e) = fs::remove_file(file.path()).await {
                    warn!(file = ?file.path(), error = %e, "Failed to remove stale temporary file");
                }
            }
        }

        internal!(level = DEBUG, "Message store ready at {}", self.path.display());
        Ok(())
    }

    async fn put(&self, id: &MailId, body: Arc<[u8]>) -> crate::Result<()> {
        let path = self.body_path(id)?;
        let temp_path = self.path.join(format!(".tmp_{id}.eml"));

        fs::write(&temp_path, body.as_ref()).await?;
        fs::rename(&temp_path, &path).await?;

        internal!(level = TRACE, "Stored message {id} at {}", path.display());
        Ok(())
    }

    async fn get(&self, id: &MailId) -> crate::Result<Option<Arc<[u8]>>> {
        match fs::read(self.body_path(id)?).await {
            Ok(data) => Ok(Some(Arc::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpoolError::Io(e)),
        }
    }

    async fn remove(&self, id: &MailId) -> crate::Result<()> {
        match fs::remove_file(self.body_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::Io(e)),
        }
    }

    async fn list_ids(&self) -> crate::Result<Vec<MailId>> {
        let mut ids = Vec::new();
        let mut dir = fs::read_dir(&self.path).await?;

        while let Some(file) = dir.next_entry().await? {
            if let Some(id) = file.file_name().to_str().and_then(MailId::from_filename) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }
}

/// Builder for [`FileMessageStore`]
#[derive(Debug, Default)]
pub struct FileMessageStoreBuilder {
    path: PathBuf,
}

impl FileMessageStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// # Errors
    /// Returns an error if the path is invalid or points at a system directory.
    pub fn build(self) -> Result<FileMessageStore, ValidationError> {
        FileMessageStore::validate_path(&self.path)?;
        Ok(FileMessageStore { path: self.path })
    }
}
