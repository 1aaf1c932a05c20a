//! Profile storage.
//!
//! The last-used [`SessionConfig`] is kept as a single JSON document in
//! the per-user configuration directory so the next run can start with
//! `sshveil cli` and no flags.

use std::path::PathBuf;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::SessionConfig;

/// Profile storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per-user configuration directory for this application.
pub fn config_dir() -> Result<PathBuf, StorageError> {
    dirs::config_dir()
        .map(|dir| dir.join("sshveil"))
        .ok_or(StorageError::NoConfigDir)
}

/// Path of the saved profile.
pub fn profile_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Loads and saves the session profile.
pub struct ProfileStorage {
    path: PathBuf,
}

impl ProfileStorage {
    /// Storage at the default per-user location.
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: profile_file()?,
        })
    }

    /// Storage at a custom path (for testing).
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load the saved profile. A missing file is not an error; a
    /// corrupted file is backed up and treated as missing.
    pub async fn load(&self) -> Result<Option<SessionConfig>, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<SessionConfig>(&contents) {
                Ok(profile) => Ok(Some(profile)),
                Err(e) => {
                    tracing::warn!("profile file corrupted: {}", e);
                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "corrupted profile backed up to {:?}, starting fresh",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("failed to back up corrupted profile: {}", backup_err);
                        }
                    }
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save the profile. Writes to a temp file first, then renames, so a
    /// crash mid-write cannot destroy the previous profile. The file
    /// carries credentials in plain text and is therefore created with
    /// mode 0600 on Unix.
    pub async fn save(&self, profile: &SessionConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(profile)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Copy the current profile aside with a timestamp suffix.
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}
