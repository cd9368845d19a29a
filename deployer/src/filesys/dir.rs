//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeployError;
use crate::filesys::file::File;

const TEMP_ID_LEN: usize = 8;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Blocking variant of [`Dir::delete`] for use from `Drop`
    pub fn delete_blocking(&self) -> std::io::Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Create a private (0700) temporary directory named `<prefix>-<8 hex>`.
    ///
    /// The name stays short: unix socket paths inside it are limited to
    /// 104 bytes on macOS.
    pub async fn create_temp_dir(prefix: &str) -> Result<Dir, DeployError> {
        let mut attempts = 0;
        let temp_dir = loop {
            let mut id = uuid::Uuid::new_v4().simple().to_string();
            id.truncate(TEMP_ID_LEN);
            let candidate = std::env::temp_dir().join(format!("{}-{}", prefix, id));
            match fs::create_dir(&candidate).await {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempts < 8 => {
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_dir, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(Dir::new(temp_dir))
    }
}
