use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Uploads kept in a directory on this host
#[derive(Clone, Debug)]
pub struct LocalStore {
    base_dir: PathBuf,
}

/// Size of the upload directory
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirUsage {
    pub file_count: u64,
    pub total_bytes: u64,
    pub total_mb: f64,
}

impl LocalStore {
    /// Open the store, creating the directory if needed
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)
            .await
            .with_context(|| format!("Failed to create upload dir {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        let normalized = filename.trim_start_matches('/');
        self.base_dir.join(Path::new(normalized))
    }

    /// Write through a `.part` file; nothing is left behind on failure
    pub async fn write(&self, filename: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.path_for(filename);
        let partial = partial_path(&path);

        let written = match fs::write(&partial, data).await {
            Ok(()) => fs::rename(&partial, &path).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            self.remove_quietly(&partial).await;
            return Err(err)
                .with_context(|| format!("Failed to save file to disk: {}", path.display()));
        }

        debug!(path = %path.display(), size_bytes = data.len(), "File written");
        Ok(path)
    }

    pub async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub async fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).await.is_ok()
    }

    /// Remove a file; a missing file is not an error
    pub async fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }

    /// Remove a file, logging rather than returning failures
    pub async fn remove_quietly(&self, path: &Path) {
        if let Err(e) = self.remove(path).await {
            warn!(error = %e, path = %path.display(), "Failed to remove local file");
        }
    }

    /// Pixel dimensions read from the file header
    pub async fn image_dimensions(&self, path: &Path) -> Option<(u32, u32)> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || crate::image_prep::dimensions_of_file(&path))
            .await
            .ok()
            .flatten()
    }

    pub async fn usage(&self) -> Result<DirUsage> {
        let mut usage = DirUsage::default();
        let mut dir = match fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(usage),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                usage.file_count += 1;
                usage.total_bytes += metadata.len();
            }
        }
        usage.total_mb = round2(usage.total_bytes as f64 / (1024.0 * 1024.0));
        Ok(usage)
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    path.with_file_name(format!(".{name}.part"))
}

pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
