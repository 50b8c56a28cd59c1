//! Local-disk persistence driver.
//!
//! Backups land under `<base>/cachegrid/backups/<flavor>-<name>.backup`.
//! Names are sanitized before any filesystem access: no separators, no
//! relative components, no control or reserved characters.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cachegrid_core::CacheFlavor;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::ValidationError;
use crate::persistence::{ByteSource, PersistenceDriver};

/// Characters rejected in backup names besides separators and controls.
const RESERVED: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

/// Validates a backup name against the filename rules.
pub fn sanitize_backup_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &'static str| ValidationError::InvalidBackupName {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("path separators are not allowed"));
    }
    if name == "." || name == ".." || name.contains("..") {
        return Err(invalid("relative path components are not allowed"));
    }
    if name
        .chars()
        .any(|c| c.is_control() || RESERVED.contains(&c))
    {
        return Err(invalid("control or reserved characters are not allowed"));
    }
    Ok(())
}

/// Driver persisting backups as files under a base directory.
pub struct LocalDiskDriver {
    base: PathBuf,
}

impl LocalDiskDriver {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn backup_path(&self, flavor: CacheFlavor, name: &str) -> PathBuf {
        self.base
            .join("cachegrid")
            .join("backups")
            .join(format!("{flavor}-{name}.backup"))
    }

    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }
}

#[async_trait]
impl PersistenceDriver for LocalDiskDriver {
    fn name(&self) -> &str {
        "local"
    }

    async fn backup(
        &self,
        flavor: CacheFlavor,
        mut stream: ByteSource,
        name: &str,
    ) -> anyhow::Result<()> {
        sanitize_backup_name(name)?;
        let path = self.backup_path(flavor, name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        tracing::debug!(path = %path.display(), "backup written");
        Ok(())
    }

    async fn restore(&self, flavor: CacheFlavor, name: &str) -> anyhow::Result<ByteSource> {
        sanitize_backup_name(name)?;
        let path = self.backup_path(flavor, name);
        let file = fs::File::open(&path)
            .await
            .map_err(|source| anyhow::anyhow!("cannot open backup {}: {source}", path.display()))?;
        Ok(Box::new(file))
    }
}
