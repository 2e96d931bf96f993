//! Inbox directory file source.
//!
//! Files are dropped (by SFTP, a sync agent, ...) into
//! `<root>/<shop_domain>/<pipeline>/`; the newest regular file wins.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use pipesync_core::{PipelineType, Tenant};
use pipesync_pipelines::{CollaboratorError, FileSource, RemoteFile};

#[derive(Debug, Clone)]
pub struct DirectoryFileSource {
    root: PathBuf,
}

impl DirectoryFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, tenant: &Tenant, pipeline: PipelineType) -> Result<PathBuf, CollaboratorError> {
        check_component(&tenant.shop_domain)?;
        Ok(self.root.join(&tenant.shop_domain).join(pipeline.as_str()))
    }
}

/// A single path component: no separators, not `.`/`..`, not hidden.
fn check_component(name: &str) -> Result<(), CollaboratorError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && Path::new(name).file_name().is_some_and(|n| n == name);
    if valid {
        Ok(())
    } else {
        Err(CollaboratorError::Rejected(format!("invalid path component `{name}`")))
    }
}

fn io_error(path: &Path, err: io::Error) -> CollaboratorError {
    if err.kind() == io::ErrorKind::NotFound {
        CollaboratorError::NotFound(path.display().to_string())
    } else {
        CollaboratorError::Transport(format!("{}: {err}", path.display()))
    }
}

#[async_trait]
impl FileSource for DirectoryFileSource {
    async fn latest(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
    ) -> Result<Option<RemoteFile>, CollaboratorError> {
        let dir = self.dir(tenant, pipeline)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "inbox directory does not exist");
                return Ok(None);
            }
            Err(err) => return Err(io_error(&dir, err)),
        };

        let mut newest: Option<RemoteFile> = None;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata().await.map_err(|e| io_error(&entry.path(), e))?;
            if !metadata.is_file() {
                continue;
            }
            let modified_at: DateTime<Utc> = metadata
                .modified()
                .map_err(|e| io_error(&entry.path(), e))?
                .into();

            let candidate = RemoteFile { name, modified_at };
            let newer = newest.as_ref().is_none_or(|current| {
                (candidate.modified_at, &candidate.name) > (current.modified_at, &current.name)
            });
            if newer {
                newest = Some(candidate);
            }
        }
        Ok(newest)
    }

    async fn fetch(
        &self,
        tenant: &Tenant,
        pipeline: PipelineType,
        name: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        check_component(name)?;
        let path = self.dir(tenant, pipeline)?.join(name);
        tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))
    }
}
