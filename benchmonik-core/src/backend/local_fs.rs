//! Local filesystem object storage.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::pin::pin;

use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::{ReaderStream, StreamReader};

use super::common::{
    BackendError, BackendResult, ObjectData, ObjectHandle, ObjectStorage, SizeMap, StorageClient,
};
use crate::stream::PayloadStream;

/// Object storage in a local directory, one file per object under `<root>/<session>/<result>`.
///
/// Uploads are staged in a temporary file directly below the root and moved into place once
/// complete. An upload that fails or is dropped halfway leaves no file behind.
#[derive(Debug)]
pub struct LocalFsObjectStorage {
    root: PathBuf,
    chunk_size: usize,
    sync: bool,
}

impl LocalFsObjectStorage {
    /// Stores objects below `root` and reads them back in chunks of `chunk_size` bytes.
    pub fn new(root: &Path, chunk_size: usize) -> Self {
        Self {
            root: root.into(),
            chunk_size: chunk_size.max(1),
            sync: true,
        }
    }

    /// Sets whether every upload is synced to disk before it completes. Defaults to `true`.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// The directory objects are stored in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, handle: &ObjectHandle) -> BackendResult<PathBuf> {
        let relative = std::str::from_utf8(handle.as_bytes())
            .map(Path::new)
            .map_err(|_| BackendError::NotFound(handle.clone()))?;
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(BackendError::NotFound(handle.clone()));
        }
        Ok(self.root.join(relative))
    }
}

fn validate_segment(key: &str, value: &str) -> BackendResult<()> {
    let mut components = Path::new(value).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(BackendError::InvalidSetting {
            key: key.into(),
            reason: format!("`{value}` is not a single path segment"),
        }),
    }
}

#[async_trait::async_trait]
impl StorageClient for LocalFsObjectStorage {
    fn name(&self) -> &'static str {
        "localstorage"
    }

    async fn init(&self) -> BackendResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStorage for LocalFsObjectStorage {
    async fn add_or_update(
        &self,
        data: &ObjectData,
        chunks: PayloadStream,
    ) -> BackendResult<ObjectHandle> {
        validate_segment("session_id", &data.session_id)?;
        validate_segment("result_id", &data.result_id)?;

        let handle = ObjectHandle::new(format!("{}/{}", data.session_id, data.result_id));
        tokio::fs::create_dir_all(&self.root).await?;
        let (file, staged) = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&self.root)?
            .into_parts();

        let mut reader = pin!(StreamReader::new(chunks));
        let mut writer = BufWriter::new(File::from_std(file));

        tokio::io::copy(&mut reader, &mut writer).await?;
        writer.flush().await?;
        let file = writer.into_inner();
        if self.sync {
            file.sync_data().await?;
        }
        drop(file);

        let dir = self.root.join(&data.session_id);
        tokio::fs::create_dir_all(&dir).await?;
        staged
            .persist(dir.join(&data.result_id))
            .map_err(|err| err.error)?;

        Ok(handle)
    }

    async fn get_values(&self, handle: &ObjectHandle) -> BackendResult<PayloadStream> {
        let path = self.path(handle)?;
        let file = match OpenOptions::new().read(true).open(path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackendError::NotFound(handle.clone()));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(ReaderStream::with_capacity(file, self.chunk_size).boxed())
    }

    async fn get_sizes(&self, handles: &[ObjectHandle]) -> BackendResult<SizeMap> {
        let mut sizes = SizeMap::with_capacity(handles.len());
        for handle in handles {
            let size = match self.path(handle) {
                Ok(path) => match tokio::fs::metadata(path).await {
                    Ok(metadata) => Some(metadata.len()),
                    Err(err) if err.kind() == ErrorKind::NotFound => None,
                    Err(err) => return Err(err.into()),
                },
                Err(_) => None,
            };
            sizes.insert(handle.clone(), size);
        }
        Ok(sizes)
    }

    async fn try_delete(&self, handles: &[ObjectHandle]) -> BackendResult<()> {
        for handle in handles {
            let Ok(path) = self.path(handle) else {
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
            // Session directories are removed with their last object.
            if let Some(parent) = path.parent().filter(|p| *p != self.root.as_path()) {
                match tokio::fs::remove_dir(parent).await {
                    Ok(()) => {}
                    Err(err)
                        if matches!(
                            err.kind(),
                            ErrorKind::DirectoryNotEmpty | ErrorKind::NotFound
                        ) => {}
                    Err(err) => tracing::debug!(
                        dir = %parent.display(),
                        error = &err as &dyn std::error::Error,
                        "failed to remove session directory"
                    ),
                }
            }
        }
        Ok(())
    }
}
