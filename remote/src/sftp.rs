//! Random-access transfer channel over the `sftp` subsystem

use crate::ssh::ClientHandler;
use crate::{Error, RemoteEntry, RemoteMetadata, Result, TransferChannel};
use common::progress::ProgressReporter;
use russh::client::Handle;
use russh_sftp::client::SftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::protocol::StatusCode;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::instrument;

pub struct SftpChannel {
    sftp: SftpSession,
    handle: Arc<Handle<ClientHandler>>,
    host: String,
    io_timeout: Duration,
}

fn is_not_found(error: &SftpError) -> bool {
    matches!(error, SftpError::Status(status) if status.status_code == StatusCode::NoSuchFile)
}

/// Every directory `create_dir_all` has to walk through for `path`, outermost first.
///
/// Empty components are dropped, so `"/a//b/"` yields `["/a", "/a/b"]`. Relative paths stay
/// relative.
fn dir_prefixes(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut prefix = String::with_capacity(path.len());
    let mut prefixes = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if absolute || !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(component);
        prefixes.push(prefix.clone());
    }
    prefixes
}

impl SftpChannel {
    pub(crate) async fn open(
        handle: Arc<Handle<ClientHandler>>,
        host: &str,
        io_timeout: Duration,
    ) -> Result<Self> {
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::connection(host, e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::connection(host, e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::connection(host, e))?;
        Ok(Self {
            sftp,
            handle,
            host: host.to_string(),
            io_timeout,
        })
    }
    /// Errors seen after the connection went away are connection failures, not transfer ones.
    fn classify(&self, path: &str, error: impl Into<anyhow::Error>) -> Error {
        if self.handle.is_closed() {
            Error::connection(self.host.clone(), error)
        } else {
            Error::transfer(path, error)
        }
    }
    fn classify_io(&self, path: &str, error: std::io::Error) -> Error {
        self.classify(path, error)
    }
}

impl TransferChannel for SftpChannel {
    async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        match self.sftp.metadata(path).await {
            Ok(attrs) => Ok(Some(RemoteMetadata {
                size: attrs.size,
                is_dir: attrs.is_dir(),
            })),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(self.classify(path, error)),
        }
    }
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| self.classify(path, e))?;
        let mut listing: Vec<RemoteEntry> = entries
            .map(|entry| {
                let attrs = entry.metadata();
                RemoteEntry {
                    name: entry.file_name(),
                    metadata: RemoteMetadata {
                        size: attrs.size,
                        is_dir: attrs.is_dir(),
                    },
                }
            })
            .filter(|entry| entry.name != "." && entry.name != "..")
            .collect();
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
    #[instrument(skip(self))]
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        if let Some(existing) = self.metadata(path).await? {
            if existing.is_dir {
                return Ok(());
            }
            return Err(Error::transfer(
                path,
                anyhow::anyhow!("exists and is not a directory"),
            ));
        }
        for prefix in dir_prefixes(path) {
            match self.metadata(&prefix).await? {
                Some(md) if md.is_dir => continue,
                Some(_) => {
                    return Err(Error::transfer(
                        prefix.as_str(),
                        anyhow::anyhow!("exists and is not a directory"),
                    ));
                }
                None => {}
            }
            if let Err(error) = self.sftp.create_dir(prefix.as_str()).await {
                // lost a race with another creator, or the server reports "failure" for EEXIST
                match self.metadata(&prefix).await? {
                    Some(md) if md.is_dir => {}
                    _ => return Err(self.classify(&prefix, error)),
                }
            }
            tracing::debug!("created remote directory {prefix}");
        }
        Ok(())
    }
    #[instrument(skip(self, reporter))]
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        crate::ensure_local_parent(local).await?;
        let mut source = self
            .sftp
            .open(remote)
            .await
            .map_err(|e| self.classify(remote, e))?;
        let mut sink = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::local_io(local, e))?;
        let copied = crate::pump(&mut source, &mut sink, None, self.io_timeout, reporter)
            .await
            .map_err(|e| match e {
                crate::PumpError::Read(e) => self.classify_io(remote, e),
                crate::PumpError::Write(e) => Error::local_io(local, e),
            })?;
        if let Err(error) = source.shutdown().await {
            tracing::debug!("closing remote handle for {remote} failed: {error}");
        }
        tracing::debug!("downloaded {remote} ({})", bytesize::ByteSize(copied));
        Ok(copied)
    }
    #[instrument(skip(self, reporter))]
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        if let Some(parent) = crate::remote_parent(remote) {
            self.create_dir_all(parent).await?;
        }
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::local_io(local, e))?;
        let mut sink = self
            .sftp
            .create(remote)
            .await
            .map_err(|e| self.classify(remote, e))?;
        let copied = crate::pump(&mut source, &mut sink, None, self.io_timeout, reporter)
            .await
            .map_err(|e| match e {
                crate::PumpError::Read(e) => Error::local_io(local, e),
                crate::PumpError::Write(e) => self.classify_io(remote, e),
            })?;
        sink.shutdown()
            .await
            .map_err(|e| self.classify_io(remote, e))?;
        tracing::debug!("uploaded {remote} ({})", bytesize::ByteSize(copied));
        Ok(copied)
    }
    async fn remove_file(&self, path: &str) -> Result<()> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| self.classify(path, e))
    }
    async fn close(&self) -> Result<()> {
        self.sftp
            .close()
            .await
            .map_err(|e| Error::connection(self.host.clone(), e))
    }
}
