//! The local machine playing the remote side
//!
//! Commands run through `sh -c` and files are copied with the same chunked pump the SSH
//! channels use, so the transfer engine and session cache can be exercised without a server.
//! Sessions can be killed on demand to simulate a dropped connection, and the connector can be
//! told to fail its next few attempts.

use crate::{
    CommandOutput, Connector, Error, Liveness, LivenessCell, RemoteEntry, RemoteMetadata, Result,
    Target, TransferChannel, Transport,
};
use common::Timeouts;
use common::progress::ProgressReporter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackFailure {
    Connection,
    Authentication,
}

#[derive(Debug, Default)]
pub struct LoopbackConnector {
    timeouts: Timeouts,
    temp_dir: Option<PathBuf>,
    attempts: AtomicUsize,
    connections: AtomicUsize,
    pending_failures: AtomicUsize,
    reject_login: AtomicBool,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        Self {
            timeouts,
            ..Default::default()
        }
    }
    /// Commands run with `TMPDIR` pointing at `dir`.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }
    /// Makes the next `count` connection attempts fail with `failure`.
    pub fn fail_next(&self, failure: LoopbackFailure, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
        self.reject_login
            .store(failure == LoopbackFailure::Authentication, Ordering::SeqCst);
    }
    /// Number of `connect` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
    /// Number of sessions handed out.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Connector for LoopbackConnector {
    type Session = LoopbackSession;

    async fn connect(&self, target: &Target) -> Result<LoopbackSession> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(if self.reject_login.load(Ordering::SeqCst) {
                Error::Authentication {
                    user: target.user.clone(),
                    host: target.host.clone(),
                    reason: "password rejected".to_string(),
                }
            } else {
                Error::connection(target.host.clone(), anyhow::anyhow!("connection refused"))
            });
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        let dead = Arc::new(AtomicBool::new(false));
        Ok(LoopbackSession {
            target: target.clone(),
            channel: LoopbackChannel {
                host: target.host.clone(),
                dead: dead.clone(),
                timeouts: self.timeouts,
            },
            dead,
            liveness: LivenessCell::new(Liveness::Alive),
            timeouts: self.timeouts,
            temp_dir: self.temp_dir.clone(),
        })
    }
}

#[derive(Debug)]
pub struct LoopbackSession {
    target: Target,
    channel: LoopbackChannel,
    dead: Arc<AtomicBool>,
    liveness: LivenessCell,
    timeouts: Timeouts,
    temp_dir: Option<PathBuf>,
}

impl LoopbackSession {
    /// Simulates the connection dropping: every later operation fails with a connection error.
    pub fn force_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }
    fn ensure_connected(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection(
                self.target.host.clone(),
                anyhow::anyhow!("connection closed"),
            ));
        }
        Ok(())
    }
    async fn run(&self, command: &str, timeout: std::time::Duration) -> Result<CommandOutput> {
        self.ensure_connected()?;
        let mut child = tokio::process::Command::new("sh");
        child.arg("-c").arg(command).kill_on_drop(true);
        if let Some(dir) = &self.temp_dir {
            child.env("TMPDIR", dir);
        }
        let child = child.output();
        let output = tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| {
                Error::connection(
                    self.target.host.clone(),
                    anyhow::anyhow!("`{command}` timed out"),
                )
            })?
            .map_err(|e| Error::connection(self.target.host.clone(), e))?;
        Ok(CommandOutput {
            exit_status: output.status.code().map_or(255, |code| code as u32),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl Transport for LoopbackSession {
    type Channel = LoopbackChannel;

    fn target(&self) -> &Target {
        &self.target
    }
    fn channel(&self) -> &LoopbackChannel {
        &self.channel
    }
    fn liveness(&self) -> Liveness {
        self.liveness.get()
    }
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.run(command, self.timeouts.command).await
    }
    async fn is_alive(&self) -> bool {
        let alive = matches!(
            self.run("echo ok", self.timeouts.probe).await,
            Ok(output) if output.success() && output.stdout_text().trim() == "ok"
        );
        self.liveness
            .set(if alive { Liveness::Alive } else { Liveness::Dead });
        alive
    }
    async fn close(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.liveness.set(Liveness::Dead);
    }
}

#[derive(Debug)]
pub struct LoopbackChannel {
    host: String,
    dead: Arc<AtomicBool>,
    timeouts: Timeouts,
}

impl LoopbackChannel {
    fn ensure_connected(&self) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::connection(
                self.host.clone(),
                anyhow::anyhow!("connection closed"),
            ));
        }
        Ok(())
    }
}

impl TransferChannel for LoopbackChannel {
    async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        self.ensure_connected()?;
        match tokio::fs::metadata(path).await {
            Ok(md) => Ok(Some(RemoteMetadata {
                size: Some(md.len()),
                is_dir: md.is_dir(),
            })),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(Error::transfer(path, error)),
        }
    }
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let mut entries = tokio::fs::read_dir(path)
            .await
            .map_err(|e| Error::transfer(path, e))?;
        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::transfer(path, e))?
        {
            let md = tokio::fs::metadata(entry.path())
                .await
                .map_err(|e| Error::transfer(entry.path().to_string_lossy(), e))?;
            listing.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                metadata: RemoteMetadata {
                    size: Some(md.len()),
                    is_dir: md.is_dir(),
                },
            });
        }
        listing.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listing)
    }
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::transfer(path, e))
    }
    async fn download(
        &self,
        remote: &str,
        local: &Path,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        self.ensure_connected()?;
        crate::ensure_local_parent(local).await?;
        let mut source = tokio::fs::File::open(remote)
            .await
            .map_err(|e| Error::transfer(remote, e))?;
        let mut sink = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::local_io(local, e))?;
        crate::pump(&mut source, &mut sink, None, self.timeouts.io, reporter)
            .await
            .map_err(|e| match e {
                crate::PumpError::Read(e) => Error::transfer(remote, e),
                crate::PumpError::Write(e) => Error::local_io(local, e),
            })
    }
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64> {
        self.ensure_connected()?;
        if let Some(parent) = crate::remote_parent(remote) {
            self.create_dir_all(parent).await?;
        }
        let mut source = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::local_io(local, e))?;
        let mut sink = tokio::fs::File::create(remote)
            .await
            .map_err(|e| Error::transfer(remote, e))?;
        crate::pump(&mut source, &mut sink, None, self.timeouts.io, reporter)
            .await
            .map_err(|e| match e {
                crate::PumpError::Read(e) => Error::local_io(local, e),
                crate::PumpError::Write(e) => Error::transfer(remote, e),
            })
    }
    async fn remove_file(&self, path: &str) -> Result<()> {
        self.ensure_connected()?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| Error::transfer(path, e))
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::progress::NoProgress;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn exec_captures_output_and_status() -> anyhow::Result<()> {
        let session = LoopbackConnector::new()
            .connect(&Target::new("alice", "localhost"))
            .await?;
        let output = session.exec("echo out; echo err >&2; exit 3").await?;
        assert_eq!(output.exit_status, 3);
        assert_eq!(output.stdout_text(), "out\n");
        assert_eq!(output.stderr_text(), "err\n");
        assert!(session.is_alive().await);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn forced_death_fails_fast() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = LoopbackConnector::new()
            .connect(&Target::new("alice", "localhost"))
            .await?;
        session.force_dead();
        assert!(!session.is_alive().await);
        assert_eq!(session.liveness(), Liveness::Dead);
        let error = session
            .channel()
            .download("/etc/hostname", &tmp.path().join("x"), &mut NoProgress)
            .await
            .unwrap_err();
        assert!(error.is_retryable(), "{error:?}");
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn upload_creates_remote_parents() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let local = tmp.path().join("in.txt");
        tokio::fs::write(&local, b"0123456789").await?;
        let remote = tmp.path().join("remote/a/b/out.txt");
        let session = LoopbackConnector::new()
            .connect(&Target::new("alice", "localhost"))
            .await?;
        let copied = session
            .channel()
            .upload(&local, &remote.to_string_lossy(), &mut NoProgress)
            .await?;
        assert_eq!(copied, 10);
        assert_eq!(tokio::fs::read(&remote).await?, b"0123456789");
        let md = session
            .channel()
            .metadata(&remote.to_string_lossy())
            .await?
            .unwrap();
        assert_eq!(md.size, Some(10));
        assert!(!md.is_dir);
        assert!(
            session
                .channel()
                .metadata(&tmp.path().join("missing").to_string_lossy())
                .await?
                .is_none()
        );
        Ok(())
    }
}
