//! Remote side of the clustercp tools
//!
//! A [`Transport`] is one authenticated SSH connection plus the [`TransferChannel`] used to move
//! file data over it. Sessions are produced by a [`Connector`] and normally handed out by a
//! [`cache::SessionCache`], which keeps a single session warm across transfers and replaces it
//! when it stops answering.
//!
//! Two channel flavors exist: [`sftp::SftpChannel`] (random access through the `sftp`
//! subsystem) and [`scp::ScpChannel`] (stream copy through `scp -t` / `scp -f`).
//!
//! Remote paths are plain POSIX strings; local paths are [`std::path::Path`].

use common::progress::ProgressReporter;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod auth;
pub mod cache;
pub mod error;
#[cfg(any(test, feature = "loopback"))]
pub mod loopback;
pub mod scp;
pub mod sftp;
pub mod ssh;

pub use error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Where to connect and as whom.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(user: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
        }
    }
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of a command run on the remote shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
    /// Turns a non-zero exit into [`Error::RemoteCommand`].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::RemoteCommand {
                command: command.to_string(),
                exit_status: self.exit_status,
                stderr: self.stderr_text(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Alive,
    Dead,
}

/// Lock-free holder for a session's [`Liveness`].
#[derive(Debug)]
pub struct LivenessCell(AtomicU8);

impl LivenessCell {
    pub fn new(liveness: Liveness) -> Self {
        Self(AtomicU8::new(Self::encode(liveness)))
    }
    fn encode(liveness: Liveness) -> u8 {
        match liveness {
            Liveness::Unknown => 0,
            Liveness::Alive => 1,
            Liveness::Dead => 2,
        }
    }
    pub fn get(&self) -> Liveness {
        match self.0.load(Ordering::Acquire) {
            1 => Liveness::Alive,
            2 => Liveness::Dead,
            _ => Liveness::Unknown,
        }
    }
    pub fn set(&self, liveness: Liveness) {
        self.0.store(Self::encode(liveness), Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMetadata {
    /// `None` when the server did not report a size
    pub size: Option<u64>,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// Moves file data and manipulates the remote namespace.
///
/// `download` and `upload` create the destination's parent directories, call
/// [`ProgressReporter::update`] with the cumulative byte count (starting at 0), and return the
/// number of bytes copied. They do not call `begin` or `finish`; that is up to the caller.
#[allow(async_fn_in_trait)]
pub trait TransferChannel {
    /// `Ok(None)` when nothing exists at `path`.
    async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>>;
    /// Entries of `path` excluding `.` and `..`, sorted by name.
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;
    /// Creates `path` and any missing parents; an existing directory is not an error.
    async fn create_dir_all(&self, path: &str) -> Result<()>;
    async fn download(
        &self,
        remote: &str,
        local: &std::path::Path,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64>;
    async fn upload(
        &self,
        local: &std::path::Path,
        remote: &str,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<u64>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// An authenticated connection together with its transfer channel.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Channel: TransferChannel;
    fn target(&self) -> &Target;
    fn channel(&self) -> &Self::Channel;
    fn liveness(&self) -> Liveness;
    /// Runs `command` through the remote shell and collects its output.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;
    /// Probes the connection with a trivial command; updates [`Transport::liveness`].
    async fn is_alive(&self) -> bool;
    /// Closes the channel, then the connection. Errors are logged, never returned; calling it
    /// twice is harmless.
    async fn close(&self);
}

/// Produces authenticated sessions.
#[allow(async_fn_in_trait)]
pub trait Connector {
    type Session: Transport;
    /// Fails with [`Error::Authentication`] or [`Error::Connection`].
    async fn connect(&self, target: &Target) -> Result<Self::Session>;
}

/// Quotes `s` for a POSIX shell.
pub fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Final component of a remote path, ignoring trailing slashes.
pub fn remote_basename(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

/// Parent of a remote path; `None` for bare names and `/`.
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(pos) => Some(&trimmed[..pos]),
        None => None,
    }
}

pub(crate) const CHUNK_SIZE: usize = 32 * 1024;

/// Which end of a [`pump`] failed.
#[derive(Debug)]
pub(crate) enum PumpError {
    Read(std::io::Error),
    Write(std::io::Error),
}

fn timed_out(what: &str, after: Duration) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!(
            "{what} timed out after {}",
            humantime::format_duration(after)
        ),
    )
}

/// Copies `reader` into `writer` in fixed-size chunks, reporting cumulative bytes after each
/// chunk. Every individual read and write is bounded by `io_timeout`.
pub(crate) async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    limit: Option<u64>,
    io_timeout: Duration,
    reporter: &mut dyn ProgressReporter,
) -> std::result::Result<u64, PumpError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    reporter.update(0);
    loop {
        let want = match limit {
            Some(limit) => (limit - copied).min(CHUNK_SIZE as u64) as usize,
            None => CHUNK_SIZE,
        };
        if want == 0 {
            break;
        }
        let n = tokio::time::timeout(io_timeout, reader.read(&mut buf[..want]))
            .await
            .map_err(|_| PumpError::Read(timed_out("read", io_timeout)))?
            .map_err(PumpError::Read)?;
        if n == 0 {
            break;
        }
        tokio::time::timeout(io_timeout, writer.write_all(&buf[..n]))
            .await
            .map_err(|_| PumpError::Write(timed_out("write", io_timeout)))?
            .map_err(PumpError::Write)?;
        copied += n as u64;
        reporter.update(copied);
    }
    tokio::time::timeout(io_timeout, writer.flush())
        .await
        .map_err(|_| PumpError::Write(timed_out("flush", io_timeout)))?
        .map_err(PumpError::Write)?;
    Ok(copied)
}

/// Creates the parent directory of a local destination file.
pub(crate) async fn ensure_local_parent(local: &std::path::Path) -> Result<()> {
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|error| Error::local_io(parent, error))?;
    }
    Ok(())
}
