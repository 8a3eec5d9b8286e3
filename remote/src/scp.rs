//! Stream-copy transfer channel speaking the classic `scp` protocol
//!
//! Data moves through `scp -t` (sink, for uploads) and `scp -f` (source, for downloads) running
//! on the remote side. Everything else (stat, listing, mkdir, rm) goes through short shell
//! commands, so the remote needs GNU `find`.

use crate::ssh::{ClientHandler, run_command};
use crate::{
    CommandOutput, Error, RemoteEntry, RemoteMetadata, Result, TransferChannel, shell_escape,
};
use common::Timeouts;
use common::progress::ProgressReporter;
use russh::client::Handle;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

const SCP_OK: u8 = 0;
const SCP_WARNING: u8 = 1;
const SCP_ERROR: u8 = 2;
/// Longest header or status line accepted from the remote side.
const MAX_LINE: usize = 4096;

pub struct ScpChannel {
    handle: Arc<Handle<ClientHandler>>,
    host: String,
    timeouts: Timeouts,
}

/// Parsed `C<mode> <size> <name>` header.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub mode: u32,
    pub size: u64,
    pub name: String,
}

impl FileHeader {
    pub(crate) fn parse(line: &str) -> anyhow::Result<Self> {
        let body = line
            .strip_prefix('C')
            .ok_or_else(|| anyhow::anyhow!("unexpected scp header: {line:?}"))?;
        let mut parts = body.splitn(3, ' ');
        let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next())
        else {
            anyhow::bail!("malformed scp header: {line:?}");
        };
        Ok(Self {
            mode: u32::from_str_radix(mode, 8)
                .map_err(|e| anyhow::anyhow!("bad mode in scp header {line:?}: {e}"))?,
            size: size
                .parse()
                .map_err(|e| anyhow::anyhow!("bad size in scp header {line:?}: {e}"))?,
            name: name.trim_end_matches('\n').to_string(),
        })
    }
    pub(crate) fn render(&self) -> String {
        format!("C{:04o} {} {}\n", self.mode & 0o777, self.size, self.name)
    }
}

/// Reads one `\n`-terminated line a byte at a time so no file data is consumed.
async fn read_line<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= MAX_LINE {
            anyhow::bail!("scp line longer than {MAX_LINE} bytes");
        }
        line.push(byte);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Waits for a status byte; warnings and errors carry a message line.
async fn read_ack<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<()> {
    match stream.read_u8().await? {
        SCP_OK => Ok(()),
        code @ (SCP_WARNING | SCP_ERROR) => {
            let message = read_line(stream).await?;
            anyhow::bail!(
                "remote scp {}: {message}",
                if code == SCP_ERROR { "error" } else { "warning" }
            )
        }
        other => anyhow::bail!("unexpected scp status byte {other:#04x}"),
    }
}

/// Client side of `scp -f`: requests the file and streams it into `sink`.
pub(crate) async fn receive_file<S, W>(
    stream: &mut S,
    sink: &mut W,
    timeouts: &Timeouts,
    reporter: &mut dyn ProgressReporter,
) -> std::result::Result<u64, ScpFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let io = timeouts.io;
    let header = tokio::time::timeout(io, async {
        stream.write_all(&[SCP_OK]).await?;
        stream.flush().await?;
        let first = stream.read_u8().await?;
        match first {
            SCP_WARNING | SCP_ERROR => {
                let message = read_line(stream).await?;
                anyhow::bail!("remote scp error: {message}");
            }
            b'C' => {
                let rest = read_line(stream).await?;
                FileHeader::parse(&format!("C{rest}"))
            }
            other => anyhow::bail!("unexpected scp record {:?}", char::from(other)),
        }
    })
    .await
    .map_err(|_| ScpFailure::Remote(anyhow::anyhow!("timed out waiting for scp header")))?
    .map_err(ScpFailure::Remote)?;
    stream
        .write_all(&[SCP_OK])
        .await
        .map_err(|e| ScpFailure::Remote(e.into()))?;
    let copied = crate::pump(stream, sink, Some(header.size), io, reporter)
        .await
        .map_err(|e| match e {
            crate::PumpError::Read(e) => ScpFailure::Remote(e.into()),
            crate::PumpError::Write(e) => ScpFailure::Local(e),
        })?;
    if copied != header.size {
        return Err(ScpFailure::Remote(anyhow::anyhow!(
            "stream ended after {copied} of {} bytes",
            header.size
        )));
    }
    tokio::time::timeout(io, async {
        read_ack(stream).await?;
        stream.write_all(&[SCP_OK]).await?;
        stream.flush().await?;
        anyhow::Ok(())
    })
    .await
    .map_err(|_| ScpFailure::Remote(anyhow::anyhow!("timed out waiting for scp trailer")))?
    .map_err(ScpFailure::Remote)?;
    Ok(copied)
}

/// Client side of `scp -t`: announces the file and streams `size` bytes from `source`.
pub(crate) async fn send_file<S, R>(
    stream: &mut S,
    source: &mut R,
    header: &FileHeader,
    timeouts: &Timeouts,
    reporter: &mut dyn ProgressReporter,
) -> std::result::Result<u64, ScpFailure>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let io = timeouts.io;
    tokio::time::timeout(io, async {
        read_ack(stream).await?;
        stream.write_all(header.render().as_bytes()).await?;
        stream.flush().await?;
        read_ack(stream).await
    })
    .await
    .map_err(|_| ScpFailure::Remote(anyhow::anyhow!("timed out waiting for scp sink")))?
    .map_err(ScpFailure::Remote)?;
    let copied = crate::pump(source, stream, Some(header.size), io, reporter)
        .await
        .map_err(|e| match e {
            crate::PumpError::Read(e) => ScpFailure::Local(e),
            crate::PumpError::Write(e) => ScpFailure::Remote(e.into()),
        })?;
    if copied != header.size {
        return Err(ScpFailure::Local(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("local file shrank to {copied} of {} bytes", header.size),
        )));
    }
    tokio::time::timeout(io, async {
        stream.write_all(&[SCP_OK]).await?;
        stream.flush().await?;
        read_ack(stream).await
    })
    .await
    .map_err(|_| ScpFailure::Remote(anyhow::anyhow!("timed out waiting for scp ack")))?
    .map_err(ScpFailure::Remote)?;
    Ok(copied)
}

/// Which side of an scp exchange went wrong.
#[derive(Debug)]
pub(crate) enum ScpFailure {
    Remote(anyhow::Error),
    Local(std::io::Error),
}

fn parse_stat(output: &CommandOutput) -> Option<RemoteMetadata> {
    let text = output.stdout_text();
    let line = text.lines().next()?;
    let (kind, size) = line.split_once(' ')?;
    Some(RemoteMetadata {
        size: size.trim().parse().ok(),
        is_dir: kind == "d",
    })
}

fn parse_listing(output: &CommandOutput) -> Vec<RemoteEntry> {
    let mut entries: Vec<RemoteEntry> = output
        .stdout
        .split(|&b| b == 0)
        .filter(|record| !record.is_empty())
        .filter_map(|record| {
            let record = String::from_utf8_lossy(record);
            let mut parts = record.splitn(3, ' ');
            let kind = parts.next()?;
            let size = parts.next()?;
            let name = parts.next()?;
            Some(RemoteEntry {
                name: name.to_string(),
                metadata: RemoteMetadata {
                    size: size.parse().ok(),
                    is_dir: kind == "d",
                },
            })
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

impl ScpChannel {
    pub(crate) fn new(handle: Arc<Handle<ClientHandler>>, host: &str, timeouts: Timeouts) -> Self {
        Self {
            handle,
            host: host.to_string(),
            timeouts,
        }
    }
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        run_command(&self.handle, &self.host, command, self.timeouts.command).await
    }
    fn classify(&self, path: &str, failure: ScpFailure, local: &Path) -> Error {
        match failure {
            ScpFailure::Local(error) => Error::local_io(local, error),
            ScpFailure::Remote(error) if self.handle.is_closed() => {
                Error::connection(self.host.clone(), error)
            }
            ScpFailure::Remote(error) => Error::transfer(path, error),
        }
    }
    async fn open_stream(
        &self,
        command: &str,
    ) -> Result<impl AsyncRead + AsyncWrite + Unpin + use<>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::connection(self.host.clone(), e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::connection(self.host.clone(), e))?;
        Ok(channel.into_stream())
    }
}

impl TransferChannel for ScpChannel {
    async fn metadata(&self, path: &str) -> Result<Option<RemoteMetadata>> {
        let p = shell_escape(path);
        let command = format!(
            "if [ -e {p} ]; then find -L {p} -maxdepth 0 -printf '%y %s\\n'; fi"
        );
        let output = self.run(&command).await?.check(&command)?;
        Ok(parse_stat(&output))
    }
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let command = format!(
            "find -L {} -mindepth 1 -maxdepth 1 -printf '%y %s %f\\0'",
            shell_escape(path)
        );
        let output = self.run(&command).await?.check(&command)?;
        Ok(parse_listing(&output))
    }
    async fn create_dir_all(&self, path: &str) -> Result<()> {
        let command = format!("mkdir -p {}", shell_escape(path));
        self.run(&command).await?.check(&command)?;
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
        let mut sink = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::local_io(local, e))?;
        let mut stream = self
            .open_stream(&format!("scp -f {}", shell_escape(remote)))
            .await?;
        let copied = receive_file(&mut stream, &mut sink, &self.timeouts, reporter)
            .await
            .map_err(|failure| self.classify(remote, failure, local))?;
        if let Err(error) = stream.shutdown().await {
            tracing::debug!("closing scp stream for {remote}: {error}");
        }
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
        let size = source
            .metadata()
            .await
            .map_err(|e| Error::local_io(local, e))?
            .len();
        let name = crate::remote_basename(remote)
            .ok_or_else(|| Error::transfer(remote, anyhow::anyhow!("no file name")))?;
        let header = FileHeader {
            mode: 0o644,
            size,
            name: name.to_string(),
        };
        let mut stream = self
            .open_stream(&format!("scp -t {}", shell_escape(remote)))
            .await?;
        let copied = send_file(&mut stream, &mut source, &header, &self.timeouts, reporter)
            .await
            .map_err(|failure| self.classify(remote, failure, local))?;
        if let Err(error) = stream.shutdown().await {
            tracing::debug!("closing scp stream for {remote}: {error}");
        }
        Ok(copied)
    }
    async fn remove_file(&self, path: &str) -> Result<()> {
        let command = format!("rm -f {}", shell_escape(path));
        self.run(&command).await?.check(&command)?;
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        // each operation opens and drops its own exec channel
        Ok(())
    }
}
