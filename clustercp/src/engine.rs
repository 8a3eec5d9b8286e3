//! Copies files and folders through a [`Transport`]
//!
//! [`copy_file`] moves one file. [`copy_tree`] copies a folder entry by entry: it resolves the
//! destination root (`<dest_dir>/<source folder name>`) exactly once and hands the resolved pair
//! to `copy_tree_contents`, which recurses without ever re-deriving the root name. Directories
//! are created before anything is placed inside them, and entries matching the exclusion
//! filter are skipped together with everything below them.
//!
//! Every function takes the progress reporter explicitly; each file transfer calls
//! [`ProgressReporter::begin`] and [`ProgressReporter::finish`] exactly once.

use async_recursion::async_recursion;
use common::filter::{FilterResult, FilterSettings};
use common::progress::{FolderProgress, ProgressReporter};
use remote::{Error, Result, TransferChannel, Transport};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// remote to local
    Download,
    /// local to remote
    Upload,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

/// How a whole folder is moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirectoryStrategy {
    /// list, create and copy every entry individually
    #[default]
    EntryWalk,
    /// `tar` the folder remotely, copy one file, unpack locally; downloads only
    Archive,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub filter: FilterSettings,
    pub strategy: DirectoryStrategy,
    /// how often the remote archive size is sampled while `tar` runs
    pub archive_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            filter: FilterSettings::with_default_excludes(),
            strategy: DirectoryStrategy::default(),
            archive_poll_interval: Duration::from_secs(1),
        }
    }
}

/// What to copy, in the terms of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub local_dir: PathBuf,
    pub remote_dir: String,
    /// a file relative to the source directory; `None` copies the whole source directory
    pub file: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub directories_created: usize,
    pub entries_skipped: usize,
    /// wall-clock time spent moving data
    pub elapsed: Duration,
}

impl Summary {
    /// Average bytes per second over [`Summary::elapsed`].
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        (secs > 0.0).then(|| self.bytes_copied as f64 / secs)
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            directories_created: self.directories_created + other.directories_created,
            entries_skipped: self.entries_skipped + other.entries_skipped,
            elapsed: self.elapsed + other.elapsed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            directories created: {}\n\
            entries skipped: {}\n\
            elapsed: {}\n\
            average throughput: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.directories_created,
            self.entries_skipped,
            humantime::format_duration(Duration::from_millis(self.elapsed.as_millis() as u64)),
            self.throughput().map_or_else(
                || "-".to_string(),
                |rate| format!("{}/s", bytesize::ByteSize(rate as u64))
            ),
        )
    }
}

fn invalid_local(path: &Path, message: &str) -> Error {
    Error::local_io(
        path,
        std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string()),
    )
}

/// Copies one file. For downloads the source is `remote_path`, for uploads it is `local`.
///
/// The size is taken from the source before copying and the copy must move exactly that many
/// bytes; anything else is a [`Error::Transfer`]. Parent directories of the destination are
/// created as needed. A failed copy may leave a partial destination file behind.
#[instrument(skip(session, reporter), fields(target = %session.target()))]
pub async fn copy_file<T: Transport>(
    session: &T,
    direction: Direction,
    local: &Path,
    remote_path: &str,
    reporter: &mut dyn ProgressReporter,
) -> Result<u64> {
    copy_file_as(session, direction, local, remote_path, None, reporter).await
}

/// [`copy_file`] reporting under `label` instead of the source path.
pub(crate) async fn copy_file_as<T: Transport>(
    session: &T,
    direction: Direction,
    local: &Path,
    remote_path: &str,
    label: Option<&str>,
    reporter: &mut dyn ProgressReporter,
) -> Result<u64> {
    let channel = session.channel();
    let (source, total) = match direction {
        Direction::Download => {
            let metadata = channel
                .metadata(remote_path)
                .await?
                .ok_or_else(|| Error::transfer(remote_path, anyhow::anyhow!("no such file")))?;
            if metadata.is_dir {
                return Err(Error::transfer(
                    remote_path,
                    anyhow::anyhow!("is a directory, not a file"),
                ));
            }
            (remote_path.to_string(), metadata.size)
        }
        Direction::Upload => {
            let metadata = tokio::fs::metadata(local)
                .await
                .map_err(|error| Error::local_io(local, error))?;
            if metadata.is_dir() {
                return Err(invalid_local(local, "is a directory, not a file"));
            }
            (local.display().to_string(), Some(metadata.len()))
        }
    };
    tracing::debug!(
        "{direction} {source} ({})",
        total.map_or_else(|| "size unknown".to_string(), |t| bytesize::ByteSize(t).to_string())
    );
    reporter.begin(label.unwrap_or(&source), total);
    let copied = match direction {
        Direction::Download => channel.download(remote_path, local, reporter).await,
        Direction::Upload => channel.upload(local, remote_path, reporter).await,
    };
    reporter.finish();
    let copied = copied?;
    if let Some(expected) = total.filter(|&expected| expected != copied) {
        return Err(Error::transfer(
            source,
            anyhow::anyhow!("short copy: moved {copied} of {expected} bytes"),
        ));
    }
    Ok(copied)
}

/// Creates a local directory; returns whether it had to be created.
async fn ensure_local_dir(dir: &Path) -> Result<bool> {
    match tokio::fs::metadata(dir).await {
        Ok(metadata) if metadata.is_dir() => return Ok(false),
        Ok(_) => return Err(invalid_local(dir, "exists and is not a directory")),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(Error::local_io(dir, error)),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|error| Error::local_io(dir, error))?;
    tracing::debug!("created local directory {dir:?}");
    Ok(true)
}

/// Creates a remote directory; returns whether it had to be created.
async fn ensure_remote_dir<C: TransferChannel>(channel: &C, dir: &str) -> Result<bool> {
    match channel.metadata(dir).await? {
        Some(metadata) if metadata.is_dir => Ok(false),
        Some(_) => Err(Error::transfer(
            dir,
            anyhow::anyhow!("exists and is not a directory"),
        )),
        None => {
            channel.create_dir_all(dir).await?;
            Ok(true)
        }
    }
}

/// Copies the folder `remote_path` into `local` (download) or the folder `local` into
/// `remote_path` (upload), entry by entry.
///
/// The copy lands in `<destination>/<name of the source folder>`.
#[instrument(skip(session, settings, reporter), fields(target = %session.target()))]
pub async fn copy_tree<T: Transport>(
    session: &T,
    direction: Direction,
    local: &Path,
    remote_path: &str,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<Summary> {
    let channel = session.channel();
    let mut summary = Summary::default();
    let (local_root, remote_root) = match direction {
        Direction::Download => {
            match channel.metadata(remote_path).await? {
                Some(metadata) if metadata.is_dir => {}
                Some(_) => {
                    return Err(Error::transfer(
                        remote_path,
                        anyhow::anyhow!("not a directory"),
                    ));
                }
                None => {
                    return Err(Error::transfer(
                        remote_path,
                        anyhow::anyhow!("no such directory"),
                    ));
                }
            }
            let local_root = local.join(path::remote_folder_name(remote_path)?);
            if ensure_local_dir(&local_root).await? {
                summary.directories_created += 1;
            }
            (local_root, remote_path.to_string())
        }
        Direction::Upload => {
            let metadata = tokio::fs::metadata(local)
                .await
                .map_err(|error| Error::local_io(local, error))?;
            if !metadata.is_dir() {
                return Err(invalid_local(local, "not a directory"));
            }
            let remote_root =
                remote::join_remote(remote_path, &path::local_folder_name(local).await?);
            if ensure_remote_dir(channel, &remote_root).await? {
                summary.directories_created += 1;
            }
            (local.to_path_buf(), remote_root)
        }
    };
    let size = measure_tree(
        channel,
        direction,
        &local_root,
        &remote_root,
        Path::new(""),
        &settings.filter,
    )
    .await?;
    tracing::info!(
        "{direction} of folder: local {:?}, remote {remote_root}, {} files ({})",
        local_root,
        size.files,
        bytesize::ByteSize(size.bytes)
    );
    let started = Instant::now();
    let mut folder = FolderProgress::new(reporter, size.files, size.bytes);
    let contents = copy_tree_contents(
        session,
        direction,
        &local_root,
        &remote_root,
        Path::new(""),
        settings,
        &mut folder,
    )
    .await?;
    let mut summary = summary + contents;
    summary.elapsed = started.elapsed();
    tracing::info!(
        "{direction} of folder finished: {} files, {} in {}",
        summary.files_copied,
        bytesize::ByteSize(summary.bytes_copied),
        humantime::format_duration(Duration::from_millis(summary.elapsed.as_millis() as u64))
    );
    Ok(summary)
}

struct SourceEntry {
    name: String,
    is_dir: bool,
    size: Option<u64>,
}

async fn list_local(dir: &Path) -> Result<Vec<SourceEntry>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|error| Error::local_io(dir, error))?;
    let mut listing = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|error| Error::local_io(dir, error))?
    {
        let entry_path = entry.path();
        // follows symlinks, like the remote listings do
        let metadata = tokio::fs::metadata(&entry_path)
            .await
            .map_err(|error| Error::local_io(&entry_path, error))?;
        listing.push(SourceEntry {
            name: path::utf8_name(&entry_path, &entry.file_name())?,
            is_dir: metadata.is_dir(),
            size: (!metadata.is_dir()).then(|| metadata.len()),
        });
    }
    listing.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(listing)
}

/// Entries of the source side of a transfer.
async fn list_source<C: TransferChannel>(
    channel: &C,
    direction: Direction,
    local_dir: &Path,
    remote_dir: &str,
) -> Result<Vec<SourceEntry>> {
    match direction {
        Direction::Download => Ok(channel
            .read_dir(remote_dir)
            .await?
            .into_iter()
            .map(|entry| SourceEntry {
                name: entry.name,
                is_dir: entry.metadata.is_dir,
                size: entry.metadata.size,
            })
            .collect()),
        Direction::Upload => list_local(local_dir).await,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TreeSize {
    files: u64,
    bytes: u64,
}

/// Counts what `copy_tree_contents` is going to copy, skipping the same entries.
#[async_recursion(?Send)]
async fn measure_tree<C: TransferChannel>(
    channel: &C,
    direction: Direction,
    local_dir: &Path,
    remote_dir: &str,
    relative: &Path,
    filter: &FilterSettings,
) -> Result<TreeSize> {
    let mut size = TreeSize::default();
    for entry in list_source(channel, direction, local_dir, remote_dir).await? {
        let entry_relative = relative.join(&entry.name);
        if let FilterResult::Excluded(_) = filter.check(&entry_relative, entry.is_dir) {
            continue;
        }
        if entry.is_dir {
            let nested = measure_tree(
                channel,
                direction,
                &local_dir.join(&entry.name),
                &remote::join_remote(remote_dir, &entry.name),
                &entry_relative,
                filter,
            )
            .await?;
            size.files += nested.files;
            size.bytes += nested.bytes;
        } else {
            size.files += 1;
            size.bytes += entry.size.unwrap_or(0);
        }
    }
    Ok(size)
}

/// `local_dir` and `remote_dir` are fully resolved; `relative` is the position below the
/// transfer root, used for filter matching.
#[async_recursion(?Send)]
async fn copy_tree_contents<T: Transport>(
    session: &T,
    direction: Direction,
    local_dir: &Path,
    remote_dir: &str,
    relative: &Path,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<Summary> {
    let channel = session.channel();
    let listing = list_source(channel, direction, local_dir, remote_dir).await?;
    let mut summary = Summary::default();
    for entry in listing {
        let entry_relative = relative.join(&entry.name);
        if let FilterResult::Excluded(pattern) =
            settings.filter.check(&entry_relative, entry.is_dir)
        {
            tracing::info!("skipping {entry_relative:?}: matches exclude pattern '{pattern}'");
            summary.entries_skipped += 1;
            continue;
        }
        let local_child = local_dir.join(&entry.name);
        let remote_child = remote::join_remote(remote_dir, &entry.name);
        if entry.is_dir {
            let created = match direction {
                Direction::Download => ensure_local_dir(&local_child).await?,
                Direction::Upload => ensure_remote_dir(channel, &remote_child).await?,
            };
            if created {
                summary.directories_created += 1;
            }
            summary = summary
                + copy_tree_contents(
                    session,
                    direction,
                    &local_child,
                    &remote_child,
                    &entry_relative,
                    settings,
                    reporter,
                )
                .await?;
        } else {
            let bytes = copy_file(session, direction, &local_child, &remote_child, reporter).await?;
            summary.bytes_copied += bytes;
            summary.files_copied += 1;
        }
    }
    Ok(summary)
}

/// Carries out one command-line request: a named file when `request.file` is set, the whole
/// source directory otherwise.
#[instrument(skip(session, settings, reporter), fields(target = %session.target()))]
pub async fn transfer<T: Transport>(
    session: &T,
    direction: Direction,
    request: &TransferRequest,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<Summary> {
    if let Some(file) = &request.file {
        let local = path::local_file_path(&request.local_dir, file);
        let remote_path = path::remote_file_path(&request.remote_dir, file);
        tracing::info!("{direction} of file: local {local:?}, remote {remote_path}");
        let started = Instant::now();
        let bytes_copied = copy_file(session, direction, &local, &remote_path, reporter).await?;
        return Ok(Summary {
            bytes_copied,
            files_copied: 1,
            elapsed: started.elapsed(),
            ..Default::default()
        });
    }
    match (direction, settings.strategy) {
        (Direction::Download, DirectoryStrategy::Archive) => {
            crate::archive::download_tree(
                session,
                &request.remote_dir,
                &request.local_dir,
                settings,
                reporter,
            )
            .await
        }
        (Direction::Upload, DirectoryStrategy::Archive) => {
            tracing::warn!("archive mode only applies to downloads, copying entry by entry");
            copy_tree(
                session,
                direction,
                &request.local_dir,
                &request.remote_dir,
                settings,
                reporter,
            )
            .await
        }
        (_, DirectoryStrategy::EntryWalk) => {
            copy_tree(
                session,
                direction,
                &request.local_dir,
                &request.remote_dir,
                settings,
                reporter,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use common::progress::NoProgress;
    use remote::loopback::LoopbackConnector;
    use remote::{Connector, Target};
    use tracing_test::traced_test;

    async fn session() -> anyhow::Result<remote::loopback::LoopbackSession> {
        Ok(LoopbackConnector::new()
            .connect(&Target::new("alice", "localhost"))
            .await?)
    }

    #[tokio::test]
    #[traced_test]
    async fn download_mirrors_tree_and_skips_appledouble_files() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        let local = tmp.path().join("local");
        let session = session().await?;
        let summary = copy_tree(
            &session,
            Direction::Download,
            &local,
            &remote_root.to_string_lossy(),
            &Settings::default(),
            &mut NoProgress,
        )
        .await?;
        let copied = local.join("data");
        assert_eq!(
            testutils::snapshot(&copied).await?,
            testutils::expected_snapshot()
        );
        assert!(copied.join("plainfile.txt").exists());
        assert!(!copied.join("._tempfile").exists());
        assert_eq!(
            summary,
            Summary {
                bytes_copied: 10 + 20 + 14 + 11,
                files_copied: 5,
                directories_created: 3,
                entries_skipped: 2,
                elapsed: summary.elapsed,
            }
        );
        assert!(logs_contain("matches exclude pattern '._*'"));
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn upload_mirrors_tree_under_source_name() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let local_root = testutils::setup_source_tree(&tmp.path().join("local")).await?;
        let remote_dir = tmp.path().join("cluster").join("incoming");
        let session = session().await?;
        let summary = copy_tree(
            &session,
            Direction::Upload,
            &local_root,
            &remote_dir.to_string_lossy(),
            &Settings::default(),
            &mut NoProgress,
        )
        .await?;
        assert_eq!(
            testutils::snapshot(&remote_dir.join("data")).await?,
            testutils::expected_snapshot()
        );
        assert_eq!(summary.files_copied, 5);
        assert_eq!(summary.entries_skipped, 2);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn transferring_twice_gives_identical_tree() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        let request = TransferRequest {
            local_dir: tmp.path().join("local"),
            remote_dir: remote_root.to_string_lossy().into_owned(),
            file: None,
        };
        let session = session().await?;
        let settings = Settings::default();
        let first = transfer(
            &session,
            Direction::Download,
            &request,
            &settings,
            &mut NoProgress,
        )
        .await?;
        let before = testutils::snapshot(&request.local_dir).await?;
        let second = transfer(
            &session,
            Direction::Download,
            &request,
            &settings,
            &mut NoProgress,
        )
        .await?;
        assert_eq!(testutils::snapshot(&request.local_dir).await?, before);
        assert_eq!(first.bytes_copied, second.bytes_copied);
        assert_eq!(second.directories_created, 0);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn default_excludes_can_be_disabled_and_extended() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        let local = tmp.path().join("local");
        let settings = Settings {
            filter: FilterSettings::from_args(&["nested/"], false)?,
            ..Default::default()
        };
        let session = session().await?;
        let summary = copy_tree(
            &session,
            Direction::Download,
            &local,
            &remote_root.to_string_lossy(),
            &settings,
            &mut NoProgress,
        )
        .await?;
        assert!(local.join("data/._tempfile").exists());
        assert!(!local.join("data/nested").exists());
        assert_eq!(summary.entries_skipped, 1);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn named_file_download_creates_parents() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        let request = TransferRequest {
            local_dir: tmp.path().join("local").join("fresh"),
            remote_dir: remote_root.to_string_lossy().into_owned(),
            file: Some("nested/deeper/d.txt".to_string()),
        };
        let session = session().await?;
        let summary = transfer(
            &session,
            Direction::Download,
            &request,
            &Settings::default(),
            &mut NoProgress,
        )
        .await?;
        assert_eq!(
            tokio::fs::read_to_string(request.local_dir.join("nested/deeper/d.txt")).await?,
            "deep inside"
        );
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.bytes_copied, 11);
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn progress_is_monotonic_and_ends_at_file_size() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        // spans several chunks
        let big = vec![b'x'; 100 * 1024 + 7];
        tokio::fs::write(remote_root.join("big.bin"), &big).await?;
        let session = session().await?;
        let mut reporter = testutils::RecordingReporter::default();
        copy_tree(
            &session,
            Direction::Download,
            &tmp.path().join("local"),
            &remote_root.to_string_lossy(),
            &Settings::default(),
            &mut reporter,
        )
        .await?;
        assert_eq!(reporter.transfers.len(), 6);
        for transfer in &reporter.transfers {
            assert!(transfer.finished, "{} never finished", transfer.label);
            assert!(
                transfer.updates.windows(2).all(|w| w[0] <= w[1]),
                "{}: {:?}",
                transfer.label,
                transfer.updates
            );
            assert_eq!(transfer.updates.last().copied(), transfer.total);
        }
        let empty = reporter
            .transfers
            .iter()
            .find(|t| t.label.ends_with("empty.bin"))
            .expect("empty file was transferred");
        assert_eq!(empty.total, Some(0));
        assert_eq!(empty.updates, vec![0]);
        let big_transfer = reporter
            .transfers
            .iter()
            .find(|t| t.label.ends_with("big.bin"))
            .expect("big file was transferred");
        assert!(big_transfer.updates.len() > 3);
        assert_eq!(big_transfer.total, Some(big.len() as u64));
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn missing_source_is_a_transfer_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let session = session().await?;
        let missing = tmp.path().join("nope");
        let error = copy_tree(
            &session,
            Direction::Download,
            &tmp.path().join("local"),
            &missing.to_string_lossy(),
            &Settings::default(),
            &mut NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::Transfer { .. }), "{error:?}");
        assert!(!tmp.path().join("local").exists());
        let error = copy_file(
            &session,
            Direction::Upload,
            &missing,
            &tmp.path().join("dest").to_string_lossy(),
            &mut NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::LocalIo { .. }), "{error:?}");
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn dropped_connection_fails_fast() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let remote_root = testutils::setup_source_tree(&tmp.path().join("cluster")).await?;
        let session = session().await?;
        session.force_dead();
        let error = copy_tree(
            &session,
            Direction::Download,
            &tmp.path().join("local"),
            &remote_root.to_string_lossy(),
            &Settings::default(),
            &mut NoProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(error, Error::Connection { .. }), "{error:?}");
        Ok(())
    }
    #[tokio::test]
    #[traced_test]
    async fn folder_progress_counts_against_measured_totals() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let local_root = testutils::setup_source_tree(&tmp.path().join("local")).await?;
        let session = session().await?;
        let mut reporter = testutils::RecordingReporter::default();
        let summary = copy_tree(
            &session,
            Direction::Upload,
            &local_root,
            &tmp.path().join("cluster").to_string_lossy(),
            &Settings::default(),
            &mut reporter,
        )
        .await?;
        // excluded files are not part of the totals
        assert_eq!(reporter.transfers.len(), 5);
        assert!(
            reporter.transfers[0].label.starts_with("[1/5 files, 0% overall"),
            "{}",
            reporter.transfers[0].label
        );
        assert!(
            reporter.transfers[4].label.starts_with("[5/5 files, "),
            "{}",
            reporter.transfers[4].label
        );
        assert!(logs_contain("5 files (55"));
        assert!(summary.elapsed > Duration::ZERO);
        assert!(summary.throughput().is_some());
        Ok(())
    }
    #[test]
    fn summary_adds_and_renders() {
        let a = Summary {
            bytes_copied: 1024,
            files_copied: 1,
            directories_created: 1,
            entries_skipped: 0,
            elapsed: Duration::from_secs(1),
        };
        let b = Summary {
            bytes_copied: 1024,
            files_copied: 2,
            directories_created: 0,
            entries_skipped: 3,
            elapsed: Duration::from_secs(1),
        };
        let total = a + b;
        assert_eq!(total.files_copied, 3);
        assert_eq!(total.entries_skipped, 3);
        assert_eq!(total.elapsed, Duration::from_secs(2));
        assert_eq!(total.throughput(), Some(1024.0));
        let rendered = total.to_string();
        assert!(rendered.contains("files copied: 3"), "{rendered}");
        assert!(rendered.contains("entries skipped: 3"), "{rendered}");
        assert!(rendered.contains("elapsed: 2s"), "{rendered}");
        assert!(rendered.contains("average throughput: 1"), "{rendered}");
        assert!(rendered.ends_with("/s"), "{rendered}");
        let idle = Summary::default().to_string();
        assert!(idle.contains("average throughput: -"), "{idle}");
    }
}
