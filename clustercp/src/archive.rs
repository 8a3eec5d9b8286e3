//! Archive-mediated folder download
//!
//! Many small files cost one round trip each when copied entry by entry. Instead, the remote
//! side packs the folder with `tar czf` into a `mktemp` file, that single file is downloaded
//! into a temporary directory next to the destination, and it is unpacked locally with the
//! `tar` and `flate2` crates. The remote archive is removed afterwards (best effort) and the
//! local temporary directory is removed on every exit path.
//!
//! While `tar` runs, the growing archive is sampled every
//! [`Settings::archive_poll_interval`] and reported as indeterminate progress.

use common::filter::{FilterResult, FilterSettings};
use common::progress::ProgressReporter;
use remote::{Error, Result, TransferChannel, Transport, shell_escape};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::instrument;

use crate::engine::{self, Direction, Settings, Summary};
use crate::path;

const REMOTE_TEMPLATE: &str = "\"${TMPDIR:-/tmp}/clustercp.XXXXXXXX\"";

fn local_io_other(path: &Path, error: impl std::fmt::Display) -> Error {
    Error::local_io(path, std::io::Error::other(error.to_string()))
}

/// Downloads the folder `remote_root` into `local_parent/<folder name>` through a single archive.
#[instrument(skip(session, settings, reporter), fields(target = %session.target()))]
pub async fn download_tree<T: Transport>(
    session: &T,
    remote_root: &str,
    local_parent: &Path,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<Summary> {
    let name = path::remote_folder_name(remote_root)?;
    let remote_parent = remote::remote_parent(remote_root).unwrap_or(".");
    let mktemp = format!("mktemp {REMOTE_TEMPLATE}");
    let remote_archive = session.exec(&mktemp).await?.check(&mktemp)?.stdout_text();
    let remote_archive = remote_archive.trim().to_string();
    if remote_archive.is_empty() {
        return Err(Error::RemoteCommand {
            command: mktemp,
            exit_status: 0,
            stderr: "no temporary file name returned".to_string(),
        });
    }
    tracing::debug!("remote archive {remote_archive}");
    let started = Instant::now();
    let result = fetch_and_unpack(
        session,
        &remote_archive,
        remote_parent,
        &name,
        local_parent,
        settings,
        reporter,
    )
    .await;
    if let Err(error) = session.channel().remove_file(&remote_archive).await {
        tracing::warn!(
            "failed to remove remote archive {remote_archive}: {:#}",
            anyhow::Error::from(error)
        );
    }
    result.map(|summary| Summary {
        elapsed: started.elapsed(),
        ..summary
    })
}

async fn fetch_and_unpack<T: Transport>(
    session: &T,
    remote_archive: &str,
    remote_parent: &str,
    name: &str,
    local_parent: &Path,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<Summary> {
    tokio::fs::create_dir_all(local_parent)
        .await
        .map_err(|error| Error::local_io(local_parent, error))?;
    // dropped on every exit path, taking the local archive with it
    let staging = tempfile::Builder::new()
        .prefix(".clustercp-")
        .tempdir_in(local_parent)
        .map_err(|error| Error::local_io(local_parent, error))?;
    let command = format!(
        "tar czf {} -C {} {}",
        shell_escape(remote_archive),
        shell_escape(remote_parent),
        shell_escape(name)
    );
    run_archiver(session, &command, remote_archive, name, settings, reporter).await?;
    let archive_name = format!("{name}.tgz");
    let local_archive = staging.path().join(&archive_name);
    let archive_bytes = engine::copy_file_as(
        session,
        Direction::Download,
        &local_archive,
        remote_archive,
        Some(&archive_name),
        reporter,
    )
    .await?;
    tracing::info!(
        "downloaded archive of {name} ({}), unpacking into {local_parent:?}",
        bytesize::ByteSize(archive_bytes)
    );
    let summary = {
        let archive = local_archive.clone();
        let dest = local_parent.to_path_buf();
        let root = name.to_string();
        let filter = settings.filter.clone();
        tokio::task::spawn_blocking(move || unpack(&archive, &dest, &root, &filter))
            .await
            .map_err(|error| local_io_other(&local_archive, error))??
    };
    if let Err(error) = staging.close() {
        tracing::warn!("failed to remove staging directory: {error}");
    }
    Ok(summary)
}

/// Runs `command` to completion, sampling the size of `remote_archive` while it runs.
async fn run_archiver<T: Transport>(
    session: &T,
    command: &str,
    remote_archive: &str,
    name: &str,
    settings: &Settings,
    reporter: &mut dyn ProgressReporter,
) -> Result<()> {
    reporter.begin(&format!("archiving {name}"), None);
    let archiver = session.exec(command);
    tokio::pin!(archiver);
    let mut ticker = tokio::time::interval(settings.archive_poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let output = loop {
        tokio::select! {
            output = &mut archiver => break output,
            _ = ticker.tick() => {
                match session.channel().metadata(remote_archive).await {
                    Ok(Some(metadata)) => reporter.update(metadata.size.unwrap_or(0)),
                    Ok(None) => {}
                    Err(error) => tracing::debug!(
                        "sampling archive size failed: {:#}",
                        anyhow::Error::from(error)
                    ),
                }
            }
        }
    };
    reporter.finish();
    output?.check(command)?;
    Ok(())
}

/// Unpacks `archive` below `dest`, skipping filtered entries the way the entry walk does.
fn unpack(archive: &Path, dest: &Path, root: &str, filter: &FilterSettings) -> Result<Summary> {
    let file = std::fs::File::open(archive).map_err(|error| Error::local_io(archive, error))?;
    let decoder = flate2::read::GzDecoder::new(std::io::BufReader::new(file));
    let mut tarball = tar::Archive::new(decoder);
    let mut summary = Summary::default();
    let mut skipped_dirs: Vec<PathBuf> = Vec::new();
    let entries = tarball
        .entries()
        .map_err(|error| Error::local_io(archive, error))?;
    for entry in entries {
        let mut entry = entry.map_err(|error| Error::local_io(archive, error))?;
        let entry_path = entry
            .path()
            .map_err(|error| Error::local_io(archive, error))?
            .into_owned();
        let entry_type = entry.header().entry_type();
        if entry_type.is_block_special()
            || entry_type.is_character_special()
            || entry_type.is_fifo()
        {
            tracing::debug!("skipping special file {entry_path:?}");
            continue;
        }
        let Ok(relative) = entry_path.strip_prefix(root) else {
            return Err(Error::transfer(
                entry_path.to_string_lossy(),
                anyhow::anyhow!("archive entry lies outside of {root}"),
            ));
        };
        let relative = relative.to_path_buf();
        if skipped_dirs.iter().any(|dir| relative.starts_with(dir)) {
            continue;
        }
        if !relative.as_os_str().is_empty() {
            if let FilterResult::Excluded(pattern) = filter.check(&relative, entry_type.is_dir()) {
                tracing::info!("skipping {relative:?}: matches exclude pattern '{pattern}'");
                summary.entries_skipped += 1;
                if entry_type.is_dir() {
                    skipped_dirs.push(relative);
                }
                continue;
            }
        }
        let target = dest.join(&entry_path);
        let existed = target.symlink_metadata().is_ok();
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|error| Error::local_io(&target, error))?;
        if !unpacked {
            tracing::warn!("refusing to unpack {entry_path:?} outside of {dest:?}");
            continue;
        }
        if entry_type.is_dir() {
            if !existed {
                summary.directories_created += 1;
            }
        } else if entry_type.is_file() {
            summary.files_copied += 1;
            summary.bytes_copied += entry.size();
        }
    }
    Ok(summary)
}
