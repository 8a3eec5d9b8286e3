//! Naming rules shared by the transfer strategies

use remote::{Error, Result};
use std::path::{Component, Path};

/// Name a copied folder gets at the destination: the last component of `path`.
///
/// `.` and `..` are resolved against the filesystem first, so `local2cluster -l .` uploads the
/// current directory under its real name.
pub async fn local_folder_name(path: &Path) -> Result<String> {
    let resolved = match path.components().next_back() {
        Some(Component::Normal(_)) => path.to_path_buf(),
        _ => tokio::fs::canonicalize(path)
            .await
            .map_err(|error| Error::local_io(path, error))?,
    };
    let name = resolved.file_name().ok_or_else(|| {
        Error::local_io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "cannot derive a folder name from this path",
            ),
        )
    })?;
    utf8_name(path, name)
}

/// Remote counterpart of [`local_folder_name`]; no filesystem lookups are made.
pub fn remote_folder_name(path: &str) -> Result<String> {
    remote::remote_basename(path)
        .map(str::to_string)
        .ok_or_else(|| {
            Error::transfer(
                path,
                anyhow::anyhow!("cannot derive a folder name from this path"),
            )
        })
}

/// Remote paths are strings; local names that are not UTF-8 cannot be represented there.
pub fn utf8_name(path: &Path, name: &std::ffi::OsStr) -> Result<String> {
    name.to_str().map(str::to_string).ok_or_else(|| {
        Error::local_io(
            path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{name:?} is not valid UTF-8"),
            ),
        )
    })
}

/// Joins a relative, `/`-separated file name (as given with `--file`) onto a remote directory.
pub fn remote_file_path(dir: &str, file: &str) -> String {
    remote::join_remote(dir, file.trim_start_matches('/'))
}

/// Joins a relative file name onto a local directory, dropping any leading `/` so the result
/// stays inside `dir`.
pub fn local_file_path(dir: &Path, file: &str) -> std::path::PathBuf {
    dir.join(file.trim_start_matches('/'))
}
