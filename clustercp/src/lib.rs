//! Transfer engine behind `cluster2local` and `local2cluster`
//!
//! The engine copies single files or whole folders between the local filesystem and a remote
//! host, through any [`remote::Transport`]. Folders are copied either entry by entry
//! ([`engine::copy_tree`]) or, for downloads, by archiving them on the remote side first
//! ([`archive::download_tree`]).
//!
//! # Layout
//!
//! A request names a local directory, a remote directory and optionally a file inside the
//! source directory:
//!
//! - with a file name, `<source_dir>/<file>` is copied to `<dest_dir>/<file>`
//! - without one, the source directory itself is copied into the destination directory, so
//!   `cluster2local -l ~/results -c /scratch/run-7` produces `~/results/run-7`
//!
//! Missing destination directories are created. Nothing at the source is ever modified.

pub mod archive;
pub mod cli;
pub mod engine;
pub mod path;

#[cfg(test)]
mod testutils;

pub use engine::{DirectoryStrategy, Direction, Settings, Summary, TransferRequest};
