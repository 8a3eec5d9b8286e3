use common::progress::ProgressReporter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Creates the standard source tree under `parent` and returns its root, `parent/data`.
pub async fn setup_source_tree(parent: &Path) -> anyhow::Result<PathBuf> {
    // data
    // |- a.txt          (10 bytes)
    // |- b.txt          (20 bytes)
    // |- ._tempfile     (excluded by default)
    // |- plainfile.txt  (14 bytes)
    // |- empty.bin      (0 bytes)
    // |- nested
    //    |- ._c.txt     (excluded by default)
    //    |- deeper
    //       |- d.txt    (11 bytes)
    let root = parent.join("data");
    let deeper = root.join("nested").join("deeper");
    tokio::fs::create_dir_all(&deeper).await?;
    tokio::fs::write(root.join("a.txt"), "0123456789").await?;
    tokio::fs::write(root.join("b.txt"), "abcdefghijklmnopqrst").await?;
    tokio::fs::write(root.join("._tempfile"), "resource fork").await?;
    tokio::fs::write(root.join("plainfile.txt"), "plain contents").await?;
    tokio::fs::write(root.join("empty.bin"), "").await?;
    tokio::fs::write(root.join("nested").join("._c.txt"), "resource fork").await?;
    tokio::fs::write(deeper.join("d.txt"), "deep inside").await?;
    Ok(root)
}

/// Relative path of every entry below `root`, with file contents (`None` for directories).
pub async fn snapshot(root: &Path) -> anyhow::Result<BTreeMap<String, Option<Vec<u8>>>> {
    let mut result = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let relative = path.strip_prefix(root)?.to_string_lossy().into_owned();
            if entry.file_type().await?.is_dir() {
                result.insert(relative, None);
                pending.push(path);
            } else {
                result.insert(relative, Some(tokio::fs::read(&path).await?));
            }
        }
    }
    Ok(result)
}

/// What [`setup_source_tree`] looks like after a copy with the default excludes.
pub fn expected_snapshot() -> BTreeMap<String, Option<Vec<u8>>> {
    BTreeMap::from([
        ("a.txt".to_string(), Some(b"0123456789".to_vec())),
        ("b.txt".to_string(), Some(b"abcdefghijklmnopqrst".to_vec())),
        ("empty.bin".to_string(), Some(Vec::new())),
        ("nested".to_string(), None),
        ("nested/deeper".to_string(), None),
        ("nested/deeper/d.txt".to_string(), Some(b"deep inside".to_vec())),
        ("plainfile.txt".to_string(), Some(b"plain contents".to_vec())),
    ])
}

#[derive(Debug, Default)]
pub struct RecordedTransfer {
    pub label: String,
    pub total: Option<u64>,
    pub updates: Vec<u64>,
    pub finished: bool,
}

/// Keeps every raw notification, one entry per `begin`.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub transfers: Vec<RecordedTransfer>,
}

impl ProgressReporter for RecordingReporter {
    fn begin(&mut self, label: &str, total: Option<u64>) {
        self.transfers.push(RecordedTransfer {
            label: label.to_string(),
            total,
            ..Default::default()
        });
    }
    fn update(&mut self, bytes_so_far: u64) {
        if let Some(current) = self.transfers.last_mut() {
            current.updates.push(bytes_so_far);
        }
    }
    fn finish(&mut self) {
        if let Some(current) = self.transfers.last_mut() {
            current.finished = true;
        }
    }
}
