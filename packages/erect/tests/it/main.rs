use erect::path::AbsDirPath;
use tempfile::TempDir;

pub mod modules;
pub mod task_graph;

/// A fresh temporary directory, already read back as an absolute path.
#[track_caller]
pub fn temporary_directory() -> (TempDir, AbsDirPath) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = AbsDirPath::try_from(dir.path()).expect("read temp dir as abs dir");
    (dir, path)
}
