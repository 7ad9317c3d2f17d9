//! Side-effecting adapters: filesystem, git, child processes and templates.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod lockfile;
pub mod process;
pub mod prompt;
pub mod session_log;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Sibling of `path` to write before renaming or linking into place.
///
/// Unique per call, so concurrent writers in one process never share it.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        hex::encode(rand::random::<[u8; 6]>())
    ));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_siblings_are_unique_and_not_json() {
        let path = Path::new("/logs/locks/srv-app.json");
        let a = temp_sibling(path);
        let b = temp_sibling(path);
        assert_ne!(a, b);
        assert_eq!(a.parent(), path.parent());
        assert!(a.extension().is_some_and(|ext| ext != "json"));
    }
}
