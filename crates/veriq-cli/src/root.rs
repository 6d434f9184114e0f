use std::path::{Path, PathBuf};

use veriq_core::paths::VERIQ_DIR;

/// Resolve the data root.
///
/// Priority:
/// 1. `--root` flag / `VERIQ_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `.veriq/`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(VERIQ_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_data_dir_from_nested_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(VERIQ_DIR)).unwrap();
        let nested = dir.path().join("jobs/2026/june");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_upward(&nested).as_deref(), Some(dir.path()));
    }

    #[test]
    fn no_data_dir_found() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let found = find_upward(&nested);
        assert!(found.map_or(true, |p| !p.starts_with(dir.path())));
    }
}
