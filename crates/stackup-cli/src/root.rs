use stackup_core::paths::CONFIG_FILE;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// Priority:
/// 1. `--root` flag / `STACKUP_ROOT` env var (passed in as `explicit`)
/// 2. Walk upward from `cwd` looking for `stackup.yaml`
/// 3. Fall back to `cwd`
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_config_dir(&cwd).unwrap_or(cwd)
}

fn find_config_dir(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
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
    fn finds_config_in_an_ancestor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "").unwrap();
        let deep = dir.path().join("infra/modules");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_config_dir(&deep).as_deref(), Some(dir.path()));
    }

    #[test]
    fn no_config_anywhere_yields_none() {
        let dir = TempDir::new().unwrap();
        let deep = dir.path().join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        // An ancestor of the temp dir could carry a stackup.yaml, so only
        // assert the search does not stop inside the temp tree.
        if let Some(found) = find_config_dir(&deep) {
            assert!(!found.starts_with(dir.path()));
        }
    }
}
