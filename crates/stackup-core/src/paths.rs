use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// File and directory constants
// ---------------------------------------------------------------------------

pub const CONFIG_FILE: &str = "stackup.yaml";
pub const DEFAULT_INFRA_DIR: &str = "infra";

/// Where tool installers drop their binaries.
pub const INSTALL_DIR: &str = "/usr/local/bin";

/// Scratch space for downloaded install artifacts.
pub const DOWNLOAD_DIR: &str = "/tmp/stackup-downloads";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve the infrastructure directory; relative values are taken from `root`.
pub fn infra_dir(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

pub fn install_target(tool: &str) -> PathBuf {
    Path::new(INSTALL_DIR).join(tool)
}

pub fn download_path(file_name: &str) -> PathBuf {
    Path::new(DOWNLOAD_DIR).join(file_name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
