//! Facts about the machine the agent runs on.

use std::path::{Path, PathBuf};

use sysinfo::System;

/// First candidate that exists, checking absolute candidates as given and bare
/// names against `PATH`.
pub fn find_executable(candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if path.is_absolute() && path.is_file() {
            return Some(path.to_path_buf());
        }
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for candidate in candidates {
            let full = dir.join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

/// Number of hardware threads visible to this process.
pub fn host_threads() -> usize {
    let mut system = System::new();
    system.refresh_cpu();
    system.cpus().len()
}
