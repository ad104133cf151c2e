//! Host platform utility functions

use std::env;
use std::path::PathBuf;

/// Environment variable which points at the root of the software directory.
///
/// The `params` and `sessions` directories are resolved relative to this root.
pub const SW_ROOT_ENV_VAR: &str = "DF_SW_ROOT";

/// Get the software root directory.
///
/// Falls back to the current working directory if `DF_SW_ROOT` is not set.
pub fn get_sw_root() -> std::io::Result<PathBuf> {
    match env::var_os(SW_ROOT_ENV_VAR) {
        Some(root) => Ok(PathBuf::from(root)),
        None => env::current_dir()
    }
}

/// Get the name of the host machine, if it can be determined.
pub fn get_hostname() -> Option<String> {
    env::var("HOSTNAME").ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname")
            .ok()
            .map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
}
