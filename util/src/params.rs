//! Generic parameters functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::de::DeserializeOwned;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml;

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// An error that occurs during loading of a parameter file.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("The software root directory could not be determined: {0}")]
    SwRootNotFound(std::io::Error),

    #[error("Cannot load the parameter file {0:?}: {1}")]
    FileLoadError(PathBuf, std::io::Error),

    #[error("Cannot read the parameter file {0:?}: {1}")]
    DeserialiseError(PathBuf, toml::de::Error)
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Load a parameter file
///
/// Absolute paths are used as is. Relative paths are first tried relative to
/// the working directory and then relative to the `params` directory under the
/// software root (see `host::get_sw_root`).
pub fn load<P, T>(param_file_path: T) -> Result<P, LoadError> 
where
    P: DeserializeOwned,
    T: AsRef<Path>
{
    let path = resolve(param_file_path.as_ref())?;

    // Load the file into a string
    let params_str = match read_to_string(&path) {
        Ok(s) => s,
        Err(e) => return Err(LoadError::FileLoadError(path, e))
    };

    from_str(&params_str).map_err(|e| LoadError::DeserialiseError(path, e))
}

/// Parse parameters from a TOML string.
pub fn from_str<P>(params_str: &str) -> Result<P, toml::de::Error>
where
    P: DeserializeOwned
{
    toml::from_str(params_str)
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Find the parameter file on disk.
fn resolve(param_file_path: &Path) -> Result<PathBuf, LoadError> {
    if param_file_path.is_absolute() || param_file_path.exists() {
        return Ok(param_file_path.to_path_buf())
    }

    let mut path = crate::host::get_sw_root()
        .map_err(LoadError::SwRootNotFound)?;
    path.push("params");
    path.push(param_file_path);

    Ok(path)
}
