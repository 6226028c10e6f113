//! Endpoint naming.
//!
//! A function named `f` is served at `<namespace>/lipcm-f.sock`. The mapping
//! is pure and reversible so discovery can recover names from a directory
//! listing.

use crate::config::ProtocolConfig;
use crate::{LipError, Result};
use std::path::{Path, PathBuf};

/// Check that `name` can be embedded in an endpoint file name.
///
/// Allowed: ASCII alphanumerics, `_`, `-` and `.`. Anything else (path
/// separators in particular) would break the one-name-one-path mapping.
pub fn validate_function_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(LipError::Validation {
            field: "function_name".to_string(),
            message: "Function name must not be empty".to_string(),
        });
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(LipError::Validation {
            field: "function_name".to_string(),
            message: format!("Invalid character {:?} in function name '{}'", c, name),
        });
    }

    Ok(())
}

/// File name of the endpoint for `name`, without the directory.
pub fn endpoint_file_name(name: &str) -> String {
    format!(
        "{}-{}.{}",
        ProtocolConfig::ENDPOINT_PREFIX,
        name,
        ProtocolConfig::ENDPOINT_SUFFIX
    )
}

/// Endpoint path for `name` inside `namespace_dir`.
///
/// Fails if the name is not valid or the resulting path would not fit in a
/// Unix socket address.
pub fn endpoint_for(namespace_dir: &Path, name: &str) -> Result<PathBuf> {
    validate_function_name(name)?;

    let path = namespace_dir.join(endpoint_file_name(name));
    let len = path.as_os_str().len();
    if len >= ProtocolConfig::MAX_SOCKET_PATH_LEN {
        return Err(LipError::Validation {
            field: "endpoint_path".to_string(),
            message: format!(
                "Endpoint path {} is {} bytes, limit is {}",
                path.display(),
                len,
                ProtocolConfig::MAX_SOCKET_PATH_LEN - 1
            ),
        });
    }

    Ok(path)
}

/// Recover the function name from an endpoint path.
///
/// Returns `None` for anything not following the naming convention.
pub fn function_name_from_path(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = file_name
        .strip_prefix(ProtocolConfig::ENDPOINT_PREFIX)?
        .strip_prefix('-')?
        .strip_suffix(ProtocolConfig::ENDPOINT_SUFFIX)?
        .strip_suffix('.')?;

    validate_function_name(name).ok()?;
    Some(name.to_string())
}
