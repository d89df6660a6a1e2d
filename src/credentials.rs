//! API key resolution for the upstream completion endpoint
//!
//! The key comes from `HYPERBOLIC_API_KEY` when set and non-empty, and
//! otherwise from the trimmed contents of a local key file. Failure to find
//! either is fatal at startup.

use crate::error::{Result, RelayError};
use std::path::Path;

/// Environment variable consulted first
pub const API_KEY_ENV: &str = "HYPERBOLIC_API_KEY";

/// Resolve the upstream bearer credential
///
/// # Arguments
///
/// * `fallback_file` - File read when the environment variable is unset or empty
///
/// # Errors
///
/// Returns `RelayError::MissingCredentials` if neither source yields a value
///
/// # Examples
///
/// ```no_run
/// use chatrelay::credentials::load_api_key;
///
/// let key = load_api_key(".hyperbolic_api_key").unwrap();
/// assert!(!key.is_empty());
/// ```
pub fn load_api_key(fallback_file: impl AsRef<Path>) -> Result<String> {
    if let Ok(value) = std::env::var(API_KEY_ENV) {
        let value = value.trim();
        if !value.is_empty() {
            tracing::info!("Using upstream API key from {}", API_KEY_ENV);
            return Ok(value.to_string());
        }
    }

    let path = fallback_file.as_ref();
    if path.is_file() {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let token = contents.trim();
                if !token.is_empty() {
                    tracing::info!("Loaded upstream API key from {}", path.display());
                    return Ok(token.to_string());
                }
            }
            Err(e) => tracing::warn!("Could not read {}: {}", path.display(), e),
        }
    }

    Err(RelayError::MissingCredentials(format!(
        "set the {} environment variable or create {}",
        API_KEY_ENV,
        path.display()
    ))
    .into())
}
