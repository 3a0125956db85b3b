//! Backend binary provisioning seam
//!
//! Locating or installing the terminal backend executable is an external
//! concern; the core only needs a resolved path. Resolution failure is fatal
//! at startup.

use crate::error::Error;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name looked up on PATH when no explicit binary path is configured
const DEFAULT_BINARY_NAME: &str = "ttyd";

/// Resolve the terminal backend executable.
///
/// An explicitly configured path must exist and be a file. Otherwise the
/// default binary name is searched on PATH.
pub fn resolve_executable(configured: Option<&str>) -> Result<PathBuf, Error> {
    if let Some(path) = configured {
        let path = PathBuf::from(path);
        if !path.is_file() {
            return Err(Error::Provisioning(format!(
                "configured backend binary does not exist: {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "Using configured backend binary");
        return Ok(path);
    }

    search_path(DEFAULT_BINARY_NAME).ok_or_else(|| {
        Error::Provisioning(format!(
            "{} not found on PATH; install it or set server.backend_binary",
            DEFAULT_BINARY_NAME
        ))
    })
}

/// Walk PATH entries looking for an executable with the given name
fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            debug!(path = %candidate.display(), "Found backend binary on PATH");
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_path_must_exist() {
        let err = resolve_executable(Some("/nonexistent/ttyd")).unwrap_err();
        assert!(matches!(err, Error::Provisioning(_)));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_configured_path_accepted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolved = resolve_executable(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(resolved, file.path());
    }

    #[test]
    fn test_path_search_finds_common_tools() {
        // `sh` is present on any Unix test host
        #[cfg(unix)]
        assert!(search_path("sh").is_some());
        assert!(search_path("definitely-not-a-real-binary-name").is_none());
    }
}
