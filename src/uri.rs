//! Path/URI conversion
//!
//! Absolute host paths convert to `file://` URIs with percent-encoded
//! segments (Windows drive letters land after the authority as `/C:/...`).
//! Launchers whose server sees a different filesystem than the host
//! install a [`PathTranslator`] that rewrites every outbound and inbound
//! URI, so callers only ever deal in host paths.

use std::path::{Path, PathBuf};
use url::Url;

/// Error types for path/URI conversion
#[derive(Debug, thiserror::Error)]
pub enum UriError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(PathBuf),

    #[error("path cannot be represented as a file URI: {0}")]
    UnrepresentablePath(PathBuf),

    #[error("URI does not refer to a local file: {0}")]
    NotLocal(Url),
}

/// Convert an absolute host path into a `file://` URI
pub fn path_to_uri(path: &Path) -> Result<Url, UriError> {
    if !path.is_absolute() {
        return Err(UriError::NotAbsolute(path.to_path_buf()));
    }

    Url::from_file_path(path).map_err(|_| UriError::UnrepresentablePath(path.to_path_buf()))
}

/// Convert a `file://` URI back into a host path
pub fn uri_to_path(uri: &Url) -> Result<PathBuf, UriError> {
    if uri.scheme() != "file" {
        return Err(UriError::NotLocal(uri.clone()));
    }

    uri.to_file_path().map_err(|_| UriError::NotLocal(uri.clone()))
}

/// Translation hooks between host paths and the URIs a server sees.
///
/// The default implementation is the identity mapping over `file://`
/// URIs. Container launchers override both directions when the server's
/// filesystem view differs from the host's.
pub trait PathTranslator: Send + Sync {
    /// Translate a host path to the URI the server should receive
    fn to_server_uri(&self, path: &Path) -> Result<Url, UriError> {
        path_to_uri(path)
    }

    /// Translate a server-reported URI back to a host path
    fn to_host_path(&self, uri: &Url) -> Result<PathBuf, UriError> {
        uri_to_path(uri)
    }
}

/// Identity translation for servers sharing the host filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectTranslator;

impl PathTranslator for DirectTranslator {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_plain_path() {
        let path = Path::new("/abs/dir/a.py");
        let uri = path_to_uri(path).unwrap();
        assert_eq!(uri.as_str(), "file:///abs/dir/a.py");
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_round_trip_percent_encoding() {
        let path = Path::new("/work space/söurce.rs");
        let uri = path_to_uri(path).unwrap();
        assert!(uri.as_str().contains("work%20space"));
        assert_eq!(uri_to_path(&uri).unwrap(), path);
    }

    #[test]
    fn test_relative_path_rejected() {
        let result = path_to_uri(Path::new("relative/a.py"));
        assert!(matches!(result, Err(UriError::NotAbsolute(_))));
    }

    #[test]
    fn test_non_file_scheme_rejected() {
        let uri = Url::parse("https://example.com/a.py").unwrap();
        assert!(matches!(uri_to_path(&uri), Err(UriError::NotLocal(_))));
    }

    #[test]
    fn test_direct_translator_is_identity() {
        let translator = DirectTranslator;
        let path = Path::new("/abs/a.py");
        let uri = translator.to_server_uri(path).unwrap();
        assert_eq!(translator.to_host_path(&uri).unwrap(), path);
    }
}
