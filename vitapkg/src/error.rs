//! Error types for the download pipeline and the install dispatcher.

use std::io;
use std::path::PathBuf;

/// Result type for pipeline operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Result type for install operations.
pub type InstallResult<T> = Result<T, InstallError>;

/// Everything that can go wrong while streaming a PKG.
///
/// No error is recovered inside the pipeline; all of these abort the
/// session. Cancellation is not an error and never appears here.
#[derive(Debug)]
pub enum DownloadError {
    /// HTTP-level failure: unknown length, failed read, early EOF.
    Transport(String),
    /// The package bytes violate the container format contract.
    Format(String),
    /// The header's file index disagrees with the on-wire layout.
    Ordering { expected: u64, actual: u64 },
    /// A staging-directory operation failed.
    Io { path: PathBuf, source: io::Error },
    /// The final SHA-256 disagrees with the expected digest.
    Integrity,
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::Format(msg) => write!(f, "bad pkg: {msg}"),
            Self::Ordering { expected, actual } => {
                write!(
                    f,
                    "pkg file ordering broken: expected offset {expected}, got {actual}"
                )
            }
            Self::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            Self::Integrity => write!(f, "pkg integrity check failed: digest mismatch"),
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors from post-download placement.
#[derive(Debug)]
pub enum InstallError {
    /// The content id is not a valid 36-character PSN id.
    InvalidContentId(String),
    /// A staged-to-destination move failed.
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    /// Any other filesystem failure.
    Io { path: PathBuf, source: io::Error },
    /// `param.sfo` could not be read or decoded.
    Sfo(String),
    /// `APP_VER` is absent or not exactly five characters.
    BadVersion(String),
    /// The shell application database rejected the update.
    Database(String),
    /// The compatibility pack archive could not be extracted.
    Archive { path: PathBuf, reason: String },
    /// The host promoter refused the package.
    Promote(String),
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidContentId(id) => write!(f, "invalid content id: {id}"),
            Self::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} to {}: {}",
                    from.display(),
                    to.display(),
                    source
                )
            }
            Self::Io { path, source } => {
                write!(f, "I/O error on {}: {}", path.display(), source)
            }
            Self::Sfo(msg) => write!(f, "param.sfo: {msg}"),
            Self::BadVersion(version) => write!(f, "bad APP_VER value: {version:?}"),
            Self::Database(msg) => write!(f, "app database: {msg}"),
            Self::Archive { path, reason } => {
                write!(f, "failed to extract {}: {}", path.display(), reason)
            }
            Self::Promote(msg) => write!(f, "promoter: {msg}"),
        }
    }
}

impl std::error::Error for InstallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rename { source, .. } | Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
