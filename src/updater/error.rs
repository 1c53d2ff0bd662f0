//! Update error taxonomy

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::archive::ExtractError;
use crate::catalog::CatalogError;

/// Why a request was refused without doing anything
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Another install task is in flight
    InstallActive,
    /// The install already has this version
    UpToDate(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::InstallActive => write!(f, "an update is already running"),
            Conflict::UpToDate(v) => write!(f, "version {} is already installed", v),
        }
    }
}

/// Broad category of an [`UpdateError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Parse,
    Filesystem,
    ToolUnavailable,
    Extraction,
    Conflict,
    RollbackFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected download page format: {0}")]
    Parse(String),

    #[error("{context}: {source}")]
    Filesystem {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("extraction tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("{0}")]
    Conflict(Conflict),

    /// A failure after the backup rename that was successfully undone
    #[error("{0}")]
    RolledBack(Box<UpdateError>),

    /// The previous install could not be put back; needs the user
    #[error("could not restore {target} from {backup}: {reason} (after: {cause})")]
    RollbackFailed {
        target: PathBuf,
        backup: PathBuf,
        reason: String,
        cause: Box<UpdateError>,
    },
}

impl UpdateError {
    pub fn filesystem(context: impl Into<String>, source: io::Error) -> Self {
        UpdateError::Filesystem {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            UpdateError::Network(_) => ErrorKind::Network,
            UpdateError::Parse(_) => ErrorKind::Parse,
            UpdateError::Filesystem { .. } => ErrorKind::Filesystem,
            UpdateError::ToolUnavailable(_) => ErrorKind::ToolUnavailable,
            UpdateError::Extraction(_) => ErrorKind::Extraction,
            UpdateError::Conflict(_) => ErrorKind::Conflict,
            UpdateError::RolledBack(inner) => inner.kind(),
            UpdateError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
        }
    }

    /// Whether the install directory may be missing or inconsistent
    pub fn is_severe(&self) -> bool {
        matches!(self, UpdateError::RollbackFailed { .. })
    }

    /// One line for the user: what failed, and what happened to the install
    pub fn user_message(&self) -> String {
        match self {
            UpdateError::Network(msg) => format!(
                "Could not reach the Dolphin download server, check your internet connection and retry ({}).",
                msg
            ),
            UpdateError::Parse(msg) => format!(
                "Newest version not detected, the download page format may have changed ({}).",
                msg
            ),
            UpdateError::Filesystem { .. } => format!("Update failed: {}.", self),
            UpdateError::ToolUnavailable(_) => {
                "Update failed: please install 7-Zip. Your installation was not modified.".to_string()
            }
            UpdateError::Extraction(msg) => format!("Update failed while extracting: {}.", msg),
            UpdateError::Conflict(Conflict::InstallActive) => {
                "An update is already running, wait for it to finish.".to_string()
            }
            UpdateError::Conflict(Conflict::UpToDate(_)) => {
                "You already have the most recent version.".to_string()
            }
            UpdateError::RolledBack(inner) => format!(
                "{} Your previous installation was restored.",
                inner.user_message()
            ),
            UpdateError::RollbackFailed { target, backup, .. } => format!(
                "Update failed and the previous installation could not be restored. \
                 Move {} back to {} manually. ({})",
                backup.display(),
                target.display(),
                self
            ),
        }
    }
}

impl From<CatalogError> for UpdateError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::Network(msg) => UpdateError::Network(msg),
            CatalogError::Parse(msg) => UpdateError::Parse(msg),
        }
    }
}

impl From<ExtractError> for UpdateError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::Unavailable(msg) => UpdateError::ToolUnavailable(msg),
            ExtractError::Failed(msg) => UpdateError::Extraction(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolled_back_keeps_inner_kind() {
        let err = UpdateError::RolledBack(Box::new(UpdateError::Extraction("bad crc".into())));
        assert_eq!(err.kind(), ErrorKind::Extraction);
        assert!(!err.is_severe());
        assert!(err.user_message().contains("previous installation was restored"));
        assert!(err.user_message().contains("bad crc"));
    }

    #[test]
    fn test_rollback_failed_is_severe() {
        let err = UpdateError::RollbackFailed {
            target: PathBuf::from("/g/Dolphin"),
            backup: PathBuf::from("/g/.Dolphin.backup"),
            reason: "permission denied".into(),
            cause: Box::new(UpdateError::Extraction("disk full".into())),
        };
        assert!(err.is_severe());
        assert_eq!(err.kind(), ErrorKind::RollbackFailed);
        let msg = err.user_message();
        assert!(msg.contains("/g/.Dolphin.backup"));
        assert!(msg.contains("manually"));
    }

    #[test]
    fn test_catalog_errors_map_to_distinct_kinds() {
        let net: UpdateError = CatalogError::Network("timeout".into()).into();
        let parse: UpdateError = CatalogError::Parse("no link".into()).into();
        assert_eq!(net.kind(), ErrorKind::Network);
        assert_eq!(parse.kind(), ErrorKind::Parse);
        assert_ne!(net.user_message(), parse.user_message());
    }

    #[test]
    fn test_conflict_messages() {
        let busy = UpdateError::Conflict(Conflict::InstallActive);
        let current = UpdateError::Conflict(Conflict::UpToDate("5.0-1".into()));
        assert_eq!(busy.kind(), ErrorKind::Conflict);
        assert_eq!(current.to_string(), "version 5.0-1 is already installed");
        assert_eq!(current.user_message(), "You already have the most recent version.");
    }
}
