//! Error taxonomy for Hearth.
//!
//! Most plumbing propagates `anyhow::Error` with context attached. The variants here are
//! the failures callers need to tell apart: `main` picks the exit code from them and the
//! orchestrator tests assert on them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    /// The manifest asks for an admin install and the process is not elevated.
    #[error("installation requires administrator privileges")]
    InsufficientPrivileges,

    /// The user declined closing the running application.
    #[error("{exe} is running and closing it was declined; no files were modified")]
    CloseDenied { exe: String },

    /// The application kept running after a forced close.
    #[error("{exe} is still running after a forced close ({remaining} instance(s) left)")]
    CloseFailed { exe: String, remaining: usize },

    /// The install root belongs to a different product.
    #[error("install root already holds product '{found}', refusing to install '{expected}' over it")]
    ForeignProduct { expected: String, found: String },

    /// A registry write failed. Nothing registered before the failure is rolled back.
    #[error("registry write failed for {key}: {source}")]
    RegistryWrite {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("nothing is installed at {0}")]
    NotInstalled(String),
}

impl InstallError {
    /// Process exit code for this failure. Cancellation is reported apart from errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            InstallError::CloseDenied { .. } => 2,
            _ => 1,
        }
    }
}

/// Exit code for any error, falling back to `1` when it is not an [`InstallError`].
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<InstallError>()
        .map(InstallError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_denied_maps_to_cancel_code() {
        let err = anyhow::Error::new(InstallError::CloseDenied { exe: "app.exe".into() });
        assert_eq!(exit_code_for(&err), 2);
    }

    #[test]
    fn other_failures_map_to_one() {
        let err = anyhow::Error::new(InstallError::InsufficientPrivileges);
        assert_eq!(exit_code_for(&err), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("plain")), 1);
    }

    #[test]
    fn downcast_survives_context() {
        let err = anyhow::Error::new(InstallError::NotInstalled("C:\\Apps\\X".into()))
            .context("uninstall");
        assert_eq!(exit_code_for(&err), 1);
        assert!(err.downcast_ref::<InstallError>().is_some());
    }
}
