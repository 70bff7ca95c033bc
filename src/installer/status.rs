//! Session outcomes and validation responses

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of an installation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallationStatus {
    /// Every write landed and verified, no collisions needed resolving
    Success,
    /// Committed, but at least one collision was resolved by precedence
    ResolvableConflict,
    /// A collision could not be resolved; nothing was written
    UnresolvableConflict,
    /// Rollback itself failed; the target may be partially modified
    RolledBackError,
    /// I/O, tool or verification failure; all changes were rolled back
    FatalError,
    /// A write instruction was malformed; nothing was written
    InvalidActions,
}

impl InstallationStatus {
    /// Session committed its changes
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            InstallationStatus::Success | InstallationStatus::ResolvableConflict
        )
    }

    /// The target is known to be byte-identical to its pre-session state.
    ///
    /// Never true for `RolledBackError`.
    pub fn target_untouched(&self) -> bool {
        matches!(
            self,
            InstallationStatus::UnresolvableConflict
                | InstallationStatus::FatalError
                | InstallationStatus::InvalidActions
        )
    }

    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            InstallationStatus::Success => 0,
            InstallationStatus::ResolvableConflict => 0,
            InstallationStatus::UnresolvableConflict => 2,
            InstallationStatus::InvalidActions => 3,
            InstallationStatus::FatalError => 4,
            InstallationStatus::RolledBackError => 5,
        }
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstallationStatus::Success => "Success",
            InstallationStatus::ResolvableConflict => "ResolvableConflict",
            InstallationStatus::UnresolvableConflict => "UnresolvableConflict",
            InstallationStatus::RolledBackError => "RolledBackError",
            InstallationStatus::FatalError => "FatalError",
            InstallationStatus::InvalidActions => "InvalidActions",
        };
        f.write_str(name)
    }
}

/// Severity of a validation response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    None,
    Warning,
    Error,
}

/// One reported finding (collision or per-file outcome)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResponse {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl ValidationResponse {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            destination: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::None, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn for_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

impl fmt::Display for ValidationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::None => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        match &self.destination {
            Some(dest) => write!(f, "[{}] {}: {}", tag, dest, self.message),
            None => write!(f, "[{}] {}", tag, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolled_back_error_is_never_untouched() {
        assert!(!InstallationStatus::RolledBackError.target_untouched());
        assert!(!InstallationStatus::RolledBackError.is_success());
        assert!(InstallationStatus::FatalError.target_untouched());
        assert!(InstallationStatus::ResolvableConflict.is_success());
    }

    #[test]
    fn test_response_display() {
        let r = ValidationResponse::warning("overlap").for_destination("Data/a.bin");
        assert_eq!(r.to_string(), "[warning] Data/a.bin: overlap");
        assert_eq!(ValidationResponse::error("boom").to_string(), "[error] boom");
    }
}
