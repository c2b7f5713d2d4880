//! Error handling for the AWL CPU engine
//!
//! Every fallible operation in the engine returns an [`AwlError`]. The four
//! kinds mirror how the scan loop reacts to them:
//!
//! * `Compile` - raised while translating raw blocks, never retried.
//! * `Fault` - raised while running user code, halts the CPU.
//! * `Maintenance` - a cooperative control signal, not an error in the program.
//! * `Bug` - an engine invariant broke.

use crate::source_loc::SourceLocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cooperative control requests delivered through the error channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaintenanceRequest {
    SoftReboot,
    Shutdown,
    Stop,
    RuntimeTimeout,
}

impl fmt::Display for MaintenanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceRequest::SoftReboot => write!(f, "soft reboot requested"),
            MaintenanceRequest::Shutdown => write!(f, "shutdown requested"),
            MaintenanceRequest::Stop => write!(f, "CPU stop requested"),
            MaintenanceRequest::RuntimeTimeout => write!(f, "runtime limit reached"),
        }
    }
}

/// Where an error happened. Fields stay `None` until someone up the
/// call chain knows them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub location: Option<SourceLocation>,
    pub insn: Option<String>,
    pub dump: Option<String>,
}

impl ErrorContext {
    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.insn.is_none()
    }

    /// Copy over every field of `other` that is still unset here
    fn fill_from(&mut self, other: ErrorContext) {
        if self.location.is_none() {
            self.location = other.location;
        }
        if self.insn.is_none() {
            self.insn = other.insn;
        }
        if self.dump.is_none() {
            self.dump = other.dump;
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.location, &self.insn) {
            (Some(loc), Some(insn)) => write!(f, " (at {}: '{}')", loc, insn),
            (Some(loc), None) => write!(f, " (at {})", loc),
            (None, Some(insn)) => write!(f, " (in '{}')", insn),
            (None, None) => Ok(()),
        }
    }
}

/// Main engine error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AwlError {
    #[error("Compile error: {message}{context}")]
    Compile {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime fault: {message}{context}")]
    Fault {
        message: String,
        context: ErrorContext,
    },

    #[error("Maintenance request: {request}")]
    Maintenance { request: MaintenanceRequest },

    #[error("Internal error: {message}{context}\nThis is a bug in the engine. Please report this.")]
    Bug {
        message: String,
        context: ErrorContext,
    },
}

impl AwlError {
    /// Create a translation-time error
    pub fn compile(message: impl Into<String>) -> Self {
        AwlError::Compile {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create a runtime fault
    pub fn fault(message: impl Into<String>) -> Self {
        AwlError::Fault {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    /// Create an internal invariant violation
    pub fn bug(message: impl Into<String>) -> Self {
        AwlError::Bug {
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn maintenance(request: MaintenanceRequest) -> Self {
        AwlError::Maintenance { request }
    }

    pub fn is_maintenance(&self) -> bool {
        matches!(self, AwlError::Maintenance { .. })
    }

    pub fn maintenance_request(&self) -> Option<MaintenanceRequest> {
        match self {
            AwlError::Maintenance { request } => Some(*request),
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            AwlError::Compile { message, .. }
            | AwlError::Fault { message, .. }
            | AwlError::Bug { message, .. } => message.clone(),
            AwlError::Maintenance { request } => request.to_string(),
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            AwlError::Compile { context, .. }
            | AwlError::Fault { context, .. }
            | AwlError::Bug { context, .. } => Some(context),
            AwlError::Maintenance { .. } => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            AwlError::Compile { context, .. }
            | AwlError::Fault { context, .. }
            | AwlError::Bug { context, .. } => Some(context),
            AwlError::Maintenance { .. } => None,
        }
    }

    /// Attach context. Fields that an inner frame already set are kept.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.fill_from(context);
        }
        self
    }

    pub fn with_location(self, location: SourceLocation) -> Self {
        self.with_context(ErrorContext {
            location: Some(location),
            ..ErrorContext::default()
        })
    }

    pub fn with_insn(self, insn: impl Into<String>) -> Self {
        self.with_context(ErrorContext {
            insn: Some(insn.into()),
            ..ErrorContext::default()
        })
    }

    /// Attach a CPU state dump for diagnostics
    pub fn with_dump(self, dump: String) -> Self {
        self.with_context(ErrorContext {
            dump: Some(dump),
            ..ErrorContext::default()
        })
    }

    pub fn dump(&self) -> Option<&str> {
        self.context().and_then(|c| c.dump.as_deref())
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for AwlError {
    fn from(err: std::io::Error) -> Self {
        AwlError::fault(format!("I/O error: {}", err))
    }
}

/// Convert from String (for simple error cases)
pub type AwlResult<T> = Result<T, AwlError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_context_first_catch_wins() {
        let err = AwlError::fault("Division by zero")
            .with_insn("/I")
            .with_insn("CALL FC 1")
            .with_location(SourceLocation::new(1, "main.awl", 12));

        let ctx = err.context().expect("Should have context");
        assert_eq!(ctx.insn.as_deref(), Some("/I"));
        assert_eq!(ctx.location.as_ref().map(|l| l.line), Some(12));
    }

    #[test]
    fn test_maintenance_has_no_context() {
        let err = AwlError::maintenance(MaintenanceRequest::Stop).with_insn("BE");
        assert!(err.is_maintenance());
        assert!(err.context().is_none());
        assert_eq!(err.maintenance_request(), Some(MaintenanceRequest::Stop));
    }

    #[test]
    fn test_display() {
        let err = AwlError::compile("Invalid bit address")
            .with_location(SourceLocation::new(0, "ob1.awl", 3))
            .with_insn("U M 1.9");
        assert_eq!(
            err.to_string(),
            "Compile error: Invalid bit address (at ob1.awl:3: 'U M 1.9')"
        );

        let bug = AwlError::bug("operand not resolved");
        assert!(bug.to_string().contains("Please report this"));
    }
}
