use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::ResourceOverflow;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    NotFound,
    Denied,
    Conflict,
    PreconditionFailed,
    BadRequest,
    Transient,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreError {
    pub kind: CoreErrorKind,
    pub message: String,
    pub exceeded: Vec<ResourceOverflow>,
    pub abort: bool,
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn new(kind: CoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exceeded: Vec::new(),
            abort: false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Conflict, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::PreconditionFailed, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::BadRequest, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CoreErrorKind::Internal, message)
    }

    /// Quota exceeded. The message lists every overflowing resource in the
    /// same wording users see on a rejected push.
    pub fn denied(exceeded: Vec<ResourceOverflow>) -> Self {
        let message = exceeded
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            kind: CoreErrorKind::Denied,
            message,
            exceeded,
            abort: false,
        }
    }

    /// Marks the error as permanent so the retry wrapper stops immediately.
    pub fn abort(mut self) -> Self {
        self.abort = true;
        self
    }

    pub fn is_abort(&self) -> bool {
        self.abort
    }

    pub fn is(&self, kind: CoreErrorKind) -> bool {
        self.kind == kind
    }

    pub fn with_context(mut self, context: impl AsRef<str>) -> Self {
        self.message = format!("{}: {}", context.as_ref(), self.message);
        self
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for CoreError {}
