use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed taxonomy for failures crossing the client/runtime boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    SdkUnavailable,
    ResumeInvalid,
    AuthError,
    Cancelled,
    RateLimited,
    SdkError,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SdkUnavailable => "sdk_unavailable",
            Self::ResumeInvalid => "resume_invalid",
            Self::AuthError => "auth_error",
            Self::Cancelled => "cancelled",
            Self::RateLimited => "rate_limited",
            Self::SdkError => "sdk_error",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps raw backend error text onto [`ErrorClass`] by keyword.
///
/// Best effort: unfamiliar wording lands in [`ErrorClass::SdkError`].
#[must_use]
pub fn classify_error(message: &str) -> ErrorClass {
    let low = message.to_lowercase();

    let session_gone = low.contains("session")
        && (low.contains("not found") || low.contains("invalid") || low.contains("expired"));
    if low.contains("resume") || session_gone {
        return ErrorClass::ResumeInvalid;
    }
    if low.contains("auth") || low.contains("api key") || low.contains("401") || low.contains("403")
    {
        return ErrorClass::AuthError;
    }
    if low.contains("cancel") || low.contains("interrupt") {
        return ErrorClass::Cancelled;
    }
    if low.contains("rate") || low.contains("429") {
        return ErrorClass::RateLimited;
    }

    ErrorClass::SdkError
}

/// Error returned by an agent client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    message: String,
    class: ErrorClass,
}

impl ClientError {
    /// Creates an error and classifies it from its text.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_error(&message);
        Self { message, class }
    }

    #[must_use]
    pub fn with_class(message: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            message: message.into(),
            class,
        }
    }

    #[must_use]
    pub fn cancelled() -> Self {
        Self::with_class("request cancelled", ErrorClass::Cancelled)
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::with_class(message, ErrorClass::SdkUnavailable)
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.class
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ClientError {}

impl From<String> for ClientError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ClientError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
