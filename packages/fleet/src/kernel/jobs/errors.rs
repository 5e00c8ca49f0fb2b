//! Error taxonomy for handler failures.
//!
//! Every handler error is mapped to an [`ErrorCode`], and the code alone
//! decides what happens next: pause for a human, retry, or fail the job.
//! [`classify`] is the only place in the state machine where error-message
//! string matching is allowed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What the worker does with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Route to the HITL coordinator; on timeout, fail with `hitl_timeout`.
    HitlEligible,
    /// Return to `pending` if `retry_count < max_retries`, else fail.
    Retryable,
    /// Commit `failed` immediately.
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // Human-gated obstacles
    CaptchaBlocked,
    LoginRequired,
    #[serde(rename = "2fa_required")]
    TwofaRequired,
    BotCheck,
    RateLimited,
    VerificationRequired,

    // Transient failures
    NetworkError,
    LlmRateLimit,
    TransientBrowserError,

    // Permanent failures
    UnknownHandler,
    ValidationError,
    PermissionDenied,
    BadInput,
    Timeout,
    HitlTimeout,
    InternalError,
}

impl ErrorCode {
    pub fn policy(&self) -> ErrorPolicy {
        match self {
            ErrorCode::CaptchaBlocked
            | ErrorCode::LoginRequired
            | ErrorCode::TwofaRequired
            | ErrorCode::BotCheck
            | ErrorCode::RateLimited
            | ErrorCode::VerificationRequired => ErrorPolicy::HitlEligible,

            ErrorCode::NetworkError
            | ErrorCode::LlmRateLimit
            | ErrorCode::TransientBrowserError => ErrorPolicy::Retryable,

            ErrorCode::UnknownHandler
            | ErrorCode::ValidationError
            | ErrorCode::PermissionDenied
            | ErrorCode::BadInput
            | ErrorCode::Timeout
            | ErrorCode::HitlTimeout
            | ErrorCode::InternalError => ErrorPolicy::Fatal,
        }
    }

    /// Wire representation used in `error_code` columns and callbacks.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CaptchaBlocked => "captcha_blocked",
            ErrorCode::LoginRequired => "login_required",
            ErrorCode::TwofaRequired => "2fa_required",
            ErrorCode::BotCheck => "bot_check",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::VerificationRequired => "verification_required",
            ErrorCode::NetworkError => "network_error",
            ErrorCode::LlmRateLimit => "llm_rate_limit",
            ErrorCode::TransientBrowserError => "transient_browser_error",
            ErrorCode::UnknownHandler => "unknown_handler",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::BadInput => "bad_input",
            ErrorCode::Timeout => "timeout",
            ErrorCode::HitlTimeout => "hitl_timeout",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// The blocker label written to `interaction_type` for HITL-eligible codes.
    pub fn blocker_type(&self) -> Option<&'static str> {
        match self {
            ErrorCode::CaptchaBlocked => Some("captcha"),
            ErrorCode::LoginRequired => Some("login"),
            ErrorCode::TwofaRequired => Some("2fa"),
            ErrorCode::BotCheck => Some("bot_check"),
            ErrorCode::RateLimited => Some("rate_limited"),
            ErrorCode::VerificationRequired => Some("verification"),
            _ => None,
        }
    }
}

/// Error surfaced by a job handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler knows exactly what went wrong.
    #[error("{message}")]
    Coded { code: ErrorCode, message: String },

    /// Anything else; the message is classified before policy is applied.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        HandlerError::Coded {
            code,
            message: message.into(),
        }
    }

    /// Resolve this error to a code, classifying free-form messages.
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::Coded { code, .. } => *code,
            HandlerError::Other(e) => classify(&e.to_string()),
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Map an error message to an [`ErrorCode`] by substring.
///
/// Checks are ordered most-specific first so that e.g. a message mentioning
/// both "captcha" and "network" pauses rather than retries.
pub fn classify(message: &str) -> ErrorCode {
    let msg = message.to_lowercase();

    // Human-gated obstacles
    if msg.contains("two-factor authentication")
        || msg.contains("verification code")
        || msg.contains("authenticator app")
        || msg.contains("2fa")
    {
        return ErrorCode::TwofaRequired;
    }
    if msg.contains("captcha") || msg.contains("recaptcha") || msg.contains("hcaptcha") {
        return ErrorCode::CaptchaBlocked;
    }
    if msg.contains("sign in")
        || msg.contains("log in")
        || msg.contains("login required")
        || msg.contains("session expired")
        || msg.contains("not authenticated")
    {
        return ErrorCode::LoginRequired;
    }
    if msg.contains("unusual activity")
        || msg.contains("bot check")
        || msg.contains("are you human")
        || msg.contains("cloudflare")
    {
        return ErrorCode::BotCheck;
    }
    if msg.contains("verify your identity") || msg.contains("verify your email") {
        return ErrorCode::VerificationRequired;
    }
    if msg.contains("too many requests") || msg.contains("rate limit") {
        // LLM providers rate limit too, but that is a transient backend error
        // rather than a page-level obstacle.
        if msg.contains("llm") || msg.contains("model") || msg.contains("token") {
            return ErrorCode::LlmRateLimit;
        }
        return ErrorCode::RateLimited;
    }

    // Permanent failures
    if msg.contains("permission denied") || msg.contains("forbidden") {
        return ErrorCode::PermissionDenied;
    }
    if msg.contains("invalid input") || msg.contains("bad input") || msg.contains("missing field")
    {
        return ErrorCode::BadInput;
    }
    if msg.contains("validation") {
        return ErrorCode::ValidationError;
    }

    // Transient failures
    if msg.contains("connection reset")
        || msg.contains("connection refused")
        || msg.contains("network")
        || msg.contains("dns")
        || msg.contains("timed out while connecting")
    {
        return ErrorCode::NetworkError;
    }
    if msg.contains("browser crashed")
        || msg.contains("target closed")
        || msg.contains("page crashed")
        || msg.contains("navigation failed")
    {
        return ErrorCode::TransientBrowserError;
    }

    ErrorCode::InternalError
}
