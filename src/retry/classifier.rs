//! Error Classifier (§4.C).
//!
//! Grounded on the dual-level retryability matcher in the teacher's
//! `router/llm_based.rs::is_retryable_error` (typed errors matched
//! structurally, with a conservative default for anything unrecognized) —
//! here closed entirely over one `ErrorKind` enum instead of a mix of typed
//! and string-matched errors.

use std::time::Duration;

use crate::error::ErrorKind;

/// What actually went wrong on one forward attempt. Built by the Retry
/// Controller / Stream Processor from the underlying `reqwest`/io error or
/// observed HTTP status; classified into the closed `ErrorKind` taxonomy.
#[derive(Debug, Clone)]
pub enum ForwardFailure {
    ClientCancelled,
    Network(String),
    Timeout,
    Http { status: u16, retry_after: Option<Duration> },
    Stream(String),
    Parsing(String),
    Unknown(String),
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub kind: ErrorKind,
    pub suggested_delay: Option<Duration>,
}

pub fn classify(failure: &ForwardFailure) -> ErrorContext {
    match failure {
        ForwardFailure::ClientCancelled => ErrorContext { kind: ErrorKind::ClientCancel, suggested_delay: None },
        ForwardFailure::Network(_) => ErrorContext { kind: ErrorKind::Network, suggested_delay: None },
        ForwardFailure::Timeout => ErrorContext { kind: ErrorKind::Timeout, suggested_delay: None },
        ForwardFailure::Http { status, retry_after } => {
            let kind = match *status {
                401 | 403 => ErrorKind::Auth,
                429 => ErrorKind::RateLimit,
                s if (400..500).contains(&s) => ErrorKind::Http4xx,
                s if (500..600).contains(&s) => ErrorKind::Server5xx,
                _ => ErrorKind::Unknown,
            };
            ErrorContext { kind, suggested_delay: *retry_after }
        }
        ForwardFailure::Stream(_) => ErrorContext { kind: ErrorKind::Stream, suggested_delay: None },
        ForwardFailure::Parsing(_) => ErrorContext { kind: ErrorKind::Parsing, suggested_delay: None },
        ForwardFailure::Unknown(_) => ErrorContext { kind: ErrorKind::Unknown, suggested_delay: None },
    }
}
