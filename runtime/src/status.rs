// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A closed, numerically-stable status taxonomy shared by every fallible
//! operation in this crate.
//!
//! Codes 0-16 match the common "canonical" status codes used across several
//! RPC and storage systems; codes 100+ are local extensions specific to the
//! primitives in this crate.

use std::fmt;
use std::sync::Arc;

/// A status code.
///
/// Numeric values are part of the public contract: hosts that bridge this
/// crate's errors to another status taxonomy may rely on the discriminants
/// below matching the canonical 0-16 range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,

    /// A primitive (`Watch`, `Grant`, ...) was closed while a caller was
    /// waiting on it.
    Closed = 100,
    /// `Issuer::issue_grant` or `Grant::spend` failed without waiting due to
    /// insufficient capacity.
    GrantUnavailable = 101,
    /// Sentinel used by iteration helpers to signal early termination; never
    /// produced by this crate's own APIs.
    LoopBreak = 102,
    /// A stream-like `Watch` was closed after reaching its natural end.
    EndOfStream = 103,
    /// A stream-like `Watch` was closed before reaching its natural end.
    ClosedBeforeEndOfStream = 104,
    /// A `Grant` was revoked while a caller was spending from it.
    GrantRevoked = 105,
}

impl StatusCode {
    /// Whether this code represents success.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    const fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
            StatusCode::Closed => "CLOSED",
            StatusCode::GrantUnavailable => "GRANT_UNAVAILABLE",
            StatusCode::LoopBreak => "LOOP_BREAK",
            StatusCode::EndOfStream => "END_OF_STREAM",
            StatusCode::ClosedBeforeEndOfStream => "CLOSED_BEFORE_END_OF_STREAM",
            StatusCode::GrantRevoked => "GRANT_REVOKED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
enum Message {
    None,
    Static(&'static str),
    Owned(Arc<str>),
}

/// A result code carrying an optional human-readable message.
///
/// `Status` is `Clone` (messages are reference-counted when owned) so a
/// single status can be delivered to multiple observers, as happens when a
/// `Watch` or `Grant` closes with a shared status.
#[derive(Clone)]
pub struct Status {
    code: StatusCode,
    message: Message,
}

impl Status {
    /// The canonical success status.
    pub const OK: Status = Status {
        code: StatusCode::Ok,
        message: Message::None,
    };

    #[must_use]
    pub const fn new(code: StatusCode) -> Self {
        Status {
            code,
            message: Message::None,
        }
    }

    #[must_use]
    pub const fn with_message(code: StatusCode, message: &'static str) -> Self {
        Status {
            code,
            message: Message::Static(message),
        }
    }

    #[must_use]
    pub fn with_owned_message(code: StatusCode, message: String) -> Self {
        Status {
            code,
            message: Message::Owned(Arc::from(message)),
        }
    }

    #[must_use]
    pub const fn code(&self) -> StatusCode {
        self.code
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match &self.message {
            Message::None => None,
            Message::Static(s) => Some(s),
            Message::Owned(s) => Some(s),
        }
    }

    /// Maps `Ok` to `Ok(value)`, anything else to `Err(self)`.
    pub fn ok_or<T>(self, value: T) -> StatusOr<T> {
        if self.is_ok() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Status")
            .field("code", &self.code)
            .field("message", &self.message())
            .finish()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {msg}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl core::error::Error for Status {}

impl From<StatusCode> for Status {
    fn from(code: StatusCode) -> Self {
        Status::new(code)
    }
}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

/// The crate-wide result alias: every fallible, recoverable operation
/// returns a value or a [`Status`], never a `Box<dyn Error>`.
pub type StatusOr<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_codes_are_numerically_stable() {
        assert_eq!(StatusCode::Ok as i32, 0);
        assert_eq!(StatusCode::Unauthenticated as i32, 16);
        assert_eq!(StatusCode::Closed as i32, 100);
        assert_eq!(StatusCode::GrantRevoked as i32, 105);
    }

    #[test]
    fn status_display_includes_message() {
        let s = Status::with_message(StatusCode::NotFound, "no such grant");
        assert_eq!(s.to_string(), "NOT_FOUND: no such grant");
    }

    #[test]
    fn ok_or_round_trips() {
        assert_eq!(Status::OK.ok_or(42), Ok(42));
        let err = Status::new(StatusCode::Cancelled).ok_or(42);
        assert_eq!(err, Err(Status::new(StatusCode::Cancelled)));
    }
}
