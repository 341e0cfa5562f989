//! Dispatch Errors
//!
//! Every failure that can end a dispatch, plus the marker encoding used by the
//! string-returning caller API. Callers that want a typed result use
//! `RouteDispatcher::dispatch_result`; callers that want one uniform code path
//! use `RouteDispatcher::dispatch` and test the returned string with
//! [`is_error_response`].

use std::fmt;

use thiserror::Error;

use crate::backend::BackendError;
use crate::credentials::CredentialError;

/// Prefix of every error-marked response string
pub const ERROR_MARKER_PREFIX: &str = "[switchboard:error:";

/// Stable category of a dispatch failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Route id not registered
    UnknownRoute,
    /// Route disabled and no usable substitute
    RouteDisabled,
    /// Non-retryable backend failure
    Fatal,
    /// Retries exhausted and no fallback edge
    Exhausted,
    /// Retries exhausted on the fallback route as well
    AllRoutesFailed,
    /// Backend succeeded with no content
    NullResponse,
    /// No usable credential
    Credential,
}

impl ErrorKind {
    /// Marker tag for this kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownRoute => "unknown_route",
            Self::RouteDisabled => "route_disabled",
            Self::Fatal => "fatal",
            Self::Exhausted => "exhausted",
            Self::AllRoutesFailed => "all_routes_failed",
            Self::NullResponse => "null_response",
            Self::Credential => "credential",
        }
    }

    /// Parse a marker tag
    #[must_use]
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "unknown_route" => Self::UnknownRoute,
            "route_disabled" => Self::RouteDisabled,
            "fatal" => Self::Fatal,
            "exhausted" => Self::Exhausted,
            "all_routes_failed" => Self::AllRoutesFailed,
            "null_response" => Self::NullResponse,
            "credential" => Self::Credential,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal dispatch failure
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DispatchError {
    /// Route id not registered
    #[error("unknown route {0}")]
    UnknownRoute(u32),

    /// Route disabled and the default route is unusable
    #[error("route {0} is disabled")]
    RouteDisabled(u32),

    /// Non-retryable backend failure
    #[error("route {route}: {source}")]
    Fatal {
        /// Route that failed
        route: u32,
        /// Backend error
        source: BackendError,
    },

    /// Retries exhausted with no fallback edge
    #[error("route {route}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Route that failed
        route: u32,
        /// Attempts made
        attempts: u32,
        /// Last error seen
        last: BackendError,
    },

    /// Fallback route exhausted too; no further hop is taken
    #[error("all routes failed (route {original} then fallback {fallback}): {last}")]
    AllRoutesFailed {
        /// Route originally requested
        original: u32,
        /// Fallback route tried
        fallback: u32,
        /// Last error seen
        last: BackendError,
    },

    /// Backend reported success with empty content
    #[error("route {0} returned an empty response")]
    NullResponse(u32),

    /// No usable credential
    #[error("credential unavailable: {0}")]
    Credential(#[from] CredentialError),
}

impl DispatchError {
    /// Stable category
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownRoute(_) => ErrorKind::UnknownRoute,
            Self::RouteDisabled(_) => ErrorKind::RouteDisabled,
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Exhausted { .. } => ErrorKind::Exhausted,
            Self::AllRoutesFailed { .. } => ErrorKind::AllRoutesFailed,
            Self::NullResponse(_) => ErrorKind::NullResponse,
            Self::Credential(_) => ErrorKind::Credential,
        }
    }

    /// Encode as an error-marked response string
    #[must_use]
    pub fn to_marked_string(&self) -> String {
        format!("{ERROR_MARKER_PREFIX}{}] {self}", self.kind())
    }
}

/// Whether a dispatch response is an error-marked string
#[must_use]
pub fn is_error_response(response: &str) -> bool {
    error_kind_of(response).is_some()
}

/// The error kind encoded in a response string, if it is error-marked
#[must_use]
pub fn error_kind_of(response: &str) -> Option<ErrorKind> {
    let rest = response.strip_prefix(ERROR_MARKER_PREFIX)?;
    let (tag, _) = rest.split_once(']')?;
    ErrorKind::from_tag(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marked_string() {
        let err = DispatchError::UnknownRoute(99);
        let marked = err.to_marked_string();
        assert_eq!(marked, "[switchboard:error:unknown_route] unknown route 99");
        assert!(is_error_response(&marked));
        assert_eq!(error_kind_of(&marked), Some(ErrorKind::UnknownRoute));
    }

    #[test]
    fn test_plain_text_is_not_error() {
        assert!(!is_error_response("hello"));
        assert!(!is_error_response("[switchboard:error:bogus] nope"));
        assert!(!is_error_response(""));
    }

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            ErrorKind::UnknownRoute,
            ErrorKind::RouteDisabled,
            ErrorKind::Fatal,
            ErrorKind::Exhausted,
            ErrorKind::AllRoutesFailed,
            ErrorKind::NullResponse,
            ErrorKind::Credential,
        ] {
            assert_eq!(ErrorKind::from_tag(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_credential_error_converts() {
        let err: DispatchError = CredentialError::AllQuarantined(2).into();
        assert_eq!(err.kind(), ErrorKind::Credential);
    }
}
