// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The error type returned by the provisioning engine.
//!
//! The engine talks to a cloud provider that reports failures in many shapes:
//! service errors with a status payload, broken connections, timeouts. The
//! engine itself detects other problems, such as dependency cycles in the
//! declared configuration. All of them are normalized into a single [Error]
//! type, classified by an [ErrorKind].
//!
//! The classification drives the engine policies: transient errors are
//! retried, permission errors fail the affected resource, configuration errors
//! abort the session before any mutation.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Send + Sync>;

/// The classification of an [Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A network problem, a timeout, a rate limit, or a service that is
    /// momentarily unavailable. Retried by the executor.
    Transient,
    /// The calling identity lacks the rights to perform the operation.
    Permission,
    /// The declared configuration is malformed, or contains a dependency
    /// cycle.
    Configuration,
    /// The resource exists but cannot be reconciled in place.
    Conflict,
    /// A transient error persisted past the retry policy limits.
    ExhaustedRetries,
    /// The resource was skipped because one of its dependencies failed.
    DependencyFailed,
    /// The provider reports the resource does not exist.
    NotFound,
    /// The provider rejected one of the resource attributes.
    InvalidArgument,
    /// A quota, as opposed to a rate limit, was exceeded.
    QuotaExceeded,
    /// The session was cancelled before the operation started.
    Cancelled,
}

impl ErrorKind {
    /// The stable name for this kind, as used in logs and summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TransientError",
            Self::Permission => "PermissionError",
            Self::Configuration => "ConfigurationError",
            Self::Conflict => "ConflictError",
            Self::ExhaustedRetries => "ExhaustedRetries",
            Self::DependencyFailed => "DependencyFailed",
            Self::NotFound => "NotFound",
            Self::InvalidArgument => "InvalidArgument",
            Self::QuotaExceeded => "QuotaExceeded",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Classifies a status returned by the provider.
    pub fn from_status(status: &Status) -> Self {
        match status.code {
            Code::Unavailable
            | Code::DeadlineExceeded
            | Code::Aborted
            | Code::Internal
            | Code::Unknown => Self::Transient,
            Code::ResourceExhausted if is_quota(status) => Self::QuotaExceeded,
            Code::ResourceExhausted => Self::Transient,
            Code::PermissionDenied | Code::Unauthenticated => Self::Permission,
            Code::NotFound => Self::NotFound,
            Code::AlreadyExists => Self::Conflict,
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                Self::InvalidArgument
            }
            Code::Cancelled => Self::Cancelled,
            _ => Self::InvalidArgument,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

pub use google_cloud_gax::error::rpc::{Code, Status, StatusDetails};

/// The machine-readable reason in the status details, e.g.
/// `RATE_LIMIT_EXCEEDED`.
pub fn reason(status: &Status) -> Option<&str> {
    status.details.iter().find_map(|d| match d {
        StatusDetails::ErrorInfo(info) if !info.reason.is_empty() => Some(info.reason.as_str()),
        _ => None,
    })
}

/// Returns true if the status reports an exceeded quota.
///
/// Google Cloud uses `RESOURCE_EXHAUSTED` for both rate limits and quotas.
/// Only the latter are permanent.
pub fn is_quota(status: &Status) -> bool {
    if status.code != Code::ResourceExhausted {
        return false;
    }
    status.details.iter().any(|d| match d {
        StatusDetails::QuotaFailure(_) => true,
        StatusDetails::ErrorInfo(info) => info.reason.to_ascii_uppercase().contains("QUOTA"),
        _ => false,
    })
}

/// The error type for all the engine operations.
///
/// # Example
/// ```
/// use wif_provisioner::error::{Code, Error, ErrorKind, Status};
/// let error = Error::service(Status::default().set_code(Code::PermissionDenied));
/// assert_eq!(error.kind(), ErrorKind::Permission);
/// assert!(!error.is_transient());
/// ```
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    status: Option<Box<Status>>,
    source: Option<BoxError>,
}

impl Error {
    /// Creates an error from a status reported by the provider.
    pub fn service(status: Status) -> Self {
        Self {
            kind: ErrorKind::from_status(&status),
            status: Some(Box::new(status)),
            source: None,
        }
    }

    /// A problem in the transport layer, such as a broken connection.
    pub fn io<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Transient, source)
    }

    /// The request did not complete before its deadline.
    pub fn timeout<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Transient, source)
    }

    /// The calling identity cannot be authenticated.
    pub fn authentication<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Permission, source)
    }

    /// The declared configuration is malformed or contains a cycle.
    pub fn configuration<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Configuration, source)
    }

    /// The resource exists and cannot be reconciled in place.
    pub fn conflict<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Conflict, source)
    }

    /// A resource attribute has an invalid value.
    pub fn invalid_argument<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::InvalidArgument, source)
    }

    /// The resource was not processed because a dependency failed.
    pub fn dependency_failed<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::DependencyFailed, source)
    }

    /// The session was cancelled before the operation started.
    pub fn cancelled<T: Into<BoxError>>(source: T) -> Self {
        Self::new(ErrorKind::Cancelled, source)
    }

    /// The retry policy gave up on a retryable error.
    ///
    /// The last error is preserved as the source, and its status (if any) is
    /// kept for diagnostics.
    pub fn exhausted(last: Error) -> Self {
        Self {
            kind: ErrorKind::ExhaustedRetries,
            status: last.status.clone(),
            source: Some(Box::new(last)),
        }
    }

    fn new<T: Into<BoxError>>(kind: ErrorKind, source: T) -> Self {
        Self {
            kind,
            status: None,
            source: Some(source.into()),
        }
    }

    /// The classification for this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The status reported by the provider, if any.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_deref()
    }

    /// Returns true if the error is transient and the operation may succeed if
    /// attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient)
    }

    /// Returns true if the provider reports the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ErrorKind::NotFound)
    }

    /// Returns true if the error should abort the whole session.
    pub fn is_configuration(&self) -> bool {
        matches!(self.kind, ErrorKind::Configuration)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.status, &self.source) {
            (ErrorKind::ExhaustedRetries, _, Some(e)) => {
                write!(f, "retry policy exhausted, last error: {e}")
            }
            (_, Some(s), None) => write!(
                f,
                "the provider reports an error with code {} described as: {}",
                s.code, s.message
            ),
            (kind, _, Some(e)) => write!(f, "{kind}: {e}"),
            (kind, None, None) => write!(f, "{kind}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl Serialize for Error {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Error", 3)?;
        state.serialize_field("kind", &self.kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.serialize_field("status", &self.status.as_deref().map(StatusSummary::new))?;
        state.end()
    }
}

// The wire format of [Status] uses numeric codes, summaries use the names.
#[derive(serde::Serialize)]
struct StatusSummary<'a> {
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl<'a> StatusSummary<'a> {
    fn new(status: &'a Status) -> Self {
        Self {
            code: status.code.name(),
            message: &status.message,
            reason: reason(status),
        }
    }
}
