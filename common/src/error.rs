/*
 * SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Provider protocol error taxonomy.
//!
//! Every backend-specific failure is mapped into exactly one [`ErrorKind`]
//! before it crosses the protocol boundary. The controller decides retry
//! policy from the kind alone and never looks at the message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tonic::{Code, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    /// Transient; retry with backoff.
    Unavailable,
    /// Needs a spec correction; never retried automatically.
    InvalidArgument,
    /// Retryable with backoff.
    Internal,
    Canceled,
    /// The capability behind the call is absent.
    Unimplemented,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::Internal => "Internal",
            ErrorKind::Canceled => "Canceled",
            ErrorKind::Unimplemented => "Unimplemented",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Internal)
    }

    pub fn to_code(self) -> Code {
        match self {
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::Unavailable => Code::Unavailable,
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::Internal => Code::Internal,
            ErrorKind::Canceled => Code::Cancelled,
            ErrorKind::Unimplemented => Code::Unimplemented,
        }
    }

    /// Decode a gRPC status code received by a client.
    ///
    /// Deadline and transport failures count as `Unavailable` so the caller
    /// backs off and retries instead of giving up.
    pub fn from_code(code: Code) -> Self {
        match code {
            Code::NotFound => ErrorKind::NotFound,
            Code::AlreadyExists => ErrorKind::AlreadyExists,
            Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted => {
                ErrorKind::Unavailable
            }
            Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
                ErrorKind::InvalidArgument
            }
            Code::Cancelled => ErrorKind::Canceled,
            Code::Unimplemented => ErrorKind::Unimplemented,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error already classified into the protocol taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Canceled, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }
}

impl From<ProviderError> for Status {
    fn from(err: ProviderError) -> Self {
        Status::new(err.kind.to_code(), err.message)
    }
}

impl From<Status> for ProviderError {
    fn from(status: Status) -> Self {
        ProviderError::new(ErrorKind::from_code(status.code()), status.message())
    }
}
