// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Domain error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Errors raised while mutating the in-memory Job/Experiment/Host model.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ModelError {
    /// A host or experiment name collided with an existing active entity.
    #[error("{kind} '{name}' already added! Not adding again.")]
    DuplicateName { kind: &'static str, name: String },

    /// A host or experiment name collided with a draining entity.
    #[error("{kind} '{name}' is pending removal. Please wait for it to be removed and then try adding again.")]
    PendingRemoval { kind: &'static str, name: String },

    /// A host or experiment name collided with the drained set.
    #[error("{kind} '{name}' already drained!")]
    AlreadyDrained { kind: &'static str, name: String },

    /// Referenced entity does not exist.
    #[error("{kind} '{name}' does not exist!")]
    NotFound { kind: &'static str, name: String },
}

/// Errors raised by the host RPC client / worker RPC service boundary.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum RpcError {
    /// The underlying HTTP transport failed (connect, timeout, decode).
    #[error("communication error: {0}")]
    Transport(String),

    /// The worker rejected the request or returned a malformed response.
    #[error("worker error: {0}")]
    Worker(String),

    /// The host has no established connection.
    #[error("not connected to {0}")]
    NotConnected(String),

    /// Attempted to connect twice without disconnecting first.
    #[error("already connected to {0}")]
    AlreadyConnected(String),
}

/// Errors surfaced by the dashboard HTTP surface, mapped to HTTP status codes.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum DashboardError {
    /// Malformed or incomplete request body (400).
    #[error("{0}")]
    BadRequest(String),

    /// Upstream worker unreachable while proxying `/files` (502).
    #[error("{0}")]
    UpstreamUnreachable(String),

    /// Anything else unexpected (500).
    #[error("{0}")]
    Internal(String),
}

impl DashboardError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnreachable(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::UpstreamUnreachable(m) | Self::Internal(m) => m,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: String,
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            ok: false,
            error: self.reason().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Errors surfaced by the worker's `/files` endpoint, mapped to HTTP status
/// codes per spec §4.4.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum WorkerError {
    /// Missing or non-absolute `path` query parameter (400).
    #[error("{0}")]
    BadRequest(String),

    /// Path not present in the worker's allow-list (403).
    #[error("{0}")]
    Forbidden(String),

    /// Allow-listed path does not exist on disk (404).
    #[error("{0}")]
    NotFound(String),

    /// Anything else unexpected (500).
    #[error("{0}")]
    Internal(String),
}

impl WorkerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn reason(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::Forbidden(m) | Self::NotFound(m) | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for WorkerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, self.reason().to_string()).into_response()
    }
}

/// Errors raised while parsing or dispatching operator console commands.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ConsoleError {
    /// The line could not be tokenized or parsed as a known command.
    #[error("{0}")]
    ParseError(String),

    /// The script file failed to load or validate.
    #[error("{0}")]
    ScriptError(String),
}
